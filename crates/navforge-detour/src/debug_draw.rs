//! Debug geometry for navigation meshes and paths
//!
//! Every function returns a flat vertex list. Meshes come back as triangle
//! lists, everything else as line lists.

use navforge_common::debug::{push_line, push_triangle, Color, DebugVertex};

use crate::nav_mesh::NavMesh;
use crate::{PolyRef, EXT_LINK};

/// Lift applied to lines so they do not z-fight with the surface
const LINE_LIFT: f32 = 0.01;

const BOUNDARY_COLOR: Color = Color::new(0.0, 0.19, 0.25, 0.86);
const INNER_EDGE_COLOR: Color = Color::new(0.0, 0.19, 0.25, 0.25);
const PORTAL_COLOR: Color = Color::new(0.5, 0.0, 0.5, 0.5);
const PATH_COLOR: Color = Color::ORANGE;
const CORRIDOR_COLOR: Color = Color::CYAN;
const OFF_MESH_COLOR: Color = Color::new(1.0, 0.75, 0.0, 0.9);

fn lift(p: [f32; 3]) -> [f32; 3] {
    [p[0], p[1] + LINE_LIFT, p[2]]
}

/// Triangles of the detail surface of every ground polygon, colored by area
pub fn draw_nav_mesh(nav_mesh: &NavMesh) -> Vec<DebugVertex> {
    let mut out = Vec::new();
    for (_, tile) in nav_mesh.tiles() {
        for (i, poly) in tile.polys.iter().enumerate() {
            if poly.is_off_mesh() {
                continue;
            }
            let color = Color::from_id(poly.area as u32).with_alpha(0.5);
            let Some(d) = tile.detail_meshes.get(i) else {
                continue;
            };
            let base = d.vert_base as usize;
            let tris = &tile.detail_tris[d.tri_base as usize..(d.tri_base + d.tri_count) as usize];
            for t in tris {
                push_triangle(
                    &mut out,
                    tile.detail_verts[base + t[0] as usize],
                    tile.detail_verts[base + t[1] as usize],
                    tile.detail_verts[base + t[2] as usize],
                    color,
                );
            }
        }
    }
    out
}

/// Polygon edges: outer boundaries, shared inner edges (once each) and
/// tile portals in distinct colors
pub fn draw_nav_mesh_edges(nav_mesh: &NavMesh) -> Vec<DebugVertex> {
    let mut out = Vec::new();
    for (_, tile) in nav_mesh.tiles() {
        for (i, poly) in tile.polys.iter().enumerate() {
            if poly.is_off_mesh() {
                continue;
            }
            let verts = tile.poly_vertices(poly);
            let n = verts.len();
            for j in 0..n {
                let nei = poly.neighbors[j];
                let color = if nei == 0 {
                    BOUNDARY_COLOR
                } else if nei & EXT_LINK != 0 {
                    PORTAL_COLOR
                } else if (nei - 1) as usize > i {
                    INNER_EDGE_COLOR
                } else {
                    continue;
                };
                push_line(&mut out, lift(verts[j]), lift(verts[(j + 1) % n]), color);
            }
        }
    }
    out
}

/// Line strip through flat `[x, y, z, ...]` waypoints
pub fn draw_path(points: &[f32]) -> Vec<DebugVertex> {
    let mut out = Vec::new();
    let pts: Vec<[f32; 3]> = points.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
    for w in pts.windows(2) {
        push_line(&mut out, lift(w[0]), lift(w[1]), PATH_COLOR);
    }
    out
}

/// Lines between the centers of consecutive corridor polygons. Handles that
/// no longer resolve are drawn at the origin to keep the segment count.
pub fn draw_polygon_corridor(nav_mesh: &NavMesh, path: &[PolyRef]) -> Vec<DebugVertex> {
    let mut out = Vec::new();
    let centers: Vec<[f32; 3]> = path
        .iter()
        .map(|&r| nav_mesh.poly_center(r).unwrap_or([0.0; 3]))
        .collect();
    for w in centers.windows(2) {
        push_line(&mut out, lift(w[0]), lift(w[1]), CORRIDOR_COLOR);
    }
    out
}

/// One line per off-mesh connection, from its start to its end point
pub fn draw_off_mesh_connections(nav_mesh: &NavMesh) -> Vec<DebugVertex> {
    let mut out = Vec::new();
    for (_, tile) in nav_mesh.tiles() {
        for con in &tile.off_mesh_links {
            push_line(&mut out, lift(con.start), lift(con.end), OFF_MESH_COLOR);
        }
    }
    out
}
