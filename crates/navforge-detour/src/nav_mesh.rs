//! Navigation mesh made of independently added and removed tiles
//!
//! Polygons within a tile are linked through their neighbour slots when the
//! tile is added. Edges flagged with [`EXT_LINK`] are stitched to the
//! matching boundary edges of the four neighbouring tiles, and off-mesh
//! connections are linked to the ground polygons under their end points as
//! soon as those polygons exist.

use std::collections::HashMap;
use std::ops::Deref;

use navforge_common::math::{vdist_2d_sqr, vlerp};

use crate::bv_tree::{self, Aabb, BVNode};
use crate::geometry::{
    closest_height_point_triangle, closest_point_on_boundary, point_in_polygon, poly_center,
    project_on_segment_2d,
};
use crate::{
    NavMeshParams, PolyFlags, PolyRef, PolyType, Result, Status, EXT_LINK, LINK_INTERNAL,
    MAX_VERTS_PER_POLY, OFF_MESH_EDGE,
};

/// Tile grid offsets for the four portal directions (-x, +z, +x, -z)
const TILE_DIR_X: [i32; 4] = [-1, 0, 1, 0];
const TILE_DIR_Z: [i32; 4] = [0, 1, 0, -1];
/// Maximum distance between two tile boundary lines that still match
const BOUNDARY_EPS: f32 = 0.01;
const SALT_MAX: u32 = 0xffff;
const POLY_MAX: usize = 1 << 24;

/// Directed connection from one polygon to another
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Link {
    pub reference: PolyRef,
    /// Next link of the same polygon
    pub next: Option<usize>,
    /// Edge of the owning polygon the link crosses
    pub edge: u8,
    /// Portal direction for cross-tile links, [`LINK_INTERNAL`] otherwise
    pub side: u8,
    /// Covered part of the edge, 0..=255 from the edge start
    pub bmin: u8,
    pub bmax: u8,
}

impl Link {
    fn internal(reference: PolyRef, edge: u8) -> Self {
        Self {
            reference,
            next: None,
            edge,
            side: LINK_INTERNAL,
            bmin: 0,
            bmax: 255,
        }
    }

    /// True when the link covers only part of its edge
    pub fn is_partial(&self) -> bool {
        self.side != LINK_INTERNAL && (self.bmin != 0 || self.bmax != 255)
    }
}

/// Polygon of a tile
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Poly {
    pub first_link: Option<usize>,
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per edge: 0 for a wall, `index + 1` for a polygon in the same tile,
    /// or [`EXT_LINK`] | direction for a tile boundary portal
    pub neighbors: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            first_link: None,
            verts: [0; MAX_VERTS_PER_POLY],
            neighbors: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            poly_type,
        }
    }

    pub fn vert_indices(&self) -> &[u16] {
        &self.verts[..self.vert_count as usize]
    }

    pub fn is_off_mesh(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }
}

/// Detail sub-mesh of one polygon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyDetail {
    pub vert_base: u32,
    pub vert_count: u32,
    pub tri_base: u32,
    pub tri_count: u32,
}

/// Off-mesh connection stored in the tile that holds its start point
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshLink {
    pub start: [f32; 3],
    pub end: [f32; 3],
    pub radius: f32,
    /// Index of the connection polygon in the tile
    pub poly: u16,
    pub bidirectional: bool,
    pub user_id: u32,
}

/// Tile placement and the agent parameters it was built for
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileHeader {
    pub x: i32,
    pub z: i32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
}

impl TileHeader {
    pub fn new(x: i32, z: i32) -> Self {
        Self {
            x,
            z,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            walkable_height: 0.0,
            walkable_radius: 0.0,
            walkable_climb: 0.0,
        }
    }
}

/// Vertices of one polygon, copied out of the tile
#[derive(Debug, Clone, Copy)]
pub struct PolyVerts {
    verts: [[f32; 3]; MAX_VERTS_PER_POLY],
    len: usize,
}

impl Deref for PolyVerts {
    type Target = [[f32; 3]];

    fn deref(&self) -> &[[f32; 3]] {
        &self.verts[..self.len]
    }
}

/// One tile of polygons with its links, detail mesh and BV tree
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshTile {
    pub header: TileHeader,
    pub verts: Vec<[f32; 3]>,
    pub polys: Vec<Poly>,
    pub links: Vec<Link>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<[f32; 3]>,
    pub detail_tris: Vec<[u8; 3]>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_links: Vec<OffMeshLink>,
}

impl MeshTile {
    pub fn new(header: TileHeader) -> Self {
        Self {
            header,
            verts: Vec::new(),
            polys: Vec::new(),
            links: Vec::new(),
            detail_meshes: Vec::new(),
            detail_verts: Vec::new(),
            detail_tris: Vec::new(),
            bv_tree: Vec::new(),
            off_mesh_links: Vec::new(),
        }
    }

    pub fn poly_count(&self) -> usize {
        self.polys.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.verts.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn detail_triangle_count(&self) -> usize {
        self.detail_tris.len()
    }

    pub fn poly_vertices(&self, poly: &Poly) -> PolyVerts {
        let mut out = PolyVerts {
            verts: [[0.0; 3]; MAX_VERTS_PER_POLY],
            len: poly.vert_count as usize,
        };
        for (dst, &v) in out.verts.iter_mut().zip(poly.vert_indices()) {
            *dst = self.verts[v as usize];
        }
        out
    }

    /// Links of `poly`, most recently added first
    pub fn links_of<'a>(&'a self, poly: &Poly) -> impl Iterator<Item = &'a Link> + 'a {
        let mut cur = poly.first_link;
        std::iter::from_fn(move || {
            let idx = cur?;
            let link = self.links.get(idx)?;
            cur = link.next;
            Some(link)
        })
    }

    /// Rebuilds the BV tree over the ground polygons
    pub fn build_bv_tree(&mut self) {
        let items: Vec<(usize, Aabb)> = self
            .polys
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_off_mesh())
            .map(|(i, p)| {
                let mut b = Aabb::empty();
                for &v in p.vert_indices() {
                    b.expand_point(&self.verts[v as usize]);
                }
                if let Some(d) = self.detail_meshes.get(i) {
                    let base = d.vert_base as usize;
                    for v in &self.detail_verts[base..base + d.vert_count as usize] {
                        b.expand_point(v);
                    }
                }
                (i, b)
            })
            .collect();
        self.bv_tree = bv_tree::build(&items);
    }

    /// Indices of polygons whose bounds overlap `bmin`..`bmax`. Off-mesh
    /// connection polygons are never returned.
    pub fn query_polygons(&self, bmin: &[f32; 3], bmax: &[f32; 3]) -> Vec<usize> {
        let mut out = Vec::new();
        if !self.bv_tree.is_empty() {
            bv_tree::query(&self.bv_tree, bmin, bmax, &mut out);
            return out;
        }
        for (i, poly) in self.polys.iter().enumerate() {
            if poly.is_off_mesh() {
                continue;
            }
            let mut b = Aabb::empty();
            for &v in poly.vert_indices() {
                b.expand_point(&self.verts[v as usize]);
            }
            if b.overlaps(bmin, bmax) {
                out.push(i);
            }
        }
        out
    }

    /// Height of the detail surface of ground polygon `poly` at the xz
    /// position of `pos`
    pub fn poly_height(&self, poly: usize, pos: &[f32; 3]) -> Option<f32> {
        let d = self.detail_meshes.get(poly)?;
        let base = d.vert_base as usize;
        for t in &self.detail_tris[d.tri_base as usize..(d.tri_base + d.tri_count) as usize] {
            let a = &self.detail_verts[base + t[0] as usize];
            let b = &self.detail_verts[base + t[1] as usize];
            let c = &self.detail_verts[base + t[2] as usize];
            if let Some(h) = closest_height_point_triangle(pos, a, b, c) {
                return Some(h);
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
struct TileSlot {
    salt: u32,
    tile: Option<MeshTile>,
}

/// Tiled navigation mesh
#[derive(Debug, Clone)]
pub struct NavMesh {
    params: NavMeshParams,
    slots: Vec<TileSlot>,
    lookup: HashMap<(i32, i32), usize>,
}

impl NavMesh {
    pub fn new(params: NavMeshParams) -> Self {
        Self {
            params,
            slots: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    /// Number of tiles currently in the mesh
    pub fn tile_count(&self) -> usize {
        self.lookup.len()
    }

    pub fn max_tiles(&self) -> usize {
        self.params.max_tiles
    }

    pub fn get_tile(&self, index: usize) -> Option<&MeshTile> {
        self.slots.get(index)?.tile.as_ref()
    }

    pub(crate) fn get_tile_mut(&mut self, index: usize) -> Option<&mut MeshTile> {
        self.slots.get_mut(index)?.tile.as_mut()
    }

    pub fn get_tile_at(&self, x: i32, z: i32) -> Option<&MeshTile> {
        self.get_tile(self.tile_index_at(x, z)?)
    }

    pub fn tile_index_at(&self, x: i32, z: i32) -> Option<usize> {
        self.lookup.get(&(x, z)).copied()
    }

    /// Occupied tiles with their slot index, in slot order
    pub fn tiles(&self) -> impl Iterator<Item = (usize, &MeshTile)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.tile.as_ref().map(|t| (i, t)))
    }

    pub fn total_poly_count(&self) -> usize {
        self.tiles().map(|(_, t)| t.poly_count()).sum()
    }

    /// Tile grid location containing the world position
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let o = &self.params.origin;
        (
            ((pos[0] - o[0]) / self.params.tile_width).floor() as i32,
            ((pos[2] - o[2]) / self.params.tile_height).floor() as i32,
        )
    }

    /// Handle of polygon `poly` in tile slot `tile_index`
    pub fn poly_ref(&self, tile_index: usize, poly: usize) -> PolyRef {
        let salt = self.slots.get(tile_index).map_or(0, |s| s.salt);
        PolyRef::new(salt, tile_index as u32, poly as u32)
    }

    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.get_tile_and_poly(reference).is_ok()
    }

    pub fn get_tile_and_poly(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        if reference.is_null() {
            return Err(Status::InvalidParam);
        }
        let slot = self.slots.get(reference.tile_index()).ok_or(Status::InvalidParam)?;
        if slot.salt != reference.salt() {
            return Err(Status::InvalidParam);
        }
        let tile = slot.tile.as_ref().ok_or(Status::InvalidParam)?;
        let poly = tile.polys.get(reference.poly_index()).ok_or(Status::InvalidParam)?;
        Ok((tile, poly))
    }

    /// Adds a tile and links it to its neighbours. Returns the tile slot.
    pub fn add_tile(&mut self, mut tile: MeshTile) -> Result<usize> {
        let key = (tile.header.x, tile.header.z);
        if self.lookup.contains_key(&key) {
            return Err(Status::AlreadyExists);
        }
        if tile.polys.len() > self.params.max_polys_per_tile.min(POLY_MAX) {
            return Err(Status::InvalidParam);
        }
        if tile.detail_meshes.len() < tile.polys.len() {
            return Err(Status::DataCorrupted);
        }

        let index = match self.slots.iter().position(|s| s.tile.is_none()) {
            Some(i) => i,
            None => {
                if self.slots.len() >= self.params.max_tiles {
                    return Err(Status::BufferTooSmall);
                }
                self.slots.push(TileSlot { salt: 1, tile: None });
                self.slots.len() - 1
            }
        };

        tile.links.clear();
        for poly in tile.polys.iter_mut() {
            poly.first_link = None;
        }
        if tile.bv_tree.is_empty() {
            tile.build_bv_tree();
        }

        self.slots[index].tile = Some(tile);
        self.lookup.insert(key, index);

        self.connect_int_links(index);
        for dir in 0..4 {
            let nx = key.0 + TILE_DIR_X[dir];
            let nz = key.1 + TILE_DIR_Z[dir];
            if let Some(neighbor) = self.tile_index_at(nx, nz) {
                self.connect_ext_links(index, neighbor, dir as u8);
                self.connect_ext_links(neighbor, index, ((dir + 2) % 4) as u8);
            }
        }
        self.connect_off_mesh_links();

        log::debug!(
            "Added tile ({}, {}) in slot {} with {} polygons",
            key.0,
            key.1,
            index,
            self.slots[index].tile.as_ref().map_or(0, |t| t.poly_count())
        );
        Ok(index)
    }

    /// Removes the tile in slot `index` and invalidates all handles into it
    pub fn remove_tile(&mut self, index: usize) -> Result<MeshTile> {
        let slot = self.slots.get_mut(index).ok_or(Status::InvalidParam)?;
        let mut tile = slot.tile.take().ok_or(Status::NotFound)?;
        slot.salt = if slot.salt >= SALT_MAX { 1 } else { slot.salt + 1 };
        self.lookup.remove(&(tile.header.x, tile.header.z));

        for i in 0..self.slots.len() {
            if let Some(other) = self.slots[i].tile.as_mut() {
                if other.links.iter().any(|l| l.reference.tile_index() == index) {
                    retain_links(other, |l| l.reference.tile_index() != index);
                }
            }
        }

        tile.links.clear();
        for poly in tile.polys.iter_mut() {
            poly.first_link = None;
        }
        log::debug!("Removed tile ({}, {}) from slot {}", tile.header.x, tile.header.z, index);
        Ok(tile)
    }

    pub fn remove_tile_at(&mut self, x: i32, z: i32) -> Result<MeshTile> {
        let index = self.tile_index_at(x, z).ok_or(Status::NotFound)?;
        self.remove_tile(index)
    }

    /// Ground polygons whose bounds overlap the box `center` ± `half_extents`
    pub fn query_polygons(&self, center: &[f32; 3], half_extents: &[f32; 3]) -> Vec<PolyRef> {
        let bmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];
        let mut out = Vec::new();
        for (index, tile) in self.tiles() {
            let tb = Aabb {
                min: tile.header.bmin,
                max: tile.header.bmax,
            };
            if !tb.overlaps(&bmin, &bmax) {
                continue;
            }
            for p in tile.query_polygons(&bmin, &bmax) {
                out.push(self.poly_ref(index, p));
            }
        }
        out
    }

    /// Closest point on the polygon to `pos`, and whether `pos` lies over
    /// the polygon on the xz plane
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        let (tile, poly) = self.get_tile_and_poly(reference)?;
        let verts = tile.poly_vertices(poly);
        if poly.is_off_mesh() {
            let t = project_on_segment_2d(pos, &verts[0], &verts[1]);
            return Ok((vlerp(&verts[0], &verts[1], t), false));
        }
        if point_in_polygon(pos, &verts) {
            let h = tile
                .poly_height(reference.poly_index(), pos)
                .unwrap_or_else(|| closest_point_on_boundary(pos, &verts)[1]);
            return Ok(([pos[0], h, pos[2]], true));
        }
        let mut p = closest_point_on_boundary(pos, &verts);
        if let Some(h) = tile.poly_height(reference.poly_index(), &p) {
            p[1] = h;
        }
        Ok((p, false))
    }

    /// Average of the polygon's vertices
    pub fn poly_center(&self, reference: PolyRef) -> Result<[f32; 3]> {
        let (tile, poly) = self.get_tile_and_poly(reference)?;
        Ok(poly_center(&tile.poly_vertices(poly)))
    }

    /// Nearest ground polygon to `pos` within the search box, ignoring filters
    pub(crate) fn nearest_ground_poly(&self, pos: &[f32; 3], half_extents: &[f32; 3]) -> Option<(PolyRef, [f32; 3])> {
        let mut best: Option<(f32, PolyRef, [f32; 3])> = None;
        for r in self.query_polygons(pos, half_extents) {
            let Ok((p, _)) = self.closest_point_on_poly(r, pos) else {
                continue;
            };
            let d = navforge_common::math::vdist_sqr(&p, pos);
            if best.map_or(true, |(bd, _, _)| d < bd) {
                best = Some((d, r, p));
            }
        }
        best.map(|(_, r, p)| (r, p))
    }

    /// Appends an off-mesh connection polygon to tile `tile_index`
    pub(crate) fn add_off_mesh_poly(
        &mut self,
        tile_index: usize,
        mut link: OffMeshLink,
        area: u8,
        flags: PolyFlags,
    ) -> Result<PolyRef> {
        let tile = self.get_tile_mut(tile_index).ok_or(Status::InvalidParam)?;
        if tile.polys.len() + 1 >= POLY_MAX || tile.verts.len() + 2 > u16::MAX as usize {
            return Err(Status::BufferTooSmall);
        }
        let v0 = tile.verts.len() as u16;
        tile.verts.push(link.start);
        tile.verts.push(link.end);

        let mut poly = Poly::new(area, PolyType::OffMeshConnection, flags);
        poly.verts[0] = v0;
        poly.verts[1] = v0 + 1;
        poly.vert_count = 2;
        let poly_index = tile.polys.len();
        tile.polys.push(poly);
        tile.detail_meshes.push(PolyDetail::default());

        link.poly = poly_index as u16;
        tile.off_mesh_links.push(link);

        self.connect_off_mesh_links();
        Ok(self.poly_ref(tile_index, poly_index))
    }

    fn connect_int_links(&mut self, index: usize) {
        let base_salt = self.slots[index].salt;
        let Some(tile) = self.slots[index].tile.as_mut() else {
            return;
        };
        for p in 0..tile.polys.len() {
            let poly = tile.polys[p].clone();
            if poly.is_off_mesh() {
                continue;
            }
            for j in (0..poly.vert_count as usize).rev() {
                let nei = poly.neighbors[j];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                let reference = PolyRef::new(base_salt, index as u32, (nei - 1) as u32);
                push_link(tile, p, Link::internal(reference, j as u8));
            }
        }
    }

    /// Links the portal edges of tile `from` on side `side` to tile `to`
    fn connect_ext_links(&mut self, from: usize, to: usize, side: u8) {
        let mut new_links: Vec<(usize, Link)> = Vec::new();
        {
            let (Some(tile), Some(target)) = (self.get_tile(from), self.get_tile(to)) else {
                return;
            };
            let climb = tile.header.walkable_climb.max(target.header.walkable_climb);
            let opposite = (side + 2) % 4;

            for (p, poly) in tile.polys.iter().enumerate() {
                if poly.is_off_mesh() {
                    continue;
                }
                let nv = poly.vert_count as usize;
                for j in 0..nv {
                    if poly.neighbors[j] != EXT_LINK | side as u16 {
                        continue;
                    }
                    let va = tile.verts[poly.verts[j] as usize];
                    let vb = tile.verts[poly.verts[(j + 1) % nv] as usize];
                    for (tp, nmin, nmax) in find_connecting_polys(&va, &vb, target, opposite, climb) {
                        let u = if side == 0 || side == 2 { 2 } else { 0 };
                        let span = vb[u] - va[u];
                        let (mut tmin, mut tmax) = if span.abs() > f32::EPSILON {
                            ((nmin - va[u]) / span, (nmax - va[u]) / span)
                        } else {
                            (0.0, 1.0)
                        };
                        if tmin > tmax {
                            std::mem::swap(&mut tmin, &mut tmax);
                        }
                        new_links.push((
                            p,
                            Link {
                                reference: self.poly_ref(to, tp),
                                next: None,
                                edge: j as u8,
                                side,
                                bmin: (tmin.clamp(0.0, 1.0) * 255.0).round() as u8,
                                bmax: (tmax.clamp(0.0, 1.0) * 255.0).round() as u8,
                            },
                        ));
                    }
                }
            }
        }
        if let Some(tile) = self.get_tile_mut(from) {
            for (p, link) in new_links {
                push_link(tile, p, link);
            }
        }
    }

    /// Links every off-mesh connection end point that is not linked yet
    fn connect_off_mesh_links(&mut self) {
        // (tile, poly, link) triples to add
        let mut pending: Vec<(usize, usize, Link)> = Vec::new();

        for (ti, tile) in self.tiles() {
            let climb = tile.header.walkable_climb;
            for con in &tile.off_mesh_links {
                let off_poly = con.poly as usize;
                let Some(poly) = tile.polys.get(off_poly) else {
                    continue;
                };
                let off_ref = self.poly_ref(ti, off_poly);
                let has_start = tile.links_of(poly).any(|l| l.edge == 0);
                let has_end = tile.links_of(poly).any(|l| l.edge == 1);
                let extents = [con.radius, con.radius.max(climb).max(0.1), con.radius];

                if !has_start {
                    if let Some((landing, p)) = self.nearest_ground_poly(&con.start, &extents) {
                        if vdist_2d_sqr(&p, &con.start) <= con.radius * con.radius {
                            pending.push((ti, off_poly, Link::internal(landing, 0)));
                            pending.push((
                                landing.tile_index(),
                                landing.poly_index(),
                                Link::internal(off_ref, OFF_MESH_EDGE),
                            ));
                        }
                    }
                }
                if !has_end {
                    if let Some((landing, p)) = self.nearest_ground_poly(&con.end, &extents) {
                        if vdist_2d_sqr(&p, &con.end) <= con.radius * con.radius {
                            pending.push((ti, off_poly, Link::internal(landing, 1)));
                            if con.bidirectional {
                                pending.push((
                                    landing.tile_index(),
                                    landing.poly_index(),
                                    Link::internal(off_ref, OFF_MESH_EDGE),
                                ));
                            }
                        }
                    }
                }
            }
        }

        for (ti, p, link) in pending {
            if let Some(tile) = self.get_tile_mut(ti) {
                push_link(tile, p, link);
            }
        }
    }
}

fn push_link(tile: &mut MeshTile, poly: usize, mut link: Link) {
    link.next = tile.polys[poly].first_link;
    tile.links.push(link);
    tile.polys[poly].first_link = Some(tile.links.len() - 1);
}

/// Rebuilds every link chain of the tile keeping only links that pass `keep`
fn retain_links(tile: &mut MeshTile, keep: impl Fn(&Link) -> bool) {
    let chains: Vec<Vec<Link>> = tile
        .polys
        .iter()
        .map(|p| tile.links_of(p).filter(|l| keep(l)).copied().collect())
        .collect();
    tile.links.clear();
    for (p, chain) in chains.into_iter().enumerate() {
        tile.polys[p].first_link = None;
        for link in chain.into_iter().rev() {
            push_link(tile, p, link);
        }
    }
}

/// End points of a boundary edge projected onto (along-edge, height)
fn slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: u8) -> ([f32; 2], [f32; 2]) {
    let u = if side == 0 || side == 2 { 2 } else { 0 };
    if va[u] < vb[u] {
        ([va[u], va[1]], [vb[u], vb[1]])
    } else {
        ([vb[u], vb[1]], [va[u], va[1]])
    }
}

fn slab_coord(v: &[f32; 3], side: u8) -> f32 {
    if side == 0 || side == 2 {
        v[0]
    } else {
        v[2]
    }
}

/// True when two slabs overlap along the edge by more than `px` and their
/// heights are within `py` somewhere in the overlap
fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    let line = |lo: &[f32; 2], hi: &[f32; 2]| {
        let dx = hi[0] - lo[0];
        let d = if dx.abs() > f32::EPSILON { (hi[1] - lo[1]) / dx } else { 0.0 };
        (d, lo[1] - d * lo[0])
    };
    let (ad, ak) = line(amin, amax);
    let (bd, bk) = line(bmin, bmax);
    let dmin = (bd * minx + bk) - (ad * minx + ak);
    let dmax = (bd * maxx + bk) - (ad * maxx + ak);

    if dmin * dmax < 0.0 {
        return true;
    }
    let thr = (py * 2.0) * (py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Polygons of `tile` with a portal edge on `side` that overlaps edge
/// va-vb, with the overlapping range along the edge
fn find_connecting_polys(
    va: &[f32; 3],
    vb: &[f32; 3],
    tile: &MeshTile,
    side: u8,
    climb: f32,
) -> Vec<(usize, f32, f32)> {
    let (amin, amax) = slab_end_points(va, vb, side);
    let apos = slab_coord(va, side);
    let mut out = Vec::new();

    for (p, poly) in tile.polys.iter().enumerate() {
        if poly.is_off_mesh() {
            continue;
        }
        let nv = poly.vert_count as usize;
        for j in 0..nv {
            if poly.neighbors[j] != EXT_LINK | side as u16 {
                continue;
            }
            let vc = tile.verts[poly.verts[j] as usize];
            let vd = tile.verts[poly.verts[(j + 1) % nv] as usize];
            if (slab_coord(&vc, side) - apos).abs() > BOUNDARY_EPS {
                continue;
            }
            let (bmin, bmax) = slab_end_points(&vc, &vd, side);
            if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, climb) {
                continue;
            }
            out.push((p, amin[0].max(bmin[0]), amax[0].min(bmax[0])));
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Square tile of `size` at grid (x, z) made of one quad with portal
    /// edges on every side
    fn quad_tile(x: i32, z: i32, size: f32) -> MeshTile {
        let ox = x as f32 * size;
        let oz = z as f32 * size;
        let mut tile = MeshTile::new(TileHeader {
            x,
            z,
            bmin: [ox, -1.0, oz],
            bmax: [ox + size, 1.0, oz + size],
            walkable_height: 2.0,
            walkable_radius: 0.5,
            walkable_climb: 0.5,
        });
        tile.verts = vec![
            [ox, 0.0, oz],
            [ox, 0.0, oz + size],
            [ox + size, 0.0, oz + size],
            [ox + size, 0.0, oz],
        ];
        let mut poly = Poly::new(63, PolyType::Ground, PolyFlags::WALK);
        poly.vert_count = 4;
        poly.verts[..4].copy_from_slice(&[0, 1, 2, 3]);
        // Edge 0 runs along x = ox (-x side), 1 along +z, 2 along +x, 3 along -z
        poly.neighbors[..4].copy_from_slice(&[EXT_LINK, EXT_LINK | 1, EXT_LINK | 2, EXT_LINK | 3]);
        tile.polys.push(poly);
        tile.detail_meshes.push(PolyDetail {
            vert_base: 0,
            vert_count: 4,
            tri_base: 0,
            tri_count: 2,
        });
        tile.detail_verts = tile.verts.clone();
        tile.detail_tris = vec![[0, 1, 2], [0, 2, 3]];
        tile
    }

    fn params(size: f32) -> NavMeshParams {
        NavMeshParams {
            origin: [0.0; 3],
            tile_width: size,
            tile_height: size,
            max_tiles: 16,
            max_polys_per_tile: 64,
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let mut nav = NavMesh::new(params(4.0));
        let idx = nav.add_tile(quad_tile(0, 0, 4.0)).unwrap();
        assert_eq!(nav.tile_count(), 1);
        assert_eq!(nav.tile_index_at(0, 0), Some(idx));
        assert!(nav.get_tile_at(1, 0).is_none());
        assert_eq!(nav.add_tile(quad_tile(0, 0, 4.0)), Err(Status::AlreadyExists));

        let r = nav.poly_ref(idx, 0);
        assert!(nav.is_valid_poly_ref(r));
        assert!(!nav.is_valid_poly_ref(PolyRef::NULL));
        assert!(!nav.is_valid_poly_ref(nav.poly_ref(idx, 5)));
    }

    #[test]
    fn test_neighbouring_tiles_are_stitched() {
        let mut nav = NavMesh::new(params(4.0));
        let a = nav.add_tile(quad_tile(0, 0, 4.0)).unwrap();
        let b = nav.add_tile(quad_tile(1, 0, 4.0)).unwrap();

        let ta = nav.get_tile(a).unwrap();
        let links: Vec<&Link> = ta.links_of(&ta.polys[0]).collect();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].reference.tile_index(), b);
        assert_eq!(links[0].edge, 2);
        assert_eq!((links[0].bmin, links[0].bmax), (0, 255));

        let tb = nav.get_tile(b).unwrap();
        let back: Vec<&Link> = tb.links_of(&tb.polys[0]).collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].reference.tile_index(), a);
        assert_eq!(back[0].edge, 0);
    }

    #[test]
    fn test_remove_tile_bumps_salt_and_unlinks() {
        let mut nav = NavMesh::new(params(4.0));
        let a = nav.add_tile(quad_tile(0, 0, 4.0)).unwrap();
        let b = nav.add_tile(quad_tile(1, 0, 4.0)).unwrap();
        let old = nav.poly_ref(b, 0);

        nav.remove_tile(b).unwrap();
        assert!(!nav.is_valid_poly_ref(old));
        assert_eq!(nav.tile_count(), 1);
        assert_eq!(nav.get_tile(a).unwrap().link_count(), 0);

        let b2 = nav.add_tile(quad_tile(1, 0, 4.0)).unwrap();
        assert_eq!(b2, b);
        assert_ne!(nav.poly_ref(b2, 0), old);
        assert!(nav.remove_tile(9).is_err());
    }

    #[test]
    fn test_query_and_closest_point() {
        let mut nav = NavMesh::new(params(4.0));
        nav.add_tile(quad_tile(0, 0, 4.0)).unwrap();
        let refs = nav.query_polygons(&[2.0, 0.0, 2.0], &[0.5, 1.0, 0.5]);
        assert_eq!(refs.len(), 1);

        let (p, over) = nav.closest_point_on_poly(refs[0], &[2.0, 0.7, 2.0]).unwrap();
        assert!(over);
        assert_eq!(p, [2.0, 0.0, 2.0]);

        let (p, over) = nav.closest_point_on_poly(refs[0], &[6.0, 0.0, 2.0]).unwrap();
        assert!(!over);
        assert!((p[0] - 4.0).abs() < 1e-5);

        assert!(nav.query_polygons(&[20.0, 0.0, 20.0], &[1.0; 3]).is_empty());
    }

    #[test]
    fn test_tile_loc() {
        let nav = NavMesh::new(params(4.0));
        assert_eq!(nav.calc_tile_loc(&[5.0, 0.0, -1.0]), (1, -1));
    }

    #[test]
    fn test_overlap_slabs() {
        assert!(overlap_slabs(&[0.0, 0.0], &[4.0, 0.0], &[2.0, 0.1], &[6.0, 0.1], 0.01, 0.5));
        assert!(!overlap_slabs(&[0.0, 0.0], &[4.0, 0.0], &[5.0, 0.0], &[6.0, 0.0], 0.01, 0.5));
        assert!(!overlap_slabs(&[0.0, 0.0], &[4.0, 0.0], &[0.0, 5.0], &[4.0, 5.0], 0.01, 0.5));
    }
}
