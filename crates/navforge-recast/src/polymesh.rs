//! Convex polygon mesh built from region contours

use std::collections::HashMap;

use glam::Vec3;
use navforge_common::{Error, Result};

use crate::contour::ContourSet;

/// Unused vertex or neighbour slot
pub const MESH_NULL_IDX: u16 = 0xffff;
/// Neighbour slot flag for an edge lying on the tile boundary. The low bits
/// hold the boundary direction (0: -x, 1: +z, 2: +x, 3: -z).
pub const PORTAL_FLAG: u16 = 0x8000;

/// Polygon mesh in cell coordinates.
///
/// `polys` stores `2 * nvp` entries per polygon: vertex indices padded with
/// [`MESH_NULL_IDX`], followed by the neighbour polygon across each edge.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyMesh {
    pub verts: Vec<[u16; 3]>,
    pub polys: Vec<u16>,
    pub regs: Vec<u16>,
    pub areas: Vec<u8>,
    pub flags: Vec<u16>,
    pub npolys: usize,
    pub nvp: usize,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub border_size: i32,
    pub max_edge_error: f32,
}

impl PolyMesh {
    fn empty(cset: &ContourSet, nvp: usize) -> Self {
        Self {
            verts: Vec::new(),
            polys: Vec::new(),
            regs: Vec::new(),
            areas: Vec::new(),
            flags: Vec::new(),
            npolys: 0,
            nvp,
            bmin: cset.bmin,
            bmax: cset.bmax,
            cs: cset.cs,
            ch: cset.ch,
            border_size: cset.border_size,
            max_edge_error: cset.max_error,
        }
    }

    /// Triangulates every contour, welds shared vertices, merges triangles
    /// into convex polygons of at most `nvp` vertices and links neighbours.
    pub fn build(cset: &ContourSet, nvp: usize) -> Result<Self> {
        if !(3..=6).contains(&nvp) {
            return Err(Error::InvalidMesh(format!(
                "Max vertices per polygon must be in 3..=6, got {}",
                nvp
            )));
        }
        let mut mesh = Self::empty(cset, nvp);

        let max_vertices: usize = cset.contours.iter().map(|c| c.verts.len()).sum();
        if max_vertices >= MESH_NULL_IDX as usize - 1 {
            return Err(Error::NavMeshGeneration(format!(
                "Too many vertices for a polygon mesh: {}",
                max_vertices
            )));
        }

        let mut welder = VertexWelder::default();

        for (ci, contour) in cset.contours.iter().enumerate() {
            if contour.verts.len() < 3 {
                continue;
            }

            let (tris, complete) = triangulate(&contour.verts);
            if !complete {
                log::warn!("Bad triangulation of contour {} (region {})", ci, contour.reg);
            }

            let indices: Vec<u16> = contour
                .verts
                .iter()
                .map(|v| welder.add(&mut mesh.verts, v[0], v[1], v[2]))
                .collect();

            let mut polys: Vec<Vec<u16>> = tris
                .iter()
                .map(|t| [indices[t[0]], indices[t[1]], indices[t[2]]])
                .filter(|t| t[0] != t[1] && t[0] != t[2] && t[1] != t[2])
                .map(|t| t.to_vec())
                .collect();
            if polys.is_empty() {
                continue;
            }

            if nvp > 3 {
                merge_polys(&mut polys, &mesh.verts, nvp);
            }

            for poly in polys {
                let mut slot = vec![MESH_NULL_IDX; nvp * 2];
                slot[..poly.len()].copy_from_slice(&poly);
                mesh.polys.extend_from_slice(&slot);
                mesh.regs.push(contour.reg);
                mesh.areas.push(contour.area);
                mesh.npolys += 1;
            }
        }

        mesh.flags = vec![0; mesh.npolys];
        mesh.build_adjacency();

        if mesh.border_size > 0 {
            mesh.mark_portal_edges(cset.width, cset.height);
        }

        log::debug!(
            "Poly mesh: {} vertices, {} polygons (nvp {})",
            mesh.verts.len(),
            mesh.npolys,
            nvp
        );
        Ok(mesh)
    }

    pub fn vertex_count(&self) -> usize {
        self.verts.len()
    }

    pub fn poly_count(&self) -> usize {
        self.npolys
    }

    pub fn max_verts_per_poly(&self) -> usize {
        self.nvp
    }

    /// Vertex slots of polygon `i`, padded with [`MESH_NULL_IDX`]
    pub fn poly(&self, i: usize) -> &[u16] {
        let base = i * self.nvp * 2;
        &self.polys[base..base + self.nvp]
    }

    /// Neighbour slots of polygon `i`, one per edge
    pub fn poly_neighbors(&self, i: usize) -> &[u16] {
        let base = i * self.nvp * 2 + self.nvp;
        &self.polys[base..base + self.nvp]
    }

    pub fn poly_vert_count(&self, i: usize) -> usize {
        self.poly(i).iter().take_while(|&&v| v != MESH_NULL_IDX).count()
    }

    /// World-space position of vertex `v`
    pub fn vertex_position(&self, v: usize) -> Vec3 {
        let p = self.verts[v];
        Vec3::new(
            self.bmin.x + p[0] as f32 * self.cs,
            self.bmin.y + p[1] as f32 * self.ch,
            self.bmin.z + p[2] as f32 * self.cs,
        )
    }

    fn build_adjacency(&mut self) {
        let nvp = self.nvp;
        // (v0, v1) with v0 < v1 -> unmatched (poly, edge) pairs
        let mut open: HashMap<(u16, u16), Vec<(usize, usize)>> = HashMap::new();
        let mut pairs = Vec::new();

        for i in 0..self.npolys {
            let nv = self.poly_vert_count(i);
            for j in 0..nv {
                let v0 = self.polys[i * nvp * 2 + j];
                let v1 = self.polys[i * nvp * 2 + (j + 1) % nv];
                if v0 < v1 {
                    open.entry((v0, v1)).or_default().push((i, j));
                }
            }
        }
        for i in 0..self.npolys {
            let nv = self.poly_vert_count(i);
            for j in 0..nv {
                let v0 = self.polys[i * nvp * 2 + j];
                let v1 = self.polys[i * nvp * 2 + (j + 1) % nv];
                if v0 > v1 {
                    if let Some(candidates) = open.get_mut(&(v1, v0)) {
                        if let Some((p, e)) = candidates.pop() {
                            pairs.push(((p, e), (i, j)));
                        }
                    }
                }
            }
        }

        for ((p0, e0), (p1, e1)) in pairs {
            self.polys[p0 * nvp * 2 + nvp + e0] = p1 as u16;
            self.polys[p1 * nvp * 2 + nvp + e1] = p0 as u16;
        }
    }

    fn mark_portal_edges(&mut self, w: i32, h: i32) {
        let nvp = self.nvp;
        for i in 0..self.npolys {
            let nv = self.poly_vert_count(i);
            for j in 0..nv {
                let nei = i * nvp * 2 + nvp + j;
                if self.polys[nei] != MESH_NULL_IDX {
                    continue;
                }
                let va = self.verts[self.polys[i * nvp * 2 + j] as usize];
                let vb = self.verts[self.polys[i * nvp * 2 + (j + 1) % nv] as usize];
                let (ax, az, bx, bz) = (va[0] as i32, va[2] as i32, vb[0] as i32, vb[2] as i32);
                let dir = if ax == 0 && bx == 0 {
                    Some(0)
                } else if az == h && bz == h {
                    Some(1)
                } else if ax == w && bx == w {
                    Some(2)
                } else if az == 0 && bz == 0 {
                    Some(3)
                } else {
                    None
                };
                if let Some(dir) = dir {
                    self.polys[nei] = PORTAL_FLAG | dir;
                }
            }
        }
    }
}

/// Shares vertices that coincide on xz and lie within two cells vertically
#[derive(Default)]
struct VertexWelder {
    buckets: HashMap<(u16, u16), Vec<u16>>,
}

impl VertexWelder {
    fn add(&mut self, verts: &mut Vec<[u16; 3]>, x: i32, y: i32, z: i32) -> u16 {
        let (x, y, z) = (x.clamp(0, 0xfffe) as u16, y.clamp(0, 0xfffe) as u16, z.clamp(0, 0xfffe) as u16);
        let bucket = self.buckets.entry((x, z)).or_default();
        for &idx in bucket.iter() {
            if (verts[idx as usize][1] as i32 - y as i32).abs() <= 2 {
                return idx;
            }
        }
        let idx = verts.len() as u16;
        verts.push([x, y, z]);
        bucket.push(idx);
        idx
    }
}

#[inline]
fn area2(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> i64 {
    (b[0] - a[0]) as i64 * (c[2] - a[2]) as i64 - (c[0] - a[0]) as i64 * (b[2] - a[2]) as i64
}

#[inline]
fn left(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) < 0
}

#[inline]
fn left_on(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
fn collinear(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) == 0
}

fn intersect_prop(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// True when `c` lies on the closed segment a-b
fn between(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    if a[0] != b[0] {
        (a[0] <= c[0] && c[0] <= b[0]) || (a[0] >= c[0] && c[0] >= b[0])
    } else {
        (a[2] <= c[2] && c[2] <= b[2]) || (a[2] >= c[2] && c[2] >= b[2])
    }
}

fn intersect(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    intersect_prop(a, b, c, d) || between(a, b, c) || between(a, b, d) || between(c, d, a) || between(c, d, b)
}

#[inline]
fn same_xz(a: &[i32; 4], b: &[i32; 4]) -> bool {
    a[0] == b[0] && a[2] == b[2]
}

/// Ear clipping state over a shrinking index ring
struct EarClipper<'a> {
    verts: &'a [[i32; 4]],
    indices: Vec<usize>,
    ear: Vec<bool>,
}

impl EarClipper<'_> {
    fn n(&self) -> usize {
        self.indices.len()
    }

    fn next(&self, i: usize) -> usize {
        (i + 1) % self.n()
    }

    fn prev(&self, i: usize) -> usize {
        (i + self.n() - 1) % self.n()
    }

    fn v(&self, i: usize) -> &[i32; 4] {
        &self.verts[self.indices[i]]
    }

    fn in_cone(&self, i: usize, j: usize, loose: bool) -> bool {
        let (pi, pj) = (self.v(i), self.v(j));
        let pi1 = self.v(self.next(i));
        let pin1 = self.v(self.prev(i));
        if left_on(pin1, pi, pi1) {
            return if loose {
                left_on(pi, pj, pin1) && left_on(pj, pi, pi1)
            } else {
                left(pi, pj, pin1) && left(pj, pi, pi1)
            };
        }
        !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
    }

    /// No polygon edge crosses the segment i-j
    fn diagonalie(&self, i: usize, j: usize, loose: bool) -> bool {
        let (d0, d1) = (self.v(i), self.v(j));
        for k in 0..self.n() {
            let k1 = self.next(k);
            if k == i || k1 == i || k == j || k1 == j {
                continue;
            }
            let (p0, p1) = (self.v(k), self.v(k1));
            if same_xz(d0, p0) || same_xz(d1, p0) || same_xz(d0, p1) || same_xz(d1, p1) {
                continue;
            }
            let crosses = if loose {
                intersect_prop(d0, d1, p0, p1)
            } else {
                intersect(d0, d1, p0, p1)
            };
            if crosses {
                return false;
            }
        }
        true
    }

    fn diagonal(&self, i: usize, j: usize, loose: bool) -> bool {
        self.in_cone(i, j, loose) && self.diagonalie(i, j, loose)
    }

    fn edge_len_sq(&self, i: usize, j: usize) -> i64 {
        let (a, b) = (self.v(i), self.v(j));
        let dx = (b[0] - a[0]) as i64;
        let dz = (b[2] - a[2]) as i64;
        dx * dx + dz * dz
    }

    /// Index of the vertex before the ear with the shortest diagonal
    fn shortest_ear(&self, loose: bool) -> Option<usize> {
        let mut best: Option<(i64, usize)> = None;
        for i in 0..self.n() {
            let i1 = self.next(i);
            let i2 = self.next(i1);
            let is_ear = if loose { self.diagonal(i, i2, true) } else { self.ear[i1] };
            if !is_ear {
                continue;
            }
            let len = self.edge_len_sq(i, i2);
            if best.map_or(true, |(l, _)| len < l) {
                best = Some((len, i));
            }
        }
        best.map(|(_, i)| i)
    }
}

/// Ear-clips a simple polygon given by contour vertices.
///
/// Returns triangles as indices into `verts`, and whether the whole polygon
/// was consumed.
pub fn triangulate(verts: &[[i32; 4]]) -> (Vec<[usize; 3]>, bool) {
    let mut tris = Vec::new();
    if verts.len() < 3 {
        return (tris, false);
    }
    let mut clip = EarClipper {
        verts,
        indices: (0..verts.len()).collect(),
        ear: vec![false; verts.len()],
    };
    for i in 0..clip.n() {
        let i1 = clip.next(i);
        let i2 = clip.next(i1);
        clip.ear[i1] = clip.diagonal(i, i2, false);
    }

    while clip.n() > 3 {
        let Some(i) = clip.shortest_ear(false).or_else(|| clip.shortest_ear(true)) else {
            return (tris, false);
        };
        let i1 = clip.next(i);
        let i2 = clip.next(i1);
        tris.push([clip.indices[i], clip.indices[i1], clip.indices[i2]]);

        clip.indices.remove(i1);
        clip.ear.remove(i1);
        let i1 = if i1 >= clip.n() { 0 } else { i1 };
        let i = clip.prev(i1);
        let pi = clip.prev(i);
        clip.ear[i] = clip.diagonal(pi, i1, false);
        let ni1 = clip.next(i1);
        clip.ear[i1] = clip.diagonal(i, ni1, false);
    }

    tris.push([clip.indices[0], clip.indices[1], clip.indices[2]]);
    (tris, true)
}

#[inline]
fn uleft(a: &[u16; 3], b: &[u16; 3], c: &[u16; 3]) -> bool {
    (b[0] as i32 - a[0] as i32) * (c[2] as i32 - a[2] as i32)
        - (c[0] as i32 - a[0] as i32) * (b[2] as i32 - a[2] as i32)
        < 0
}

/// Length of the shared edge when merging `pa` and `pb` keeps the result
/// convex and within `nvp` vertices, plus the shared edge in each polygon.
fn poly_merge_value(pa: &[u16], pb: &[u16], verts: &[[u16; 3]], nvp: usize) -> Option<(i32, usize, usize)> {
    let (na, nb) = (pa.len(), pb.len());
    if na + nb - 2 > nvp {
        return None;
    }

    let mut shared = None;
    'outer: for i in 0..na {
        let (mut va0, mut va1) = (pa[i], pa[(i + 1) % na]);
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let (mut vb0, mut vb1) = (pb[j], pb[(j + 1) % nb]);
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }
    let (ea, eb) = shared?;

    let v = |i: u16| &verts[i as usize];
    if !uleft(v(pa[(ea + na - 1) % na]), v(pa[ea]), v(pb[(eb + 2) % nb])) {
        return None;
    }
    if !uleft(v(pb[(eb + nb - 1) % nb]), v(pb[eb]), v(pa[(ea + 2) % na])) {
        return None;
    }

    let a = v(pa[ea]);
    let b = v(pa[(ea + 1) % na]);
    let dx = a[0] as i32 - b[0] as i32;
    let dz = a[2] as i32 - b[2] as i32;
    Some((dx * dx + dz * dz, ea, eb))
}

/// Greedily merges the pair of polygons sharing the longest edge until no
/// merge keeps the result convex.
fn merge_polys(polys: &mut Vec<Vec<u16>>, verts: &[[u16; 3]], nvp: usize) {
    loop {
        let mut best: Option<(i32, usize, usize, usize, usize)> = None;
        for j in 0..polys.len() {
            for k in j + 1..polys.len() {
                if let Some((value, ea, eb)) = poly_merge_value(&polys[j], &polys[k], verts, nvp) {
                    if best.map_or(true, |b| value > b.0) {
                        best = Some((value, j, k, ea, eb));
                    }
                }
            }
        }
        let Some((_, pa, pb, ea, eb)) = best else {
            break;
        };

        let a = &polys[pa];
        let b = &polys[pb];
        let (na, nb) = (a.len(), b.len());
        let mut merged = Vec::with_capacity(na + nb - 2);
        merged.extend((0..na - 1).map(|i| a[(ea + 1 + i) % na]));
        merged.extend((0..nb - 1).map(|i| b[(eb + 1 + i) % nb]));
        polys[pa] = merged;
        polys.swap_remove(pb);
    }
}
