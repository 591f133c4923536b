//! Region outlines traced from a region-labelled compact heightfield

use glam::Vec3;

use crate::compact_heightfield::{CompactHeightfield, BORDER_REG, DIR_OFFSET_X, DIR_OFFSET_Z};

/// Vertex flag: corner sits on the tile border and may be dropped
pub const BORDER_VERTEX: u32 = 0x10000;
/// Vertex flag: edge separates two different area types
pub const AREA_BORDER: u32 = 0x20000;
/// Mask of the neighbour region id stored in a contour vertex
pub const CONTOUR_REG_MASK: u32 = 0xffff;

/// Split long wall edges
pub const CONTOUR_TESS_WALL_EDGES: u8 = 0x01;
/// Split long edges between areas
pub const CONTOUR_TESS_AREA_EDGES: u8 = 0x02;

/// Simplified outline of one region.
///
/// Vertices are `[x, y, z, flags]` in cell units relative to the set's
/// `bmin`; the low 16 bits of `flags` hold the region on the other side of
/// the edge that starts at the vertex.
#[derive(Debug, Clone, Default)]
pub struct Contour {
    pub verts: Vec<[i32; 4]>,
    pub raw_verts: Vec<[i32; 4]>,
    pub reg: u16,
    pub area: u8,
}

impl Contour {
    pub fn vertex_count(&self) -> usize {
        self.verts.len()
    }

    pub fn region_id(&self) -> u16 {
        self.reg
    }
}

/// All region contours of one compact heightfield
#[derive(Debug, Clone, Default)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    /// Grid size without the border
    pub width: i32,
    pub height: i32,
    pub border_size: i32,
    pub max_error: f32,
}

impl ContourSet {
    /// Traces, simplifies and splits region outlines, tessellating long wall
    /// edges. Yields no contours when the heightfield has no regions.
    pub fn build(chf: &CompactHeightfield, max_error: f32, max_edge_len: i32) -> Self {
        Self::build_with_flags(chf, max_error, max_edge_len, CONTOUR_TESS_WALL_EDGES)
    }

    pub fn build_with_flags(
        chf: &CompactHeightfield,
        max_error: f32,
        max_edge_len: i32,
        build_flags: u8,
    ) -> Self {
        let border_size = chf.border_size;
        let pad = border_size as f32 * chf.cs;
        let mut cset = ContourSet {
            contours: Vec::new(),
            bmin: chf.bmin + Vec3::new(pad, 0.0, pad),
            bmax: chf.bmax - Vec3::new(pad, 0.0, pad),
            cs: chf.cs,
            ch: chf.ch,
            width: chf.width - border_size * 2,
            height: chf.height - border_size * 2,
            border_size,
            max_error,
        };
        if chf.max_regions <= 1 {
            return cset;
        }

        // Per span, a bit per direction whose edge is a region boundary
        let mut flags = vec![0u8; chf.spans.len()];
        for (x, z, i) in chf.iter_spans() {
            let reg = chf.spans[i].reg;
            if reg == 0 || reg & BORDER_REG != 0 {
                continue;
            }
            let mut connected = 0u8;
            for dir in 0..4 {
                if let Some((_, _, ai)) = chf.neighbor(x, z, i, dir) {
                    if chf.spans[ai].reg == reg {
                        connected |= 1 << dir;
                    }
                }
            }
            flags[i] = connected ^ 0xf;
        }

        for (x, z, i) in chf.iter_spans() {
            if flags[i] == 0 || flags[i] == 0xf {
                flags[i] = 0;
                continue;
            }
            let reg = chf.spans[i].reg;
            if reg == 0 || reg & BORDER_REG != 0 {
                continue;
            }
            let area = chf.areas[i];

            let mut raw = walk_contour(chf, x, z, i, &mut flags);
            let mut simplified = simplify_contour(&raw, max_error, max_edge_len, build_flags);
            remove_degenerate_segments(&mut simplified);

            if simplified.len() >= 3 {
                if border_size > 0 {
                    for v in simplified.iter_mut().chain(raw.iter_mut()) {
                        v[0] -= border_size;
                        v[2] -= border_size;
                    }
                }
                cset.contours.push(Contour {
                    verts: simplified,
                    raw_verts: raw,
                    reg,
                    area,
                });
            }
        }

        merge_holes(&mut cset.contours);

        log::debug!(
            "Built {} contours from {} regions",
            cset.contours.len(),
            chf.max_regions.saturating_sub(1)
        );
        cset
    }
}

/// Floor height at the corner of span `i` in direction `dir`, and whether
/// the corner is a tile-border vertex.
fn corner_height(chf: &CompactHeightfield, x: i32, z: i32, i: usize, dir: usize) -> (i32, bool) {
    let s = chf.spans[i];
    let dirp = (dir + 1) & 3;
    let mut height = s.y as i32;
    let pack = |idx: usize| chf.spans[idx].reg as u32 | ((chf.areas[idx] as u32) << 16);
    let mut regs = [0u32; 4];
    regs[0] = pack(i);

    if let Some((ax, az, ai)) = chf.neighbor(x, z, i, dir) {
        height = height.max(chf.spans[ai].y as i32);
        regs[1] = pack(ai);
        if let Some((_, _, ai2)) = chf.neighbor(ax, az, ai, dirp) {
            height = height.max(chf.spans[ai2].y as i32);
            regs[2] = pack(ai2);
        }
    }
    if let Some((ax, az, ai)) = chf.neighbor(x, z, i, dirp) {
        height = height.max(chf.spans[ai].y as i32);
        regs[3] = pack(ai);
        if let Some((_, _, ai2)) = chf.neighbor(ax, az, ai, dir) {
            height = height.max(chf.spans[ai2].y as i32);
            regs[2] = pack(ai2);
        }
    }

    let border = BORDER_REG as u32;
    let mut is_border_vertex = false;
    for j in 0..4 {
        let a = regs[j];
        let b = regs[(j + 1) & 3];
        let c = regs[(j + 2) & 3];
        let d = regs[(j + 3) & 3];
        let two_same_exts = (a & b & border) != 0 && a == b;
        let two_ints = ((c | d) & border) == 0;
        let ints_same_area = (c >> 16) == (d >> 16);
        let no_zeros = a != 0 && b != 0 && c != 0 && d != 0;
        if two_same_exts && two_ints && ints_same_area && no_zeros {
            is_border_vertex = true;
            break;
        }
    }
    (height, is_border_vertex)
}

/// Follows the region boundary clockwise starting at span `i`, clearing the
/// edge flags it visits.
fn walk_contour(
    chf: &CompactHeightfield,
    mut x: i32,
    mut z: i32,
    mut i: usize,
    flags: &mut [u8],
) -> Vec<[i32; 4]> {
    let mut dir = 0usize;
    while flags[i] & (1 << dir) == 0 {
        dir += 1;
    }
    let start_dir = dir;
    let start_i = i;
    let area = chf.areas[i];
    let mut points = Vec::new();

    for _ in 0..40000 {
        if flags[i] & (1 << dir) != 0 {
            let (py, is_border_vertex) = corner_height(chf, x, z, i, dir);
            let (mut px, mut pz) = (x, z);
            match dir {
                0 => pz += 1,
                1 => {
                    px += 1;
                    pz += 1;
                }
                2 => px += 1,
                _ => {}
            }
            let mut r = 0u32;
            let mut is_area_border = false;
            if let Some((_, _, ai)) = chf.neighbor(x, z, i, dir) {
                r = chf.spans[ai].reg as u32;
                is_area_border = area != chf.areas[ai];
            }
            if is_border_vertex {
                r |= BORDER_VERTEX;
            }
            if is_area_border {
                r |= AREA_BORDER;
            }
            points.push([px, py, pz, r as i32]);

            flags[i] &= !(1 << dir);
            dir = (dir + 1) & 3;
        } else {
            let Some((nx, nz, ni)) = chf.neighbor(x, z, i, dir) else {
                // Boundary flags and links disagree
                break;
            };
            x = nx;
            z = nz;
            i = ni;
            dir = (dir + 3) & 3;
        }
        if start_i == i && start_dir == dir {
            break;
        }
    }
    points
}

/// Squared distance from (x, z) to segment (px, pz)-(qx, qz)
fn distance_pt_seg(x: i32, z: i32, px: i32, pz: i32, qx: i32, qz: i32) -> f32 {
    let pqx = (qx - px) as f32;
    let pqz = (qz - pz) as f32;
    let dx = (x - px) as f32;
    let dz = (z - pz) as f32;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = px as f32 + t * pqx - x as f32;
    let dz = pz as f32 + t * pqz - z as f32;
    dx * dx + dz * dz
}

#[inline]
fn reg_of(v: &[i32; 4]) -> u32 {
    v[3] as u32 & CONTOUR_REG_MASK
}

#[inline]
fn area_border_of(v: &[i32; 4]) -> u32 {
    v[3] as u32 & AREA_BORDER
}

/// Douglas-Peucker simplification that keeps every point where the
/// neighbouring region changes, then splits edges longer than `max_edge_len`.
///
/// The fourth component of each output vertex is rewritten from the raw
/// index it came from into the neighbour region and border flags.
fn simplify_contour(
    points: &[[i32; 4]],
    max_error: f32,
    max_edge_len: i32,
    build_flags: u8,
) -> Vec<[i32; 4]> {
    let pn = points.len();
    let mut simplified: Vec<[i32; 4]> = Vec::new();
    if pn == 0 {
        return simplified;
    }

    let has_connections = points.iter().any(|p| reg_of(p) != 0);
    if has_connections {
        for i in 0..pn {
            let ii = (i + 1) % pn;
            let different_regs = reg_of(&points[i]) != reg_of(&points[ii]);
            let area_borders = area_border_of(&points[i]) != area_border_of(&points[ii]);
            if different_regs || area_borders {
                let p = points[i];
                simplified.push([p[0], p[1], p[2], i as i32]);
            }
        }
    }

    if simplified.is_empty() {
        // Closed island: seed with the lower-left and upper-right points
        let mut ll = 0;
        let mut ur = 0;
        for (i, p) in points.iter().enumerate() {
            let l = points[ll];
            if p[0] < l[0] || (p[0] == l[0] && p[2] < l[2]) {
                ll = i;
            }
            let u = points[ur];
            if p[0] > u[0] || (p[0] == u[0] && p[2] > u[2]) {
                ur = i;
            }
        }
        let l = points[ll];
        let u = points[ur];
        simplified.push([l[0], l[1], l[2], ll as i32]);
        simplified.push([u[0], u[1], u[2], ur as i32]);
    }

    let max_error_sq = max_error * max_error;
    let mut i = 0;
    while i < simplified.len() {
        let ii = (i + 1) % simplified.len();
        let (mut ax, mut az, ai) = (simplified[i][0], simplified[i][2], simplified[i][3] as usize);
        let (mut bx, mut bz, bi) = (simplified[ii][0], simplified[ii][2], simplified[ii][3] as usize);

        // Walk the raw points in a fixed lexical direction so shared edges
        // simplify identically from both sides
        let (mut ci, cinc, endi) = if bx > ax || (bx == ax && bz > az) {
            ((ai + 1) % pn, 1, bi)
        } else {
            std::mem::swap(&mut ax, &mut bx);
            std::mem::swap(&mut az, &mut bz);
            ((bi + pn - 1) % pn, pn - 1, ai)
        };

        let mut maxd = 0.0f32;
        let mut maxi = None;
        if reg_of(&points[ci]) == 0 || area_border_of(&points[ci]) != 0 {
            while ci != endi {
                let d = distance_pt_seg(points[ci][0], points[ci][2], ax, az, bx, bz);
                if d > maxd {
                    maxd = d;
                    maxi = Some(ci);
                }
                ci = (ci + cinc) % pn;
            }
        }

        match maxi {
            Some(mi) if maxd > max_error_sq => {
                let p = points[mi];
                simplified.insert(i + 1, [p[0], p[1], p[2], mi as i32]);
            }
            _ => i += 1,
        }
    }

    if max_edge_len > 0 && build_flags & (CONTOUR_TESS_WALL_EDGES | CONTOUR_TESS_AREA_EDGES) != 0 {
        let max_len_sq = max_edge_len * max_edge_len;
        let mut i = 0;
        while i < simplified.len() {
            let ii = (i + 1) % simplified.len();
            let (ax, az, ai) = (simplified[i][0], simplified[i][2], simplified[i][3] as usize);
            let (bx, bz, bi) = (simplified[ii][0], simplified[ii][2], simplified[ii][3] as usize);

            let ci = (ai + 1) % pn;
            let tess = (build_flags & CONTOUR_TESS_WALL_EDGES != 0 && reg_of(&points[ci]) == 0)
                || (build_flags & CONTOUR_TESS_AREA_EDGES != 0 && area_border_of(&points[ci]) != 0);

            let mut maxi = None;
            if tess {
                let dx = bx - ax;
                let dz = bz - az;
                if dx * dx + dz * dz > max_len_sq {
                    let n = if bi < ai { bi + pn - ai } else { bi - ai };
                    if n > 1 {
                        maxi = Some(if bx > ax || (bx == ax && bz > az) {
                            (ai + n / 2) % pn
                        } else {
                            (ai + (n + 1) / 2) % pn
                        });
                    }
                }
            }

            match maxi {
                Some(mi) => {
                    let p = points[mi];
                    simplified.insert(i + 1, [p[0], p[1], p[2], mi as i32]);
                }
                None => i += 1,
            }
        }
    }

    for v in simplified.iter_mut() {
        let bi = v[3] as usize;
        let ai = (bi + 1) % pn;
        let edge = points[ai][3] as u32 & (CONTOUR_REG_MASK | AREA_BORDER);
        let vertex = points[bi][3] as u32 & BORDER_VERTEX;
        v[3] = (edge | vertex) as i32;
    }
    simplified
}

/// Drops consecutive vertices that coincide on the xz plane
fn remove_degenerate_segments(verts: &mut Vec<[i32; 4]>) {
    let mut i = 0;
    while i < verts.len() && verts.len() > 1 {
        let ni = (i + 1) % verts.len();
        if verts[i][0] == verts[ni][0] && verts[i][2] == verts[ni][2] {
            verts.remove(ni);
            if ni == 0 {
                break;
            }
        } else {
            i += 1;
        }
    }
}

/// Twice the signed xz area; negative for holes
fn signed_area(verts: &[[i32; 4]]) -> i64 {
    let n = verts.len();
    let mut area = 0i64;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        area += vi[0] as i64 * vj[2] as i64 - vj[0] as i64 * vi[2] as i64;
        j = i;
    }
    (area + 1) / 2
}

#[inline]
fn area2(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> i64 {
    (b[0] - a[0]) as i64 * (c[2] - a[2]) as i64 - (c[0] - a[0]) as i64 * (b[2] - a[2]) as i64
}

#[inline]
fn left_on(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
fn left(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) < 0
}

#[inline]
fn same_xz(a: &[i32; 4], b: &[i32; 4]) -> bool {
    a[0] == b[0] && a[2] == b[2]
}

fn segments_intersect(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    let abc = area2(a, b, c);
    let abd = area2(a, b, d);
    let cda = area2(c, d, a);
    let cdb = area2(c, d, b);
    if abc == 0 || abd == 0 || cda == 0 || cdb == 0 {
        return false;
    }
    (abc > 0) != (abd > 0) && (cda > 0) != (cdb > 0)
}

/// True when point `pj` lies in the interior cone of vertex `i` of `verts`
fn in_cone(i: usize, verts: &[[i32; 4]], pj: &[i32; 4]) -> bool {
    let n = verts.len();
    let pi = &verts[i];
    let pi1 = &verts[(i + 1) % n];
    let pin1 = &verts[(i + n - 1) % n];
    if left_on(pin1, pi, pi1) {
        return left(pi, pj, pin1) && left(pj, pi, pi1);
    }
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

fn intersects_contour(d0: &[i32; 4], d1: &[i32; 4], skip: Option<usize>, verts: &[[i32; 4]]) -> bool {
    let n = verts.len();
    for k in 0..n {
        let k1 = (k + 1) % n;
        if Some(k) == skip || Some(k1) == skip {
            continue;
        }
        let p0 = &verts[k];
        let p1 = &verts[k1];
        if same_xz(d0, p0) || same_xz(d1, p0) || same_xz(d0, p1) || same_xz(d1, p1) {
            continue;
        }
        if segments_intersect(d0, d1, p0, p1) {
            return true;
        }
    }
    false
}

/// Splices hole contours into the outline of the region that surrounds them
fn merge_holes(contours: &mut Vec<Contour>) {
    let holes: Vec<usize> = (0..contours.len())
        .filter(|&i| signed_area(&contours[i].verts) < 0)
        .collect();
    if holes.is_empty() {
        return;
    }

    let mut merged_away = vec![false; contours.len()];
    for &hole_idx in &holes {
        let reg = contours[hole_idx].reg;
        let Some(outline_idx) = (0..contours.len()).find(|&i| {
            i != hole_idx && !merged_away[i] && contours[i].reg == reg && signed_area(&contours[i].verts) > 0
        }) else {
            log::warn!("Hole in region {} has no outline, dropping it", reg);
            merged_away[hole_idx] = true;
            continue;
        };

        let hole = contours[hole_idx].verts.clone();
        let outline = contours[outline_idx].verts.clone();

        // Start from the hole's lower-left vertex
        let mut start = 0;
        for (i, v) in hole.iter().enumerate() {
            let s = hole[start];
            if v[0] < s[0] || (v[0] == s[0] && v[2] < s[2]) {
                start = i;
            }
        }

        let mut best: Option<(usize, usize)> = None;
        'search: for step in 0..hole.len() {
            let hi = (start + step) % hole.len();
            let corner = hole[hi];
            let mut candidates: Vec<(i64, usize)> = (0..outline.len())
                .filter(|&j| in_cone(j, &outline, &corner))
                .map(|j| {
                    let dx = (outline[j][0] - corner[0]) as i64;
                    let dz = (outline[j][2] - corner[2]) as i64;
                    (dx * dx + dz * dz, j)
                })
                .collect();
            candidates.sort_unstable();
            for (_, j) in candidates {
                let pt = &outline[j];
                if intersects_contour(pt, &corner, Some(j), &outline) {
                    continue;
                }
                if intersects_contour(pt, &corner, Some(hi), &hole) {
                    continue;
                }
                let other_hole_blocks = holes.iter().any(|&other| {
                    other != hole_idx
                        && !merged_away[other]
                        && contours[other].reg == reg
                        && intersects_contour(pt, &corner, None, &contours[other].verts)
                });
                if other_hole_blocks {
                    continue;
                }
                best = Some((j, hi));
                break 'search;
            }
        }

        let Some((ia, ib)) = best else {
            log::warn!("Failed to find merge point for hole in region {}", reg);
            merged_away[hole_idx] = true;
            continue;
        };

        let mut verts = Vec::with_capacity(outline.len() + hole.len() + 2);
        for k in 0..=outline.len() {
            verts.push(outline[(ia + k) % outline.len()]);
        }
        for k in 0..=hole.len() {
            verts.push(hole[(ib + k) % hole.len()]);
        }
        contours[outline_idx].verts = verts;
        merged_away[hole_idx] = true;
    }

    let mut idx = 0;
    contours.retain(|_| {
        let keep = !merged_away[idx];
        idx += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::flat_compact;
    use crate::NULL_AREA;

    fn regions(mut chf: CompactHeightfield) -> CompactHeightfield {
        chf.build_distance_field();
        chf.build_regions_watershed(0, 8, 20);
        chf
    }

    #[test]
    fn test_flat_plane_contours() {
        let chf = regions(flat_compact(20, 20));
        let cset = ContourSet::build(&chf, 1.3, 12);
        assert!(!cset.contours.is_empty());
        for c in &cset.contours {
            assert!(c.vertex_count() >= 3);
            assert!(c.region_id() > 0);
        }
    }

    #[test]
    fn test_no_regions_no_contours() {
        let mut chf = flat_compact(5, 5);
        for a in chf.areas.iter_mut() {
            *a = NULL_AREA;
        }
        let chf = regions(chf);
        assert!(chf.max_regions <= 1);
        let cset = ContourSet::build(&chf, 1.3, 12);
        assert!(cset.contours.is_empty());
    }

    #[test]
    fn test_long_edges_are_split() {
        let chf = regions(flat_compact(40, 6));
        let cset = ContourSet::build(&chf, 1.3, 6);
        for c in &cset.contours {
            let n = c.verts.len();
            for i in 0..n {
                let a = c.verts[i];
                let b = c.verts[(i + 1) % n];
                let dx = b[0] - a[0];
                let dz = b[2] - a[2];
                // Only wall edges are split
                if a[3] as u32 & CONTOUR_REG_MASK == 0 {
                    assert!(dx * dx + dz * dz <= 36 * 4, "edge too long: {:?} {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_hole_is_merged_into_outline() {
        let mut chf = flat_compact(30, 30);
        for z in 12..18 {
            for x in 12..18 {
                let i = chf.cell(x, z).index;
                chf.areas[i] = NULL_AREA;
            }
        }
        let chf = regions(chf);
        let cset = ContourSet::build(&chf, 1.3, 12);
        assert!(!cset.contours.is_empty());
        for c in &cset.contours {
            assert!(signed_area(&c.verts) >= 0, "hole left in contour set");
        }
    }

    #[test]
    fn test_remove_degenerate_segments() {
        let mut verts = vec![[0, 0, 0, 0], [0, 1, 0, 0], [4, 0, 0, 0], [4, 0, 4, 0]];
        remove_degenerate_segments(&mut verts);
        assert_eq!(verts.len(), 3);
    }
}
