//! Height detail triangulation attached to each polygon

use glam::Vec3;
use navforge_common::{Error, Result};

use crate::compact_heightfield::CompactHeightfield;
use crate::polymesh::PolyMesh;

/// Upper bound on samples inserted along one polygon edge
const MAX_EDGE_SAMPLES: usize = 16;

/// Detail sub-meshes, one per polygon of the source [`PolyMesh`].
///
/// `meshes[i]` is `[vert_base, vert_count, tri_base, tri_count]`. The first
/// vertices of every sub-mesh are the polygon's own vertices in world space;
/// triangle indices are local to the sub-mesh.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyMeshDetail {
    pub meshes: Vec<[u32; 4]>,
    pub verts: Vec<[f32; 3]>,
    pub tris: Vec<[u8; 3]>,
}

impl PolyMeshDetail {
    /// Samples the compact heightfield along polygon edges and inserts the
    /// points that deviate more than `sample_max_error` from the straight
    /// edge. Polygons without inserted samples are fanned from their first
    /// vertex; the others are fanned around a sampled centre point.
    pub fn build(
        mesh: &PolyMesh,
        chf: &CompactHeightfield,
        sample_dist: f32,
        sample_max_error: f32,
    ) -> Result<Self> {
        let mut detail = Self::default();
        if mesh.poly_count() == 0 {
            return Ok(detail);
        }
        if mesh.nvp * (MAX_EDGE_SAMPLES + 1) + 1 > u8::MAX as usize {
            return Err(Error::NavMeshGeneration(format!(
                "Too many detail vertices per polygon (nvp {})",
                mesh.nvp
            )));
        }

        let sampler = HeightSampler { chf };

        for p in 0..mesh.poly_count() {
            let poly: Vec<Vec3> = mesh
                .poly(p)
                .iter()
                .take_while(|&&v| v != crate::polymesh::MESH_NULL_IDX)
                .map(|&v| mesh.vertex_position(v as usize))
                .collect();
            let nv = poly.len();

            // Hull in polygon order, with (vertex index, is_sample)
            let mut extra: Vec<Vec3> = Vec::new();
            let mut hull: Vec<usize> = Vec::with_capacity(nv);
            for i in 0..nv {
                hull.push(i);
                if sample_dist <= 0.0 {
                    continue;
                }
                let a = poly[i];
                let b = poly[(i + 1) % nv];
                for s in sampler.edge_samples(a, b, sample_dist, sample_max_error) {
                    hull.push(nv + extra.len());
                    extra.push(s);
                }
            }

            let vert_base = detail.verts.len() as u32;
            let tri_base = detail.tris.len() as u32;
            detail.verts.extend(poly.iter().map(|v| v.to_array()));

            if extra.is_empty() {
                for i in 1..nv - 1 {
                    detail.tris.push([0, i as u8, (i + 1) as u8]);
                }
            } else {
                detail.verts.extend(extra.iter().map(|v| v.to_array()));
                let mut centre = poly.iter().copied().sum::<Vec3>() / nv as f32;
                centre.y = sampler.height_at(centre).unwrap_or(centre.y);
                let ci = (nv + extra.len()) as u8;
                detail.verts.push(centre.to_array());
                for i in 0..hull.len() {
                    let a = hull[i] as u8;
                    let b = hull[(i + 1) % hull.len()] as u8;
                    detail.tris.push([ci, a, b]);
                }
            }

            let vert_count = detail.verts.len() as u32 - vert_base;
            let tri_count = detail.tris.len() as u32 - tri_base;
            detail.meshes.push([vert_base, vert_count, tri_base, tri_count]);
        }

        log::debug!(
            "Detail mesh: {} sub-meshes, {} vertices, {} triangles",
            detail.meshes.len(),
            detail.verts.len(),
            detail.tris.len()
        );
        Ok(detail)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.tris.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.verts.len()
    }
}

struct HeightSampler<'a> {
    chf: &'a CompactHeightfield,
}

impl HeightSampler<'_> {
    /// Floor height of the span closest to `p.y` in the column under `p`,
    /// looking one cell further out when that column is empty.
    fn height_at(&self, p: Vec3) -> Option<f32> {
        let chf = self.chf;
        let ix = ((p.x - chf.bmin.x) / chf.cs).floor() as i32;
        let iz = ((p.z - chf.bmin.z) / chf.cs).floor() as i32;

        for radius in 0..=1 {
            let mut best: Option<f32> = None;
            for z in iz - radius..=iz + radius {
                for x in ix - radius..=ix + radius {
                    if x < 0 || z < 0 || x >= chf.width || z >= chf.height {
                        continue;
                    }
                    let cell = chf.cell(x, z);
                    for i in cell.index..cell.index + cell.count {
                        let y = chf.bmin.y + chf.spans[i].y as f32 * chf.ch;
                        if best.map_or(true, |b| (y - p.y).abs() < (b - p.y).abs()) {
                            best = Some(y);
                        }
                    }
                }
            }
            if best.is_some() {
                return best;
            }
        }
        None
    }

    /// Interior points of edge a-b whose sampled height deviates from the
    /// edge by more than `max_error`, ordered from `a` to `b`.
    ///
    /// The edge is always walked from its lexically smaller end so both
    /// polygons sharing it produce the same points.
    fn edge_samples(&self, a: Vec3, b: Vec3, sample_dist: f32, max_error: f32) -> Vec<Vec3> {
        let swapped = (b.x, b.z) < (a.x, a.z);
        let (p, q) = if swapped { (b, a) } else { (a, b) };

        let len = Vec3::new(q.x - p.x, 0.0, q.z - p.z).length();
        let segments = ((len / sample_dist).floor() as usize + 1).min(MAX_EDGE_SAMPLES + 1);
        if segments < 2 {
            return Vec::new();
        }

        let mut samples = Vec::new();
        for k in 1..segments {
            let t = k as f32 / segments as f32;
            let mut s = p.lerp(q, t);
            let Some(h) = self.height_at(s) else {
                continue;
            };
            if (h - s.y).abs() > max_error {
                s.y = h;
                samples.push(s);
            }
        }
        if swapped {
            samples.reverse();
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::ContourSet;
    use crate::test_util::flat_compact;

    fn pipeline(w: i32, h: i32) -> (PolyMesh, CompactHeightfield) {
        let mut chf = flat_compact(w, h);
        chf.build_distance_field();
        chf.build_regions_watershed(0, 8, 20);
        let cset = ContourSet::build(&chf, 1.3, 12);
        let mesh = PolyMesh::build(&cset, 6).unwrap();
        (mesh, chf)
    }

    #[test]
    fn test_one_sub_mesh_per_polygon() {
        let (mesh, chf) = pipeline(16, 16);
        let detail = PolyMeshDetail::build(&mesh, &chf, 1.8, 0.2).unwrap();
        assert_eq!(detail.mesh_count(), mesh.poly_count());
        for m in &detail.meshes {
            assert!(m[3] >= 1);
            for t in &detail.tris[m[2] as usize..(m[2] + m[3]) as usize] {
                for &v in t {
                    assert!((v as u32) < m[1]);
                }
            }
        }
    }

    #[test]
    fn test_flat_ground_needs_no_samples() {
        let (mesh, chf) = pipeline(10, 10);
        let detail = PolyMeshDetail::build(&mesh, &chf, 1.0, 0.5).unwrap();
        for (p, m) in detail.meshes.iter().enumerate() {
            assert_eq!(m[1] as usize, mesh.poly_vert_count(p));
            assert_eq!(m[3] as usize, mesh.poly_vert_count(p) - 2);
        }
    }

    #[test]
    fn test_height_sampling_picks_nearest_span() {
        let (_, chf) = pipeline(4, 4);
        let sampler = HeightSampler { chf: &chf };
        let h = sampler.height_at(Vec3::new(1.5, 3.0, 1.5)).unwrap();
        approx::assert_relative_eq!(h, 1.0);
        assert!(sampler.height_at(Vec3::new(50.0, 0.0, 50.0)).is_none());
    }

    #[test]
    fn test_empty_mesh() {
        let (mesh, chf) = pipeline(4, 4);
        let empty = PolyMesh {
            polys: Vec::new(),
            npolys: 0,
            ..mesh
        };
        let detail = PolyMeshDetail::build(&empty, &chf, 1.8, 0.2).unwrap();
        assert_eq!(detail.mesh_count(), 0);
    }
}
