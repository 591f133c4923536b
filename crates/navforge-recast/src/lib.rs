//! Navigation mesh generation from triangle soup
//!
//! The pipeline voxelizes input geometry into a [`Heightfield`], extracts the
//! walkable open space as a [`CompactHeightfield`], partitions it into
//! regions, traces region outlines into a [`ContourSet`] and finally builds a
//! convex [`PolyMesh`] with a [`PolyMeshDetail`] height surface. Every stage
//! is a plain owned value that can be dropped once the next one is built.

mod area;
mod compact_heightfield;
mod config;
mod contour;
mod detail_mesh;
mod distance_field;
mod heightfield;
mod polymesh;
mod rasterization;
mod watershed;

pub use compact_heightfield::{
    CompactCell, CompactHeightfield, CompactSpan, BORDER_REG, DIR_OFFSET_X, DIR_OFFSET_Z, MAX_LAYERS,
    NOT_CONNECTED,
};
pub use config::RecastConfig;
pub use contour::{
    Contour, ContourSet, AREA_BORDER, BORDER_VERTEX, CONTOUR_REG_MASK, CONTOUR_TESS_AREA_EDGES,
    CONTOUR_TESS_WALL_EDGES,
};
pub use detail_mesh::PolyMeshDetail;
pub use heightfield::{Heightfield, Span};
pub use polymesh::{triangulate, PolyMesh, MESH_NULL_IDX, PORTAL_FLAG};
pub use rasterization::mark_walkable_triangles;

use navforge_common::{InputGeometry, Result};

/// Area id of solid or carved-out space
pub const NULL_AREA: u8 = 0;
/// Default area id of walkable space
pub const WALKABLE_AREA: u8 = 63;
/// Height of an open span top, in cell heights
pub const SPAN_MAX_HEIGHT: u16 = 0xffff;

/// Volume whose walkable area is removed before regions are built
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum CarveVolume {
    /// Upright cylinder standing on `pos`
    Cylinder { pos: [f32; 3], radius: f32, height: f32 },
    /// Axis aligned box
    Box { bmin: [f32; 3], bmax: [f32; 3] },
}

impl CarveVolume {
    /// World-space bounds of the volume
    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        match *self {
            CarveVolume::Cylinder { pos, radius, height } => (
                [pos[0] - radius, pos[1], pos[2] - radius],
                [pos[0] + radius, pos[1] + height, pos[2] + radius],
            ),
            CarveVolume::Box { bmin, bmax } => (bmin, bmax),
        }
    }
}

/// Runs the full generation pipeline for one grid
#[derive(Debug, Clone)]
pub struct RecastBuilder {
    config: RecastConfig,
}

impl RecastBuilder {
    pub fn new(config: RecastConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecastConfig {
        &self.config
    }

    /// Builds the polygon and detail meshes for `geometry`.
    ///
    /// Geometry without walkable surfaces yields an empty mesh, not an error.
    pub fn build_mesh(&self, geometry: &InputGeometry) -> Result<(PolyMesh, PolyMeshDetail)> {
        self.build_mesh_with_volumes(geometry, &[])
    }

    /// Builds the meshes with every volume in `volumes` carved out of the
    /// walkable area.
    pub fn build_mesh_with_volumes(
        &self,
        geometry: &InputGeometry,
        volumes: &[CarveVolume],
    ) -> Result<(PolyMesh, PolyMeshDetail)> {
        self.config.validate()?;
        let cfg = &self.config;

        let heightfield = self.build_heightfield(geometry)?;
        let mut chf = self.build_compact_heightfield(&heightfield, volumes)?;
        drop(heightfield);

        chf.build_distance_field();
        chf.build_regions_watershed(cfg.border_size, cfg.min_region_area, cfg.merge_region_area);

        let cset = ContourSet::build(&chf, cfg.max_simplification_error, cfg.max_edge_len);
        let poly_mesh = PolyMesh::build(&cset, cfg.max_vertices_per_polygon as usize)?;
        let detail = PolyMeshDetail::build(
            &poly_mesh,
            &chf,
            cfg.detail_sample_dist,
            cfg.detail_sample_max_error,
        )?;

        log::info!(
            "Built {} polygons from {} triangles on a {}x{} grid",
            poly_mesh.poly_count(),
            geometry.triangle_count(),
            cfg.width,
            cfg.height
        );
        Ok((poly_mesh, detail))
    }

    /// Rasterizes walkable triangles and applies the span filters
    pub fn build_heightfield(&self, geometry: &InputGeometry) -> Result<Heightfield> {
        let cfg = &self.config;
        let mut hf = Heightfield::new(cfg.width, cfg.height, cfg.bmin, cfg.bmax, cfg.cs, cfg.ch)?;

        let areas = mark_walkable_triangles(
            cfg.walkable_slope_angle,
            geometry.vertices(),
            geometry.indices(),
        );
        hf.rasterize_triangles(geometry, &areas, cfg.walkable_climb)?;

        hf.filter_low_hanging_walkable_obstacles(cfg.walkable_climb);
        hf.filter_ledge_spans(cfg.walkable_height, cfg.walkable_climb);
        hf.filter_walkable_low_height_spans(cfg.walkable_height);

        log::debug!(
            "Heightfield {}x{}: {} spans, {} walkable",
            hf.width,
            hf.height,
            hf.span_count(),
            hf.walkable_span_count()
        );
        Ok(hf)
    }

    /// Compacts the heightfield, erodes by the agent radius and carves the
    /// given volumes.
    pub fn build_compact_heightfield(
        &self,
        hf: &Heightfield,
        volumes: &[CarveVolume],
    ) -> Result<CompactHeightfield> {
        let cfg = &self.config;
        let mut chf = CompactHeightfield::build(hf, cfg.walkable_height, cfg.walkable_climb)?;
        chf.erode_walkable_area(cfg.walkable_radius);

        for volume in volumes {
            match *volume {
                CarveVolume::Cylinder { pos, radius, height } => {
                    chf.mark_cylinder_area(&pos, radius, height, NULL_AREA)
                }
                CarveVolume::Box { bmin, bmax } => chf.mark_box_area(&bmin, &bmax, NULL_AREA),
            }
        }
        Ok(chf)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn plane(size: f32) -> InputGeometry {
        let h = size / 2.0;
        InputGeometry::new(
            vec![-h, 0.0, -h, h, 0.0, -h, h, 0.0, h, -h, 0.0, h],
            vec![0, 2, 1, 0, 3, 2],
        )
        .unwrap()
    }

    fn config_for(geometry: &InputGeometry) -> RecastConfig {
        let mut cfg = RecastConfig::default();
        let bmin = geometry.bmin();
        let bmax = geometry.bmax() + Vec3::new(0.0, 2.0, 0.0);
        cfg.calculate_grid_size(bmin, bmax);
        cfg
    }

    #[test]
    fn test_build_flat_plane() {
        let geometry = plane(20.0);
        let builder = RecastBuilder::new(config_for(&geometry));
        let (mesh, detail) = builder.build_mesh(&geometry).unwrap();
        assert!(mesh.poly_count() > 0);
        assert!(mesh.vertex_count() > 0);
        assert_eq!(detail.mesh_count(), mesh.poly_count());
        for i in 0..mesh.poly_count() {
            let nv = mesh.poly_vert_count(i);
            assert!((3..=6).contains(&nv));
        }
    }

    #[test]
    fn test_carving_removes_area() {
        let geometry = plane(20.0);
        let builder = RecastBuilder::new(config_for(&geometry));
        let hf = builder.build_heightfield(&geometry).unwrap();
        let plain = builder.build_compact_heightfield(&hf, &[]).unwrap();
        let carved = builder
            .build_compact_heightfield(
                &hf,
                &[CarveVolume::Cylinder {
                    pos: [0.0, -1.0, 0.0],
                    radius: 2.0,
                    height: 3.0,
                }],
            )
            .unwrap();
        assert!(carved.walkable_span_count() < plain.walkable_span_count());
    }

    #[test]
    fn test_steep_geometry_is_not_walkable() {
        let wall = InputGeometry::new(
            vec![0.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0],
            vec![0, 1, 2, 0, 2, 3],
        )
        .unwrap();
        let mut cfg = RecastConfig::default();
        cfg.calculate_grid_size(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 10.0, 10.0));
        let (mesh, _) = RecastBuilder::new(cfg).build_mesh(&wall).unwrap();
        assert_eq!(mesh.poly_count(), 0);
    }

    #[test]
    fn test_carve_volume_bounds() {
        let c = CarveVolume::Cylinder {
            pos: [1.0, 0.0, 1.0],
            radius: 0.5,
            height: 2.0,
        };
        assert_eq!(c.bounds(), ([0.5, 0.0, 0.5], [1.5, 2.0, 1.5]));
    }
}
