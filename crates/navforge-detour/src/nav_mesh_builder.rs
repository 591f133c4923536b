//! Builders that turn input geometry into runtime navigation meshes
//!
//! [`NavMeshBuilder`] runs the Recast pipeline once over the whole input and
//! produces a single-tile mesh. [`TiledNavMeshBuilder`] splits the bounds
//! into a grid of square tiles, builds each one with a padded border and
//! lets [`NavMesh::add_tile`] stitch the tiles together.

use glam::Vec3;
use navforge_common::{Error, InputGeometry};
use navforge_recast::{
    CarveVolume, PolyMesh, PolyMeshDetail, RecastBuilder, RecastConfig, MESH_NULL_IDX, PORTAL_FLAG,
    WALKABLE_AREA,
};

use crate::nav_mesh::{MeshTile, NavMesh, Poly, PolyDetail, TileHeader};
use crate::{NavMeshParams, PolyFlags, PolyType, EXT_LINK, MAX_VERTS_PER_POLY};

/// Extra cells of padding around every tile beyond the agent radius
const TILE_BORDER_PADDING: i32 = 3;

/// Build parameters in world units
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshBuildConfig {
    pub cell_size: f32,
    pub cell_height: f32,
    pub walkable_height: f32,
    pub walkable_climb: f32,
    pub walkable_radius: f32,
    /// Degrees
    pub walkable_slope_angle: f32,
    /// In cells
    pub min_region_area: i32,
    /// In cells
    pub merge_region_area: i32,
    /// In cells
    pub max_simplification_error: f32,
    pub max_edge_length: f32,
    pub max_verts_per_poly: usize,
    /// Tile edge length in cells
    pub tile_size: i32,
    /// In cells; values below 0.9 disable detail sampling
    pub detail_sample_dist: f32,
    /// In cell heights
    pub detail_sample_max_error: f32,
}

impl Default for NavMeshBuildConfig {
    fn default() -> Self {
        Self {
            cell_size: 0.3,
            cell_height: 0.2,
            walkable_height: 2.0,
            walkable_climb: 0.9,
            walkable_radius: 0.6,
            walkable_slope_angle: 45.0,
            min_region_area: 8,
            merge_region_area: 20,
            max_simplification_error: 1.3,
            max_edge_length: 12.0,
            max_verts_per_poly: 6,
            tile_size: 32,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
        }
    }
}

impl NavMeshBuildConfig {
    pub fn walkable_radius_cells(&self) -> i32 {
        (self.walkable_radius / self.cell_size).ceil() as i32
    }

    /// Border of a tiled build, in cells
    pub fn tile_border_size(&self) -> i32 {
        self.walkable_radius_cells() + TILE_BORDER_PADDING
    }

    /// Converts to voxel units for the grid `bmin`..`bmax` padded by
    /// `border_size` cells on every side
    pub fn to_recast_config(&self, bmin: Vec3, bmax: Vec3, border_size: i32) -> RecastConfig {
        let cs = self.cell_size;
        let ch = self.cell_height;
        let mut cfg = RecastConfig {
            cs,
            ch,
            walkable_slope_angle: self.walkable_slope_angle,
            walkable_height: (self.walkable_height / ch).ceil() as i32,
            walkable_climb: (self.walkable_climb / ch).floor() as i32,
            walkable_radius: self.walkable_radius_cells(),
            max_edge_len: (self.max_edge_length / cs) as i32,
            max_simplification_error: self.max_simplification_error,
            min_region_area: self.min_region_area,
            merge_region_area: self.merge_region_area,
            max_vertices_per_polygon: self.max_verts_per_poly as i32,
            detail_sample_dist: if self.detail_sample_dist < 0.9 {
                0.0
            } else {
                cs * self.detail_sample_dist
            },
            detail_sample_max_error: ch * self.detail_sample_max_error,
            border_size,
            ..RecastConfig::default()
        };
        let pad = Vec3::new(border_size as f32 * cs, 0.0, border_size as f32 * cs);
        cfg.calculate_grid_size(bmin - pad, bmax + pad);
        cfg
    }

    fn validate(&self) -> navforge_common::Result<()> {
        if self.cell_size <= 0.0 || self.cell_height <= 0.0 {
            return Err(Error::NavMeshGeneration(
                "Cell size and height must be positive".to_string(),
            ));
        }
        if self.tile_size <= 0 {
            return Err(Error::NavMeshGeneration("Tile size must be positive".to_string()));
        }
        if !(3..=MAX_VERTS_PER_POLY).contains(&self.max_verts_per_poly) {
            return Err(Error::NavMeshGeneration(format!(
                "Vertices per polygon must be in 3..={}, got {}",
                MAX_VERTS_PER_POLY, self.max_verts_per_poly
            )));
        }
        Ok(())
    }
}

/// Size of a built mesh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub poly_count: usize,
    pub vertex_count: usize,
    pub detail_mesh_count: usize,
    pub detail_triangle_count: usize,
}

/// Outcome of [`NavMeshBuilder::build_single`]
#[derive(Debug)]
pub struct NavMeshBuildResult {
    pub success: bool,
    pub nav_mesh: Option<NavMesh>,
    pub poly_mesh: Option<PolyMesh>,
    pub error_message: Option<String>,
    pub stats: BuildStats,
}

impl NavMeshBuildResult {
    fn failed(message: String) -> Self {
        log::warn!("Navigation mesh build failed: {}", message);
        Self {
            success: false,
            nav_mesh: None,
            poly_mesh: None,
            error_message: Some(message),
            stats: BuildStats::default(),
        }
    }
}

/// Single-tile builder
#[derive(Debug, Clone, Copy, Default)]
pub struct NavMeshBuilder;

impl NavMeshBuilder {
    /// Builds a one-tile navigation mesh covering the whole input
    pub fn build_single(geometry: &InputGeometry, config: &NavMeshBuildConfig) -> NavMeshBuildResult {
        if geometry.is_empty() {
            return NavMeshBuildResult::failed("Input geometry is empty".to_string());
        }
        if let Err(e) = config.validate() {
            return NavMeshBuildResult::failed(e.to_string());
        }

        let bmin = geometry.bmin();
        let bmax = geometry.bmax();
        let rc = config.to_recast_config(bmin, bmax, 0);
        let (poly_mesh, detail) = match RecastBuilder::new(rc).build_mesh(geometry) {
            Ok(meshes) => meshes,
            Err(e) => return NavMeshBuildResult::failed(e.to_string()),
        };
        if poly_mesh.poly_count() == 0 {
            return NavMeshBuildResult::failed("No walkable polygons were generated".to_string());
        }

        let tile = match create_tile(&poly_mesh, &detail, 0, 0, config) {
            Ok(tile) => tile,
            Err(e) => return NavMeshBuildResult::failed(e.to_string()),
        };
        let stats = BuildStats {
            poly_count: tile.poly_count(),
            vertex_count: tile.vertex_count(),
            detail_mesh_count: tile.detail_meshes.len(),
            detail_triangle_count: tile.detail_tris.len(),
        };

        let mut nav_mesh = NavMesh::new(NavMeshParams {
            origin: bmin.to_array(),
            tile_width: (bmax.x - bmin.x).max(config.cell_size),
            tile_height: (bmax.z - bmin.z).max(config.cell_size),
            max_tiles: 1,
            max_polys_per_tile: poly_mesh.poly_count().max(1) * 2 + 256,
        });
        if let Err(status) = nav_mesh.add_tile(tile) {
            return NavMeshBuildResult::failed(status.to_string());
        }

        log::info!(
            "Built single-tile navigation mesh: {} polygons, {} vertices",
            stats.poly_count,
            stats.vertex_count
        );
        NavMeshBuildResult {
            success: true,
            nav_mesh: Some(nav_mesh),
            poly_mesh: Some(poly_mesh),
            error_message: None,
            stats,
        }
    }
}

/// Converts a Recast polygon mesh and its detail mesh into a tile
pub fn create_tile(
    mesh: &PolyMesh,
    detail: &PolyMeshDetail,
    x: i32,
    z: i32,
    config: &NavMeshBuildConfig,
) -> navforge_common::Result<MeshTile> {
    if mesh.vertex_count() > u16::MAX as usize {
        return Err(Error::NavMeshGeneration(format!(
            "Too many vertices for one tile: {}",
            mesh.vertex_count()
        )));
    }
    if mesh.max_verts_per_poly() > MAX_VERTS_PER_POLY {
        return Err(Error::NavMeshGeneration(format!(
            "Polygons may have at most {} vertices",
            MAX_VERTS_PER_POLY
        )));
    }
    if detail.mesh_count() != mesh.poly_count() {
        return Err(Error::NavMeshGeneration(format!(
            "Detail mesh count {} does not match polygon count {}",
            detail.mesh_count(),
            mesh.poly_count()
        )));
    }

    let mut tile = MeshTile::new(TileHeader {
        x,
        z,
        bmin: mesh.bmin.to_array(),
        bmax: mesh.bmax.to_array(),
        walkable_height: config.walkable_height,
        walkable_radius: config.walkable_radius,
        walkable_climb: config.walkable_climb,
    });

    tile.verts = (0..mesh.vertex_count())
        .map(|v| mesh.vertex_position(v).to_array())
        .collect();

    for i in 0..mesh.poly_count() {
        let area = mesh.areas[i];
        let flags = if area == WALKABLE_AREA {
            PolyFlags::WALK
        } else {
            PolyFlags::empty()
        };
        let mut poly = Poly::new(area, PolyType::Ground, flags);
        let nv = mesh.poly_vert_count(i);
        poly.vert_count = nv as u8;
        poly.verts[..nv].copy_from_slice(&mesh.poly(i)[..nv]);
        for (j, &n) in mesh.poly_neighbors(i)[..nv].iter().enumerate() {
            poly.neighbors[j] = if n == MESH_NULL_IDX {
                0
            } else if n & PORTAL_FLAG != 0 {
                EXT_LINK | (n & 0xf)
            } else {
                n + 1
            };
        }
        tile.polys.push(poly);
    }

    tile.detail_meshes = detail
        .meshes
        .iter()
        .map(|m| PolyDetail {
            vert_base: m[0],
            vert_count: m[1],
            tri_base: m[2],
            tri_count: m[3],
        })
        .collect();
    tile.detail_verts = detail.verts.clone();
    tile.detail_tris = detail.tris.clone();

    // Heights of the detail surface may reach past the voxel bounds
    for v in tile.verts.iter().chain(tile.detail_verts.iter()) {
        tile.header.bmin[1] = tile.header.bmin[1].min(v[1]);
        tile.header.bmax[1] = tile.header.bmax[1].max(v[1]);
    }

    tile.build_bv_tree();
    Ok(tile)
}

/// Outcome of [`TiledNavMeshBuilder::build_all`]
#[derive(Debug)]
pub struct TiledNavMeshBuildResult {
    pub success: bool,
    pub nav_mesh: Option<NavMesh>,
    /// Tiles that produced polygons
    pub tile_count: usize,
    pub total_poly_count: usize,
    pub total_tiles_attempted: usize,
    pub error_message: Option<String>,
    pub tile_count_x: i32,
    pub tile_count_z: i32,
}

/// Grid of square tiles over fixed world bounds
#[derive(Debug, Clone, Default)]
pub struct TiledNavMeshBuilder {
    config: NavMeshBuildConfig,
    bmin: [f32; 3],
    bmax: [f32; 3],
    tile_count_x: i32,
    tile_count_z: i32,
    initialized: bool,
}

impl TiledNavMeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lays out the tile grid over `bmin`..`bmax`
    pub fn initialize(
        &mut self,
        bmin: [f32; 3],
        bmax: [f32; 3],
        config: &NavMeshBuildConfig,
    ) -> navforge_common::Result<()> {
        config.validate()?;
        if bmax[0] <= bmin[0] || bmax[2] <= bmin[2] {
            return Err(Error::InvalidMesh(format!(
                "Empty build bounds {:?}..{:?}",
                bmin, bmax
            )));
        }
        let tile_world = config.tile_size as f32 * config.cell_size;
        self.config = config.clone();
        self.bmin = bmin;
        self.bmax = bmax;
        self.tile_count_x = ((bmax[0] - bmin[0]) / tile_world).ceil().max(1.0) as i32;
        self.tile_count_z = ((bmax[2] - bmin[2]) / tile_world).ceil().max(1.0) as i32;
        self.initialized = true;

        log::debug!(
            "Tile grid {}x{} with {} world units per tile",
            self.tile_count_x,
            self.tile_count_z,
            tile_world
        );
        Ok(())
    }

    pub fn config(&self) -> &NavMeshBuildConfig {
        &self.config
    }

    pub fn tile_count_x(&self) -> i32 {
        self.tile_count_x
    }

    pub fn tile_count_z(&self) -> i32 {
        self.tile_count_z
    }

    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        (self.bmin, self.bmax)
    }

    fn tile_world_size(&self) -> f32 {
        self.config.tile_size as f32 * self.config.cell_size
    }

    /// World bounds of tile (tx, tz); the last row and column end at the
    /// world bounds
    pub fn tile_bounds(&self, tx: i32, tz: i32) -> ([f32; 3], [f32; 3]) {
        let size = self.tile_world_size();
        let min_x = self.bmin[0] + tx as f32 * size;
        let min_z = self.bmin[2] + tz as f32 * size;
        let max_x = if tx >= self.tile_count_x - 1 {
            self.bmax[0]
        } else {
            min_x + size
        };
        let max_z = if tz >= self.tile_count_z - 1 {
            self.bmax[2]
        } else {
            min_z + size
        };
        ([min_x, self.bmin[1], min_z], [max_x, self.bmax[1], max_z])
    }

    /// Tile containing a world position, clamped to the grid
    pub fn tile_coord(&self, x: f32, z: f32) -> (i32, i32) {
        let size = self.tile_world_size();
        let tx = ((x - self.bmin[0]) / size).floor() as i32;
        let tz = ((z - self.bmin[2]) / size).floor() as i32;
        (
            tx.clamp(0, (self.tile_count_x - 1).max(0)),
            tz.clamp(0, (self.tile_count_z - 1).max(0)),
        )
    }

    /// Parameters for a mesh that holds this grid
    pub fn nav_mesh_params(&self) -> NavMeshParams {
        let size = self.tile_world_size();
        NavMeshParams {
            origin: self.bmin,
            tile_width: size,
            tile_height: size,
            max_tiles: (self.tile_count_x * self.tile_count_z).max(1) as usize,
            max_polys_per_tile: 1 << 16,
        }
    }

    /// Voxel configuration of tile (tx, tz), border included
    pub fn tile_recast_config(&self, tx: i32, tz: i32) -> RecastConfig {
        let (tbmin, tbmax) = self.tile_bounds(tx, tz);
        let cs = self.config.cell_size;
        let border = self.config.tile_border_size();
        let mut rc = self
            .config
            .to_recast_config(Vec3::from(tbmin), Vec3::from(tbmax), border);

        // Pin the grid size so neighbouring tiles share boundary vertices
        let cells = |extent: f32, last: bool| {
            if last {
                ((extent / cs) - 1e-3).ceil().max(1.0) as i32
            } else {
                self.config.tile_size
            }
        };
        let wx = cells(tbmax[0] - tbmin[0], tx >= self.tile_count_x - 1) + 2 * border;
        let wz = cells(tbmax[2] - tbmin[2], tz >= self.tile_count_z - 1) + 2 * border;
        rc.width = wx;
        rc.height = wz;
        rc.bmax.x = rc.bmin.x + wx as f32 * cs;
        rc.bmax.z = rc.bmin.z + wz as f32 * cs;
        rc
    }

    /// Builds one tile with the given volumes carved out. `Ok(None)` when
    /// the tile has no walkable surface.
    pub fn build_tile(
        &self,
        geometry: &InputGeometry,
        tx: i32,
        tz: i32,
        volumes: &[CarveVolume],
    ) -> navforge_common::Result<Option<MeshTile>> {
        if !self.initialized {
            return Err(Error::NavMeshGeneration(
                "Tiled builder used before initialize".to_string(),
            ));
        }
        if tx < 0 || tz < 0 || tx >= self.tile_count_x || tz >= self.tile_count_z {
            return Err(Error::NavMeshGeneration(format!("Tile ({}, {}) is outside the grid", tx, tz)));
        }

        let rc = self.tile_recast_config(tx, tz);
        let (poly_mesh, detail) = RecastBuilder::new(rc).build_mesh_with_volumes(geometry, volumes)?;
        if poly_mesh.poly_count() == 0 {
            return Ok(None);
        }
        create_tile(&poly_mesh, &detail, tx, tz, &self.config).map(Some)
    }

    /// Builds and stitches every tile of the grid
    pub fn build_all(&self, geometry: &InputGeometry) -> TiledNavMeshBuildResult {
        let mut result = TiledNavMeshBuildResult {
            success: false,
            nav_mesh: None,
            tile_count: 0,
            total_poly_count: 0,
            total_tiles_attempted: 0,
            error_message: None,
            tile_count_x: self.tile_count_x,
            tile_count_z: self.tile_count_z,
        };
        if !self.initialized {
            result.error_message = Some("Tiled builder used before initialize".to_string());
            return result;
        }
        if geometry.is_empty() {
            result.error_message = Some("Input geometry is empty".to_string());
            return result;
        }

        let mut nav_mesh = NavMesh::new(self.nav_mesh_params());
        for tz in 0..self.tile_count_z {
            for tx in 0..self.tile_count_x {
                result.total_tiles_attempted += 1;
                let tile = match self.build_tile(geometry, tx, tz, &[]) {
                    Ok(Some(tile)) => tile,
                    Ok(None) => {
                        log::debug!("Tile ({}, {}) has no walkable surface", tx, tz);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Failed to build tile ({}, {}): {}", tx, tz, e);
                        continue;
                    }
                };
                let polys = tile.poly_count();
                match nav_mesh.add_tile(tile) {
                    Ok(_) => {
                        result.tile_count += 1;
                        result.total_poly_count += polys;
                    }
                    Err(status) => log::warn!("Failed to add tile ({}, {}): {}", tx, tz, status),
                }
            }
        }

        if result.tile_count == 0 {
            result.error_message = Some(format!(
                "None of the {} tiles produced walkable polygons",
                result.total_tiles_attempted
            ));
            return result;
        }

        log::info!(
            "Built {} of {} tiles with {} polygons",
            result.tile_count,
            result.total_tiles_attempted,
            result.total_poly_count
        );
        result.success = true;
        result.nav_mesh = Some(nav_mesh);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recast_config_conversion() {
        let cfg = NavMeshBuildConfig::default();
        let rc = cfg.to_recast_config(Vec3::ZERO, Vec3::new(3.0, 1.0, 6.0), 0);
        assert_eq!(rc.walkable_height, 10);
        assert_eq!(rc.walkable_climb, 4);
        assert_eq!(rc.walkable_radius, 2);
        assert_eq!((rc.width, rc.height), (10, 20));
        assert!((rc.detail_sample_dist - 1.8).abs() < 1e-5);

        let mut no_detail = cfg.clone();
        no_detail.detail_sample_dist = 0.5;
        assert_eq!(no_detail.to_recast_config(Vec3::ZERO, Vec3::ONE, 0).detail_sample_dist, 0.0);

        let padded = cfg.to_recast_config(Vec3::ZERO, Vec3::new(3.0, 1.0, 3.0), 5);
        assert_eq!(padded.border_size, 5);
        assert!((padded.bmin.x + 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_tile_grid_layout() {
        let mut builder = TiledNavMeshBuilder::new();
        let cfg = NavMeshBuildConfig::default();
        builder.initialize([-10.0, 0.0, -10.0], [10.0, 1.0, 10.0], &cfg).unwrap();
        // 32 cells of 0.3 are 9.6 units per tile
        assert_eq!(builder.tile_count_x(), 3);
        assert_eq!(builder.tile_count_z(), 3);

        let (min, _) = builder.tile_bounds(0, 0);
        assert_eq!(min, [-10.0, 0.0, -10.0]);
        let (_, max) = builder.tile_bounds(2, 2);
        assert_eq!(max, [10.0, 1.0, 10.0]);

        assert_eq!(builder.tile_coord(-100.0, 100.0), (0, 2));
        assert_eq!(builder.tile_coord(0.0, 0.0), (1, 1));

        let rc = builder.tile_recast_config(1, 0);
        let border = cfg.tile_border_size();
        assert_eq!(rc.width, 32 + 2 * border);
    }

    #[test]
    fn test_initialize_rejects_empty_bounds() {
        let mut builder = TiledNavMeshBuilder::new();
        let cfg = NavMeshBuildConfig::default();
        assert!(builder.initialize([0.0; 3], [0.0, 1.0, 5.0], &cfg).is_err());
        let geom = crate::test_geometry::flat_plane(4.0).unwrap();
        assert!(builder.build_tile(&geom, 0, 0, &[]).is_err());
        assert!(!builder.build_all(&geom).success);
    }
}
