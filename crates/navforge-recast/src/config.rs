//! Voxel-space configuration for the build pipeline

use glam::Vec3;
use navforge_common::{Error, Result};

/// Build parameters expressed in voxel units.
///
/// Horizontal distances are measured in cells (`cs`), vertical ones in cell
/// heights (`ch`). World-unit presets convert into this form before a build.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct RecastConfig {
    /// Grid size along x, border included
    pub width: i32,
    /// Grid size along z, border included
    pub height: i32,

    pub cs: f32,
    pub ch: f32,

    /// Grid bounds, border included
    pub bmin: Vec3,
    pub bmax: Vec3,

    /// Maximum walkable slope in degrees
    pub walkable_slope_angle: f32,
    /// Minimum floor to ceiling clearance, in cell heights
    pub walkable_height: i32,
    /// Maximum ledge height that is still climbable, in cell heights
    pub walkable_climb: i32,
    /// Agent radius used to erode the walkable area, in cells
    pub walkable_radius: i32,

    /// Maximum length of wall contour edges, in cells (0 disables splitting)
    pub max_edge_len: i32,
    /// Maximum distance a simplified contour may deviate from the raw one, in cells
    pub max_simplification_error: f32,
    /// Regions with fewer cells than this are removed unless they touch a tile border
    pub min_region_area: i32,
    /// Regions with fewer cells than this are merged into a neighbour when possible
    pub merge_region_area: i32,
    pub max_vertices_per_polygon: i32,

    /// Detail sampling distance in world units (0 disables edge sampling)
    pub detail_sample_dist: f32,
    /// Maximum detail surface error in world units
    pub detail_sample_max_error: f32,

    /// Non-navigable padding around the grid, in cells
    pub border_size: i32,
}

impl Default for RecastConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            cs: 0.3,
            ch: 0.2,
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            walkable_slope_angle: 45.0,
            walkable_height: 10,
            walkable_climb: 4,
            walkable_radius: 2,
            max_edge_len: 40,
            max_simplification_error: 1.3,
            min_region_area: 8,
            merge_region_area: 20,
            max_vertices_per_polygon: 6,
            detail_sample_dist: 1.8,
            detail_sample_max_error: 0.2,
            border_size: 0,
        }
    }
}

impl RecastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bounds and derives the grid size from them.
    ///
    /// The grid always has at least one cell per axis and covers the max
    /// bound.
    pub fn calculate_grid_size(&mut self, bmin: Vec3, bmax: Vec3) {
        self.bmin = bmin;
        self.bmax = bmax;
        self.width = (((bmax.x - bmin.x) / self.cs).ceil() as i32).max(1);
        self.height = (((bmax.z - bmin.z) / self.cs).ceil() as i32).max(1);
    }

    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidMesh("Invalid grid size".to_string()));
        }
        if self.cs <= 0.0 || self.ch <= 0.0 {
            return Err(Error::InvalidMesh(
                "Invalid cell size or height".to_string(),
            ));
        }
        if !(0.0..=90.0).contains(&self.walkable_slope_angle) {
            return Err(Error::InvalidMesh(
                "Invalid walkable slope angle".to_string(),
            ));
        }
        if self.walkable_height < 1 {
            return Err(Error::InvalidMesh(
                "Walkable height must be at least one cell".to_string(),
            ));
        }
        if self.walkable_climb < 0 || self.walkable_radius < 0 || self.border_size < 0 {
            return Err(Error::InvalidMesh(
                "Walkable climb, radius and border size must not be negative".to_string(),
            ));
        }
        if self.max_vertices_per_polygon < 3 || self.max_vertices_per_polygon > 6 {
            return Err(Error::InvalidMesh(format!(
                "Vertices per polygon must be in 3..=6, got {}",
                self.max_vertices_per_polygon
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_size_covers_bounds() {
        let mut cfg = RecastConfig::default();
        cfg.calculate_grid_size(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(10.0, 1.0, 10.0));
        assert_eq!(cfg.width, 67);
        assert_eq!(cfg.height, 67);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_flat_bounds_still_get_one_cell() {
        let mut cfg = RecastConfig::default();
        cfg.calculate_grid_size(Vec3::ZERO, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!((cfg.width, cfg.height), (1, 1));
    }

    #[test]
    fn test_validation_errors() {
        let mut cfg = RecastConfig::default();
        assert!(cfg.validate().is_err());

        cfg.calculate_grid_size(Vec3::ZERO, Vec3::splat(3.0));
        cfg.max_vertices_per_polygon = 7;
        assert!(cfg.validate().is_err());

        cfg.max_vertices_per_polygon = 6;
        cfg.walkable_slope_angle = 120.0;
        assert!(cfg.validate().is_err());
    }
}
