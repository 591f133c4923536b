//! Polygon filters and traversal costs used by every query

use navforge_common::math::vdist;

use crate::nav_mesh::{MeshTile, Poly};
use crate::{PolyFlags, PolyRef, MAX_AREAS};

/// Object-safe cloning for boxed filters
pub trait QueryFilterClone {
    fn clone_box(&self) -> Box<dyn QueryFilter>;
}

impl<T> QueryFilterClone for T
where
    T: QueryFilter + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn QueryFilter> {
        Box::new(self.clone())
    }
}

/// Decides which polygons a query may visit and what crossing them costs.
///
/// Implementors customise traversal per caller, for example to restrict an
/// agent to a layer mask or to make water expensive.
pub trait QueryFilter: QueryFilterClone + std::fmt::Debug {
    /// True if the polygon may be visited
    fn pass_filter(&self, reference: PolyRef, tile: &MeshTile, poly: &Poly) -> bool;

    /// Cost of moving from `pa` to `pb` inside polygon `reference`
    fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], reference: PolyRef, tile: &MeshTile, poly: &Poly) -> f32;
}

impl Clone for Box<dyn QueryFilter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Flag based filter with a cost multiplier per area id
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct DefaultQueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons must have none of these flags
    pub exclude_flags: PolyFlags,
    area_cost: Vec<f32>,
}

impl Default for DefaultQueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
            area_cost: vec![1.0; MAX_AREAS],
        }
    }
}

impl DefaultQueryFilter {
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Self::default()
        }
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    /// Sets the cost multiplier of an area; ids past the table are ignored
    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(c) = self.area_cost.get_mut(area as usize) {
            *c = cost;
        }
    }
}

impl QueryFilter for DefaultQueryFilter {
    fn pass_filter(&self, _reference: PolyRef, _tile: &MeshTile, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], _reference: PolyRef, _tile: &MeshTile, poly: &Poly) -> f32 {
        vdist(pa, pb) * self.area_cost(poly.area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav_mesh::TileHeader;
    use crate::PolyType;

    #[test]
    fn test_default_filter_flags() {
        let tile = MeshTile::new(TileHeader::new(0, 0));
        let filter = DefaultQueryFilter::default();
        let walk = Poly::new(1, PolyType::Ground, PolyFlags::WALK);
        let none = Poly::new(1, PolyType::Ground, PolyFlags::empty());
        assert!(filter.pass_filter(PolyRef::NULL, &tile, &walk));
        assert!(!filter.pass_filter(PolyRef::NULL, &tile, &none));

        let no_doors = DefaultQueryFilter::new(PolyFlags::ALL, PolyFlags::DOOR);
        let door = Poly::new(1, PolyType::Ground, PolyFlags::WALK | PolyFlags::DOOR);
        assert!(!no_doors.pass_filter(PolyRef::NULL, &tile, &door));
    }

    #[test]
    fn test_area_cost_scales_distance() {
        let tile = MeshTile::new(TileHeader::new(0, 0));
        let mut filter = DefaultQueryFilter::default();
        filter.set_area_cost(5, 3.0);
        filter.set_area_cost(200, 9.0);
        assert_eq!(filter.area_cost(200), 1.0);

        let poly = Poly::new(5, PolyType::Ground, PolyFlags::WALK);
        let cost = filter.get_cost(&[0.0; 3], &[2.0, 0.0, 0.0], PolyRef::NULL, &tile, &poly);
        assert!((cost - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_boxed_filter_clones() {
        let boxed: Box<dyn QueryFilter> = Box::new(DefaultQueryFilter::default());
        let copy = boxed.clone();
        let tile = MeshTile::new(TileHeader::new(0, 0));
        let poly = Poly::new(1, PolyType::Ground, PolyFlags::WALK);
        assert!(copy.pass_filter(PolyRef::NULL, &tile, &poly));
    }
}
