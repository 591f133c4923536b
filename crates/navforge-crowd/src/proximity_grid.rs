//! Uniform spatial hash over the XZ plane for neighbour lookups
//!
//! The crowd clears and refills the grid once per tick, so there is no
//! incremental move operation.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CellCoord {
    x: i32,
    z: i32,
}

#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    cells: HashMap<CellCoord, Vec<usize>>,
    item_count: usize,
}

impl ProximityGrid {
    pub fn new(cell_size: f32) -> Self {
        let cell_size = cell_size.max(0.1);
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::new(),
            item_count: 0,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn clear(&mut self) {
        // Keep the cell vectors around for the next fill
        for items in self.cells.values_mut() {
            items.clear();
        }
        self.item_count = 0;
    }

    /// Inserts `id` into every cell overlapped by the circle at `pos`
    pub fn add_item(&mut self, id: usize, pos: &[f32; 3], radius: f32) {
        let (min, max) = self.cell_range(pos, radius);
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                self.cells.entry(CellCoord { x, z }).or_default().push(id);
            }
        }
        self.item_count += 1;
    }

    /// Ids stored in cells overlapped by the circle, without duplicates and
    /// in ascending order
    pub fn query_items(&self, pos: &[f32; 3], radius: f32) -> Vec<usize> {
        let (min, max) = self.cell_range(pos, radius);
        let mut found = Vec::new();
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                if let Some(items) = self.cells.get(&CellCoord { x, z }) {
                    found.extend_from_slice(items);
                }
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    fn cell_range(&self, pos: &[f32; 3], radius: f32) -> (CellCoord, CellCoord) {
        let r = radius.max(0.0);
        let cell = |v: f32| (v * self.inv_cell_size).floor() as i32;
        (
            CellCoord {
                x: cell(pos[0] - r),
                z: cell(pos[2] - r),
            },
            CellCoord {
                x: cell(pos[0] + r),
                z: cell(pos[2] + r),
            },
        )
    }
}

impl Default for ProximityGrid {
    fn default() -> Self {
        Self::new(4.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_finds_nearby_only() {
        let mut grid = ProximityGrid::new(2.0);
        grid.add_item(0, &[0.5, 0.0, 0.5], 0.5);
        grid.add_item(1, &[1.5, 0.0, 0.5], 0.5);
        grid.add_item(2, &[20.0, 0.0, 20.0], 0.5);
        assert_eq!(grid.item_count(), 3);

        assert_eq!(grid.query_items(&[1.0, 0.0, 1.0], 1.0), vec![0, 1]);
        assert_eq!(grid.query_items(&[20.0, 0.0, 20.0], 0.1), vec![2]);
        assert!(grid.query_items(&[-30.0, 0.0, 0.0], 1.0).is_empty());
    }

    #[test]
    fn test_straddling_item_reported_once() {
        let mut grid = ProximityGrid::new(1.0);
        grid.add_item(7, &[1.0, 0.0, 1.0], 0.6);
        assert_eq!(grid.query_items(&[1.0, 0.0, 1.0], 2.0), vec![7]);
    }

    #[test]
    fn test_clear() {
        let mut grid = ProximityGrid::default();
        grid.add_item(0, &[0.0; 3], 1.0);
        grid.clear();
        assert_eq!(grid.item_count(), 0);
        assert!(grid.query_items(&[0.0; 3], 5.0).is_empty());
    }
}
