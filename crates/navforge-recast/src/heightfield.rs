//! Solid heightfield: per-column lists of voxel spans

use glam::Vec3;
use navforge_common::{Error, Result};

use crate::{NULL_AREA, SPAN_MAX_HEIGHT};

/// Solid interval within one grid column, in cell-height units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    pub smin: u16,
    pub smax: u16,
    pub area: u8,
}

/// Voxelized solid space.
///
/// Each of the `width * height` columns keeps its spans sorted bottom to top
/// with no two spans overlapping or touching.
#[derive(Debug, Clone)]
pub struct Heightfield {
    pub width: i32,
    pub height: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    columns: Vec<Vec<Span>>,
}

impl Heightfield {
    /// Allocates an empty grid. Width and height must both be positive.
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::InvalidMesh(format!(
                "Heightfield size must be positive, got {}x{}",
                width, height
            )));
        }
        if cs <= 0.0 || ch <= 0.0 {
            return Err(Error::InvalidMesh(
                "Invalid cell size or height".to_string(),
            ));
        }
        Ok(Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![Vec::new(); (width * height) as usize],
        })
    }

    #[inline]
    fn column_index(&self, x: i32, z: i32) -> usize {
        (x + z * self.width) as usize
    }

    /// Spans of column (x, z), bottom to top
    pub fn spans(&self, x: i32, z: i32) -> &[Span] {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return &[];
        }
        &self.columns[self.column_index(x, z)]
    }

    pub fn span_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    pub fn walkable_span_count(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .filter(|s| s.area != NULL_AREA)
            .count()
    }

    /// Inserts a span into column (x, z), merging it with every span it
    /// overlaps or touches.
    ///
    /// When the merged top lies within `flag_merge_threshold` of an existing
    /// span's top the higher area id wins, so walkable surfaces are not lost
    /// to nearby non-walkable geometry.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return Err(Error::InvalidMesh(format!(
                "Span column ({}, {}) outside heightfield",
                x, z
            )));
        }
        if smin > smax {
            return Err(Error::InvalidMesh(format!(
                "Span minimum {} above maximum {}",
                smin, smax
            )));
        }

        let idx = self.column_index(x, z);
        let column = &mut self.columns[idx];
        let mut merged = Span { smin, smax, area };
        let mut i = 0;
        while i < column.len() {
            let cur = column[i];
            if cur.smin > merged.smax {
                break;
            }
            if cur.smax < merged.smin {
                i += 1;
                continue;
            }
            merged.smin = merged.smin.min(cur.smin);
            merged.smax = merged.smax.max(cur.smax);
            if (merged.smax as i32 - cur.smax as i32).abs() <= flag_merge_threshold {
                merged.area = merged.area.max(cur.area);
            }
            column.remove(i);
        }
        column.insert(i, merged);
        Ok(())
    }

    /// Marks non-walkable spans directly above a walkable one as walkable when
    /// the step between their tops is climbable (curbs, stair risers).
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: i32) {
        for column in &mut self.columns {
            let mut previous: Option<Span> = None;
            let mut previous_walkable = false;
            for span in column.iter_mut() {
                let walkable = span.area != NULL_AREA;
                if let Some(prev) = previous {
                    if !walkable
                        && previous_walkable
                        && (span.smax as i32 - prev.smax as i32).abs() <= walkable_climb
                    {
                        span.area = prev.area;
                    }
                }
                previous_walkable = walkable;
                previous = Some(*span);
            }
        }
    }

    /// Removes walkable flags from spans on ledges: the drop to a neighbour
    /// is larger than `walkable_climb`, or the reachable neighbours span a
    /// height range too steep to stand on.
    pub fn filter_ledge_spans(&mut self, walkable_height: i32, walkable_climb: i32) {
        const DX: [i32; 4] = [-1, 0, 1, 0];
        const DZ: [i32; 4] = [0, 1, 0, -1];
        let max_height = SPAN_MAX_HEIGHT as i32;
        let mut ledges = Vec::new();

        for z in 0..self.height {
            for x in 0..self.width {
                let column = self.spans(x, z);
                for (si, span) in column.iter().enumerate() {
                    if span.area == NULL_AREA {
                        continue;
                    }
                    let bot = span.smax as i32;
                    let top = column.get(si + 1).map_or(max_height, |n| n.smin as i32);

                    let mut min_neighbor_height = max_height;
                    let mut accessible_min = bot;
                    let mut accessible_max = bot;

                    for dir in 0..4 {
                        let nx = x + DX[dir];
                        let nz = z + DZ[dir];
                        if nx < 0 || nz < 0 || nx >= self.width || nz >= self.height {
                            min_neighbor_height = min_neighbor_height.min(-walkable_climb - bot);
                            continue;
                        }
                        let neighbor = self.spans(nx, nz);

                        // Space below the first neighbour span counts as a drop
                        let nbot = -walkable_climb;
                        let ntop = neighbor.first().map_or(max_height, |n| n.smin as i32);
                        if top.min(ntop) - bot.max(nbot) > walkable_height {
                            min_neighbor_height = min_neighbor_height.min(nbot - bot);
                        }

                        for (ni, ns) in neighbor.iter().enumerate() {
                            let nbot = ns.smax as i32;
                            let ntop = neighbor.get(ni + 1).map_or(max_height, |n| n.smin as i32);
                            if top.min(ntop) - bot.max(nbot) > walkable_height {
                                min_neighbor_height = min_neighbor_height.min(nbot - bot);
                                if (nbot - bot).abs() <= walkable_climb {
                                    accessible_min = accessible_min.min(nbot);
                                    accessible_max = accessible_max.max(nbot);
                                }
                            }
                        }
                    }

                    if min_neighbor_height < -walkable_climb
                        || accessible_max - accessible_min > walkable_climb
                    {
                        ledges.push((self.column_index(x, z), si));
                    }
                }
            }
        }

        for (column, si) in ledges {
            self.columns[column][si].area = NULL_AREA;
        }
    }

    /// Removes walkable flags from spans whose clearance to the span above is
    /// less than `walkable_height` cell heights.
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: i32) {
        let max_height = SPAN_MAX_HEIGHT as i32;
        for column in &mut self.columns {
            for si in 0..column.len() {
                let bot = column[si].smax as i32;
                let top = column.get(si + 1).map_or(max_height, |n| n.smin as i32);
                if top - bot < walkable_height {
                    column[si].area = NULL_AREA;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WALKABLE_AREA;

    fn field(w: i32, h: i32) -> Heightfield {
        Heightfield::new(w, h, Vec3::ZERO, Vec3::new(w as f32, 10.0, h as f32), 1.0, 0.1).unwrap()
    }

    #[test]
    fn test_rejects_degenerate_grid() {
        assert!(Heightfield::new(0, 4, Vec3::ZERO, Vec3::ONE, 0.3, 0.2).is_err());
        assert!(Heightfield::new(4, 4, Vec3::ZERO, Vec3::ONE, 0.0, 0.2).is_err());
    }

    #[test]
    fn test_add_span_keeps_columns_sorted_and_disjoint() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 20, 25, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 0, 5, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 10, 12, NULL_AREA, 1).unwrap();
        let spans = hf.spans(0, 0);
        assert_eq!(spans.len(), 3);
        assert!(spans.windows(2).all(|w| w[0].smax < w[1].smin));

        // Bridges the two upper spans
        hf.add_span(0, 0, 11, 21, NULL_AREA, 1).unwrap();
        let spans = hf.spans(0, 0);
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[1].smin, spans[1].smax), (10, 25));
        assert_eq!(spans[1].area, WALKABLE_AREA);
    }

    #[test]
    fn test_area_merge_threshold() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 10, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 0, 20, NULL_AREA, 1).unwrap();
        assert_eq!(hf.spans(0, 0)[0].area, NULL_AREA);

        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 10, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 0, 11, NULL_AREA, 1).unwrap();
        assert_eq!(hf.spans(0, 0)[0].area, WALKABLE_AREA);
    }

    #[test]
    fn test_low_height_filter() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 10, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 14, 20, WALKABLE_AREA, 1).unwrap();
        hf.filter_walkable_low_height_spans(5);
        assert_eq!(hf.spans(0, 0)[0].area, NULL_AREA);
        assert_eq!(hf.spans(0, 0)[1].area, WALKABLE_AREA);
        assert_eq!(hf.walkable_span_count(), 1);
    }

    #[test]
    fn test_low_hanging_obstacle_becomes_walkable() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 10, WALKABLE_AREA, 0).unwrap();
        hf.add_span(0, 0, 11, 12, NULL_AREA, 0).unwrap();
        hf.filter_low_hanging_walkable_obstacles(4);
        assert_eq!(hf.span_count(), 2);
        assert_eq!(hf.spans(0, 0)[1].area, WALKABLE_AREA);

        // Too high to step onto
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 10, WALKABLE_AREA, 0).unwrap();
        hf.add_span(0, 0, 40, 42, NULL_AREA, 0).unwrap();
        hf.filter_low_hanging_walkable_obstacles(4);
        assert_eq!(hf.spans(0, 0)[1].area, NULL_AREA);
    }

    #[test]
    fn test_ledge_filter_marks_grid_edge() {
        let mut hf = field(3, 3);
        for z in 0..3 {
            for x in 0..3 {
                hf.add_span(x, z, 0, 10, WALKABLE_AREA, 1).unwrap();
            }
        }
        hf.filter_ledge_spans(5, 2);
        // Every column touches the outside of a 3x3 grid except the centre
        assert_eq!(hf.spans(1, 1)[0].area, WALKABLE_AREA);
        assert_eq!(hf.spans(0, 0)[0].area, NULL_AREA);
        assert_eq!(hf.walkable_span_count(), 1);
    }
}
