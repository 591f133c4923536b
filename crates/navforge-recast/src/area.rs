//! Area edits on the compact heightfield: erosion and volume marking

use crate::compact_heightfield::CompactHeightfield;
use crate::NULL_AREA;

/// Updates `dist[i]` from the span reached by walking `dir` then `dir2`.
/// The straight step costs 2 and the diagonal one 3.
fn relax(chf: &CompactHeightfield, dist: &mut [u8], x: i32, z: i32, i: usize, dir: usize, dir2: usize) {
    if let Some((ax, az, ai)) = chf.neighbor(x, z, i, dir) {
        dist[i] = dist[i].min(dist[ai].saturating_add(2));
        if let Some((_, _, aai)) = chf.neighbor(ax, az, ai, dir2) {
            dist[i] = dist[i].min(dist[aai].saturating_add(3));
        }
    }
}

impl CompactHeightfield {
    /// Shrinks the walkable area by `radius` cells.
    ///
    /// Spans closer than `radius` to a non-walkable span or the edge of the
    /// grid lose their area. The walkable span count never grows.
    pub fn erode_walkable_area(&mut self, radius: i32) {
        let mut dist = vec![0xffu8; self.spans.len()];

        // Boundary spans start at zero
        for (x, z, i) in self.iter_spans() {
            if self.areas[i] == NULL_AREA {
                dist[i] = 0;
                continue;
            }
            let walkable_neighbors = (0..4)
                .filter_map(|dir| self.neighbor(x, z, i, dir))
                .filter(|&(_, _, ni)| self.areas[ni] != NULL_AREA)
                .count();
            if walkable_neighbors != 4 {
                dist[i] = 0;
            }
        }

        // Two-pass chamfer distance transform
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    relax(self, &mut dist, x, z, i, 0, 3);
                    relax(self, &mut dist, x, z, i, 3, 2);
                }
            }
        }
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    relax(self, &mut dist, x, z, i, 2, 1);
                    relax(self, &mut dist, x, z, i, 1, 0);
                }
            }
        }

        let threshold = (radius * 2).clamp(0, 255) as u8;
        let mut eroded = 0;
        for (area, &d) in self.areas.iter_mut().zip(&dist) {
            if d < threshold && *area != NULL_AREA {
                *area = NULL_AREA;
                eroded += 1;
            }
        }
        log::debug!("Erosion radius {} removed {} spans", radius, eroded);
    }

    /// Sets the area of every span whose floor lies inside the box.
    /// Spans already marked non-walkable are left alone.
    pub fn mark_box_area(&mut self, bmin: &[f32; 3], bmax: &[f32; 3], area: u8) {
        let min_x = ((bmin[0] - self.bmin.x) / self.cs).floor() as i32;
        let min_y = ((bmin[1] - self.bmin.y) / self.ch).floor() as i32;
        let min_z = ((bmin[2] - self.bmin.z) / self.cs).floor() as i32;
        let max_x = ((bmax[0] - self.bmin.x) / self.cs).floor() as i32;
        let max_y = ((bmax[1] - self.bmin.y) / self.ch).floor() as i32;
        let max_z = ((bmax[2] - self.bmin.z) / self.cs).floor() as i32;

        if max_x < 0 || min_x >= self.width || max_z < 0 || min_z >= self.height {
            return;
        }

        for z in min_z.max(0)..=max_z.min(self.height - 1) {
            for x in min_x.max(0)..=max_x.min(self.width - 1) {
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    let y = self.spans[i].y as i32;
                    if y >= min_y && y <= max_y && self.areas[i] != NULL_AREA {
                        self.areas[i] = area;
                    }
                }
            }
        }
    }

    /// Sets the area of every span whose floor lies inside the upright
    /// cylinder standing on `pos`.
    pub fn mark_cylinder_area(&mut self, pos: &[f32; 3], radius: f32, height: f32, area: u8) {
        let min_x = ((pos[0] - radius - self.bmin.x) / self.cs).floor() as i32;
        let max_x = ((pos[0] + radius - self.bmin.x) / self.cs).floor() as i32;
        let min_z = ((pos[2] - radius - self.bmin.z) / self.cs).floor() as i32;
        let max_z = ((pos[2] + radius - self.bmin.z) / self.cs).floor() as i32;
        let min_y = ((pos[1] - self.bmin.y) / self.ch).floor() as i32;
        let max_y = ((pos[1] + height - self.bmin.y) / self.ch).floor() as i32;

        if max_x < 0 || min_x >= self.width || max_z < 0 || min_z >= self.height {
            return;
        }

        let radius_sq = radius * radius;
        for z in min_z.max(0)..=max_z.min(self.height - 1) {
            for x in min_x.max(0)..=max_x.min(self.width - 1) {
                let cx = self.bmin.x + (x as f32 + 0.5) * self.cs - pos[0];
                let cz = self.bmin.z + (z as f32 + 0.5) * self.cs - pos[2];
                if cx * cx + cz * cz >= radius_sq {
                    continue;
                }
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    let y = self.spans[i].y as i32;
                    if y >= min_y && y <= max_y && self.areas[i] != NULL_AREA {
                        self.areas[i] = area;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compact_heightfield::CompactHeightfield;
    use crate::test_util::flat_compact;
    use crate::NULL_AREA;

    #[test]
    fn test_erosion_is_monotonic() {
        for radius in 0..5 {
            let mut chf = flat_compact(12, 12);
            let before = chf.walkable_span_count();
            chf.erode_walkable_area(radius);
            assert!(chf.walkable_span_count() <= before);
        }
    }

    #[test]
    fn test_erosion_removes_border_ring() {
        let mut chf = flat_compact(10, 10);
        chf.erode_walkable_area(1);
        // Outermost ring has distance 0, next ring distance 2 which survives radius 1
        assert_eq!(chf.walkable_span_count(), 8 * 8);
        let corner = chf.cell(0, 0).index;
        assert_eq!(chf.areas[corner], NULL_AREA);
    }

    #[test]
    fn test_zero_radius_keeps_everything() {
        let mut chf = flat_compact(6, 6);
        chf.erode_walkable_area(0);
        assert_eq!(chf.walkable_span_count(), 36);
    }

    #[test]
    fn test_mark_cylinder_carves_hole() {
        let mut chf: CompactHeightfield = flat_compact(20, 20);
        chf.mark_cylinder_area(&[10.0, -1.0, 10.0], 3.0, 4.0, NULL_AREA);
        let centre = chf.cell(10, 10).index;
        assert_eq!(chf.areas[centre], NULL_AREA);
        let far = chf.cell(1, 1).index;
        assert_ne!(chf.areas[far], NULL_AREA);
        let removed = 400 - chf.walkable_span_count();
        // Roughly pi * r^2 cells
        assert!(removed > 20 && removed < 40, "removed {}", removed);
    }

    #[test]
    fn test_mark_box_respects_height() {
        let mut chf = flat_compact(8, 8);
        chf.mark_box_area(&[2.0, 5.0, 2.0], &[4.0, 8.0, 4.0], NULL_AREA);
        assert_eq!(chf.walkable_span_count(), 64);
        chf.mark_box_area(&[2.0, -1.0, 2.0], &[4.0, 2.0, 4.0], NULL_AREA);
        assert!(chf.walkable_span_count() < 64);
    }
}
