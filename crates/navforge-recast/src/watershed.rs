//! Watershed region partitioning

use std::collections::BTreeSet;

use crate::compact_heightfield::{CompactHeightfield, BORDER_REG};
use crate::NULL_AREA;

const EXPAND_ITERS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct StackEntry {
    x: i32,
    z: i32,
    /// Span index, `None` once the entry has been consumed
    index: Option<usize>,
}

#[derive(Debug, Default, Clone)]
struct Region {
    span_count: usize,
    id: u16,
    area: u8,
    remap: bool,
    visited: bool,
    connects_to_border: bool,
    /// Some span borders unwalkable space or the grid edge
    touches_edge: bool,
    connections: BTreeSet<u16>,
    floors: BTreeSet<u16>,
}

impl CompactHeightfield {
    /// Partitions the walkable spans into regions by flooding the distance
    /// field from its maxima down.
    ///
    /// Regions smaller than `min_region_area` cells are removed unless they
    /// touch the tile border; regions smaller than `merge_region_area` are
    /// merged into their smallest compatible neighbour. `border_size` cells
    /// around the grid are painted as border regions and never produce
    /// contours.
    ///
    /// Requires `build_distance_field` to have run. Sets `max_regions` to one
    /// past the highest region id; if walkable spans exist but every region
    /// was filtered away, they are gathered into a single region.
    pub fn build_regions_watershed(
        &mut self,
        border_size: i32,
        min_region_area: i32,
        merge_region_area: i32,
    ) {
        let span_count = self.spans.len();
        let mut src_reg = vec![0u16; span_count];
        let mut src_dist = vec![0u16; span_count];
        if self.dist.len() != span_count {
            self.build_distance_field();
        }

        let mut region_id: u16 = 1;
        let w = self.width;
        let h = self.height;
        if border_size > 0 {
            let bw = border_size.min(w);
            let bh = border_size.min(h);
            self.paint_rect(0, bw, 0, h, region_id | BORDER_REG, &mut src_reg);
            region_id += 1;
            self.paint_rect(w - bw, w, 0, h, region_id | BORDER_REG, &mut src_reg);
            region_id += 1;
            self.paint_rect(0, w, 0, bh, region_id | BORDER_REG, &mut src_reg);
            region_id += 1;
            self.paint_rect(0, w, h - bh, h, region_id | BORDER_REG, &mut src_reg);
            region_id += 1;
        }
        self.border_size = border_size;

        let mut level = (self.max_distance + 1) & !1;
        while level > 0 {
            level = level.saturating_sub(2);

            let mut stack: Vec<StackEntry> = self
                .iter_spans()
                .filter(|&(_, _, i)| {
                    self.areas[i] != NULL_AREA && src_reg[i] == 0 && self.dist[i] >= level
                })
                .map(|(x, z, i)| StackEntry { x, z, index: Some(i) })
                .collect();

            self.expand_regions(EXPAND_ITERS, level, &mut src_reg, &mut src_dist, &mut stack);

            for entry in &stack {
                if let Some(i) = entry.index {
                    if src_reg[i] == 0
                        && self.flood_region(entry.x, entry.z, i, level, region_id, &mut src_reg, &mut src_dist)
                    {
                        if region_id == 0xffff & !BORDER_REG {
                            log::warn!("Region id overflow, stopping watershed early");
                            break;
                        }
                        region_id += 1;
                    }
                }
            }
        }

        // Fill whatever is left without a level limit
        let mut rest: Vec<StackEntry> = self
            .iter_spans()
            .filter(|&(_, _, i)| self.areas[i] != NULL_AREA && src_reg[i] == 0)
            .map(|(x, z, i)| StackEntry { x, z, index: Some(i) })
            .collect();
        self.expand_regions(EXPAND_ITERS * 8, 0, &mut src_reg, &mut src_dist, &mut rest);

        let max_region_id =
            self.merge_and_filter_regions(min_region_area, merge_region_area, region_id, &mut src_reg);

        for (span, reg) in self.spans.iter_mut().zip(&src_reg) {
            span.reg = *reg;
        }
        self.max_regions = max_region_id + 1;

        if max_region_id == 0 {
            let mut fallback = 0;
            for (span, &area) in self.spans.iter_mut().zip(&self.areas) {
                if area != NULL_AREA && span.reg == 0 {
                    span.reg = 1;
                    fallback += 1;
                }
            }
            if fallback > 0 {
                log::debug!("All regions filtered, {} spans moved to a fallback region", fallback);
                self.max_regions = 2;
            }
        }

        log::debug!(
            "Watershed built {} regions (max region id {})",
            self.region_count(),
            self.max_regions.saturating_sub(1)
        );
    }

    fn paint_rect(&self, minx: i32, maxx: i32, minz: i32, maxz: i32, reg: u16, src_reg: &mut [u16]) {
        for z in minz.max(0)..maxz.min(self.height) {
            for x in minx.max(0)..maxx.min(self.width) {
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    if self.areas[i] != NULL_AREA {
                        src_reg[i] = reg;
                    }
                }
            }
        }
    }

    /// Grows existing regions into the unassigned spans of `stack`, one ring
    /// per iteration, choosing the neighbour region closest to its seed.
    fn expand_regions(
        &self,
        max_iter: usize,
        level: u16,
        src_reg: &mut [u16],
        src_dist: &mut [u16],
        stack: &mut [StackEntry],
    ) {
        for entry in stack.iter_mut() {
            if let Some(i) = entry.index {
                if src_reg[i] != 0 {
                    entry.index = None;
                }
            }
        }

        let mut iter = 0;
        let mut dirty: Vec<(usize, u16, u16)> = Vec::new();
        loop {
            let mut failed = 0;
            dirty.clear();

            for entry in stack.iter_mut() {
                let Some(i) = entry.index else {
                    failed += 1;
                    continue;
                };
                let mut r = src_reg[i];
                let mut d2 = 0xffffu16;
                let area = self.areas[i];
                for dir in 0..4 {
                    let Some((_, _, ai)) = self.neighbor(entry.x, entry.z, i, dir) else {
                        continue;
                    };
                    if self.areas[ai] != area {
                        continue;
                    }
                    let nr = src_reg[ai];
                    let nd = src_dist[ai].saturating_add(2);
                    if nr > 0 && nr & BORDER_REG == 0 && nd < d2 {
                        r = nr;
                        d2 = nd;
                    }
                }
                if r != 0 {
                    entry.index = None;
                    dirty.push((i, r, d2));
                } else {
                    failed += 1;
                }
            }

            for &(i, r, d) in &dirty {
                src_reg[i] = r;
                src_dist[i] = d;
            }

            if failed == stack.len() {
                break;
            }
            if level > 0 {
                iter += 1;
                if iter >= max_iter {
                    break;
                }
            }
        }
    }

    /// Floods a new region from span `i` across spans at or above
    /// `level - 2`. Stops at spans touching another region.
    #[allow(clippy::too_many_arguments)]
    fn flood_region(
        &self,
        x: i32,
        z: i32,
        i: usize,
        level: u16,
        r: u16,
        src_reg: &mut [u16],
        src_dist: &mut [u16],
    ) -> bool {
        let area = self.areas[i];
        let mut stack = vec![(x, z, i)];
        src_reg[i] = r;
        src_dist[i] = 0;

        let lev = level.saturating_sub(2);
        let mut count = 0;

        while let Some((cx, cz, ci)) = stack.pop() {
            // Touching a different region in the 8-neighbourhood stops the flood here
            let mut touches_other = false;
            'dirs: for dir in 0..4 {
                if let Some((ax, az, ai)) = self.neighbor(cx, cz, ci, dir) {
                    if self.areas[ai] != area {
                        continue;
                    }
                    let nr = src_reg[ai];
                    if nr & BORDER_REG != 0 {
                        continue;
                    }
                    if nr != 0 && nr != r {
                        touches_other = true;
                        break 'dirs;
                    }
                    if let Some((_, _, ai2)) = self.neighbor(ax, az, ai, (dir + 1) & 3) {
                        if self.areas[ai2] != area {
                            continue;
                        }
                        let nr2 = src_reg[ai2];
                        if nr2 != 0 && nr2 & BORDER_REG == 0 && nr2 != r {
                            touches_other = true;
                            break 'dirs;
                        }
                    }
                }
            }
            if touches_other {
                src_reg[ci] = 0;
                continue;
            }
            count += 1;

            for dir in 0..4 {
                if let Some((ax, az, ai)) = self.neighbor(cx, cz, ci, dir) {
                    if self.areas[ai] != area {
                        continue;
                    }
                    if self.dist[ai] >= lev && src_reg[ai] == 0 {
                        src_reg[ai] = r;
                        src_dist[ai] = 0;
                        stack.push((ax, az, ai));
                    }
                }
            }
        }
        count > 0
    }

    /// Removes small isolated regions, merges small ones into neighbours and
    /// compacts the ids to `1..=n`. Returns `n`.
    fn merge_and_filter_regions(
        &self,
        min_region_area: i32,
        merge_region_area: i32,
        region_count: u16,
        src_reg: &mut [u16],
    ) -> u16 {
        let nreg = region_count as usize;
        let mut regions: Vec<Region> = (0..nreg)
            .map(|i| Region {
                id: i as u16,
                ..Region::default()
            })
            .collect();

        for (x, z, i) in self.iter_spans() {
            let r = src_reg[i];
            if r == 0 || r & BORDER_REG != 0 || r as usize >= nreg {
                continue;
            }
            let reg = &mut regions[r as usize];
            reg.span_count += 1;
            reg.area = self.areas[i];

            let cell = self.cell(x, z);
            for j in cell.index..cell.index + cell.count {
                let fr = src_reg[j];
                if j != i && fr != 0 && fr & BORDER_REG == 0 && fr != r {
                    reg.floors.insert(fr);
                }
            }

            for dir in 0..4 {
                let reg = &mut regions[r as usize];
                match self.neighbor(x, z, i, dir) {
                    Some((_, _, ai)) => {
                        let nr = src_reg[ai];
                        if nr & BORDER_REG != 0 {
                            reg.connects_to_border = true;
                        } else if nr == 0 {
                            reg.touches_edge = true;
                        } else if nr != r {
                            reg.connections.insert(nr);
                        }
                    }
                    None => reg.touches_edge = true,
                }
            }
        }

        // Drop islands that are too small to matter
        let mut stack = Vec::new();
        let mut trace = Vec::new();
        for start in 1..nreg {
            if regions[start].span_count == 0 || regions[start].visited {
                continue;
            }
            let mut span_count = 0;
            let mut connects_to_border = false;
            trace.clear();
            stack.clear();
            stack.push(start);
            regions[start].visited = true;
            while let Some(ri) = stack.pop() {
                trace.push(ri);
                span_count += regions[ri].span_count;
                connects_to_border |= regions[ri].connects_to_border;
                let neighbours: Vec<u16> = regions[ri].connections.iter().copied().collect();
                for n in neighbours {
                    let n = n as usize;
                    if n < nreg && !regions[n].visited && regions[n].area == regions[ri].area {
                        regions[n].visited = true;
                        stack.push(n);
                    }
                }
            }
            if (span_count as i32) < min_region_area && !connects_to_border {
                for &ri in &trace {
                    regions[ri].span_count = 0;
                    regions[ri].id = 0;
                }
            }
        }

        // Merge small regions into their smallest neighbour
        loop {
            let mut merged = 0;
            for ri in 1..nreg {
                let reg = &regions[ri];
                if reg.id == 0 || reg.span_count == 0 {
                    continue;
                }
                if reg.span_count as i32 > merge_region_area && reg.touches_edge {
                    continue;
                }

                let mut smallest = usize::MAX;
                let mut merge_id = None;
                for &n in &reg.connections {
                    let n = n as usize;
                    if n >= nreg {
                        continue;
                    }
                    let neighbour = &regions[n];
                    if neighbour.id == 0 || neighbour.span_count == 0 || n == ri {
                        continue;
                    }
                    if neighbour.area != reg.area || reg.floors.contains(&neighbour.id) {
                        continue;
                    }
                    if neighbour.span_count < smallest {
                        smallest = neighbour.span_count;
                        merge_id = Some(neighbour.id);
                    }
                }

                let Some(target) = merge_id else { continue };
                let old_id = regions[ri].id;

                let moved = std::mem::take(&mut regions[ri].connections);
                let floors = std::mem::take(&mut regions[ri].floors);
                let count = std::mem::take(&mut regions[ri].span_count);
                let border = regions[ri].connects_to_border;
                let edge = regions[ri].touches_edge;
                {
                    let t = &mut regions[target as usize];
                    t.span_count += count;
                    t.connects_to_border |= border;
                    t.touches_edge |= edge;
                    t.connections.extend(moved);
                    t.connections.remove(&target);
                    t.connections.remove(&old_id);
                    t.floors.extend(floors);
                }
                for reg in regions.iter_mut() {
                    if reg.id == old_id {
                        reg.id = target;
                    }
                    if reg.connections.remove(&old_id) && reg.id != target {
                        reg.connections.insert(target);
                    }
                    if reg.floors.remove(&old_id) {
                        reg.floors.insert(target);
                    }
                }
                merged += 1;
            }
            if merged == 0 {
                break;
            }
        }

        // Compact ids
        for reg in regions.iter_mut() {
            reg.remap = reg.id != 0;
        }
        let mut next_id = 0u16;
        for i in 0..nreg {
            if !regions[i].remap {
                continue;
            }
            let old_id = regions[i].id;
            next_id += 1;
            for reg in regions.iter_mut().skip(i) {
                if reg.remap && reg.id == old_id {
                    reg.id = next_id;
                    reg.remap = false;
                }
            }
        }

        for r in src_reg.iter_mut() {
            if *r & BORDER_REG == 0 && (*r as usize) < nreg {
                *r = regions[*r as usize].id;
            }
        }
        next_id
    }
}

#[cfg(test)]
mod tests {
    use crate::compact_heightfield::BORDER_REG;
    use crate::test_util::flat_compact;
    use crate::NULL_AREA;

    #[test]
    fn test_flat_plane_gets_regions() {
        let mut chf = flat_compact(30, 30);
        chf.erode_walkable_area(1);
        chf.build_distance_field();
        chf.build_regions_watershed(0, 8, 20);
        assert!(chf.max_regions >= 1);
        assert!(chf.region_count() >= 1);
        for (span, &area) in chf.spans.iter().zip(&chf.areas) {
            if area != NULL_AREA {
                assert_ne!(span.reg, 0, "walkable span without region");
            } else {
                assert_eq!(span.reg, 0);
            }
        }
        assert!(chf.spans.iter().all(|s| s.reg < chf.max_regions));
    }

    #[test]
    fn test_tiny_island_falls_back_to_single_region() {
        let mut chf = flat_compact(3, 3);
        chf.build_distance_field();
        chf.build_regions_watershed(0, 50, 20);
        assert_eq!(chf.max_regions, 2);
        assert!(chf.spans.iter().all(|s| s.reg == 1));
    }

    #[test]
    fn test_border_regions_are_flagged() {
        let mut chf = flat_compact(20, 20);
        chf.build_distance_field();
        chf.build_regions_watershed(3, 8, 20);
        let corner = chf.cell(0, 0).index;
        assert_ne!(chf.spans[corner].reg & BORDER_REG, 0);
        let centre = chf.cell(10, 10).index;
        assert_eq!(chf.spans[centre].reg & BORDER_REG, 0);
        assert_ne!(chf.spans[centre].reg, 0);
    }

    #[test]
    fn test_separated_areas_get_distinct_regions() {
        let mut chf = flat_compact(30, 10);
        // Wall across the middle
        for z in 0..10 {
            let i = chf.cell(15, z).index;
            chf.areas[i] = NULL_AREA;
        }
        chf.build_distance_field();
        chf.build_regions_watershed(0, 8, 20);
        let left = chf.spans[chf.cell(5, 5).index].reg;
        let right = chf.spans[chf.cell(25, 5).index].reg;
        assert_ne!(left, 0);
        assert_ne!(right, 0);
        assert_ne!(left, right);
    }
}
