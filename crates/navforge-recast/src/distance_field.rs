//! Distance-to-boundary field used to seed watershed regions

use crate::compact_heightfield::CompactHeightfield;

impl CompactHeightfield {
    /// Computes, per span, the chamfer distance to the nearest region
    /// boundary (an edge of the walkable area or a change of area id), then
    /// smooths it with a 3x3 box blur.
    pub fn build_distance_field(&mut self) {
        let src = self.calculate_distance_field();
        self.max_distance = src.iter().copied().max().unwrap_or(0);
        self.dist = self.box_blur(&src, 1);

        log::debug!("Distance field built, max distance {}", self.max_distance);
    }

    fn calculate_distance_field(&self) -> Vec<u16> {
        let mut dist = vec![0xffffu16; self.spans.len()];

        for (x, z, i) in self.iter_spans() {
            let area = self.areas[i];
            let same_area = (0..4)
                .filter_map(|dir| self.neighbor(x, z, i, dir))
                .filter(|&(_, _, ni)| self.areas[ni] == area)
                .count();
            if same_area != 4 {
                dist[i] = 0;
            }
        }

        let relax = |x: i32, z: i32, i: usize, dir: usize, dir2: usize, dist: &mut Vec<u16>| {
            if let Some((ax, az, ai)) = self.neighbor(x, z, i, dir) {
                dist[i] = dist[i].min(dist[ai].saturating_add(2));
                if let Some((_, _, aai)) = self.neighbor(ax, az, ai, dir2) {
                    dist[i] = dist[i].min(dist[aai].saturating_add(3));
                }
            }
        };

        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    relax(x, z, i, 0, 3, &mut dist);
                    relax(x, z, i, 3, 2, &mut dist);
                }
            }
        }
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                let cell = self.cell(x, z);
                for i in cell.index..cell.index + cell.count {
                    relax(x, z, i, 2, 1, &mut dist);
                    relax(x, z, i, 1, 0, &mut dist);
                }
            }
        }
        dist
    }

    fn box_blur(&self, src: &[u16], threshold: u16) -> Vec<u16> {
        let threshold = threshold * 2;
        let mut dst = vec![0u16; src.len()];

        for (x, z, i) in self.iter_spans() {
            let cd = src[i];
            if cd <= threshold {
                dst[i] = cd;
                continue;
            }
            let mut d = cd as u32;
            for dir in 0..4 {
                match self.neighbor(x, z, i, dir) {
                    Some((ax, az, ai)) => {
                        d += src[ai] as u32;
                        let dir2 = (dir + 1) & 3;
                        d += match self.neighbor(ax, az, ai, dir2) {
                            Some((_, _, aai)) => src[aai] as u32,
                            None => cd as u32,
                        };
                    }
                    None => d += cd as u32 * 2,
                }
            }
            dst[i] = ((d + 5) / 9) as u16;
        }
        dst
    }
}
