//! Compact open-space heightfield with neighbour links

use glam::Vec3;
use navforge_common::{Error, Result};

use crate::heightfield::Heightfield;
use crate::{NULL_AREA, SPAN_MAX_HEIGHT};

/// Marks a missing neighbour link
pub const NOT_CONNECTED: u8 = 0xff;
/// More spans than this per column cannot be linked
pub const MAX_LAYERS: usize = NOT_CONNECTED as usize - 1;
/// Region id bit for the padding regions painted around tiled builds
pub const BORDER_REG: u16 = 0x8000;

/// Neighbour x offsets for directions 0..4 (-x, +z, +x, -z)
pub const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
/// Neighbour z offsets for directions 0..4 (-x, +z, +x, -z)
pub const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

/// Range of spans in one column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactCell {
    pub index: usize,
    pub count: usize,
}

/// Open interval on top of a solid span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactSpan {
    /// Floor height, in cell heights
    pub y: u16,
    /// Clearance above the floor, in cell heights (saturates at 255)
    pub h: u8,
    /// Region id, 0 when unassigned
    pub reg: u16,
    /// Per direction: index of the neighbour span inside its column
    pub con: [u8; 4],
}

impl CompactSpan {
    /// Index of the neighbour span inside the neighbouring column
    #[inline]
    pub fn con(&self, dir: usize) -> Option<usize> {
        match self.con[dir] {
            NOT_CONNECTED => None,
            c => Some(c as usize),
        }
    }
}

/// Walkable open space derived from a [`Heightfield`].
///
/// Only spans whose solid floor is walkable are kept. Per-span data lives in
/// parallel arrays indexed by span index; `cells` maps a column to its range.
#[derive(Debug, Clone)]
pub struct CompactHeightfield {
    pub width: i32,
    pub height: i32,
    pub border_size: i32,
    pub walkable_height: i32,
    pub walkable_climb: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub cells: Vec<CompactCell>,
    pub spans: Vec<CompactSpan>,
    pub areas: Vec<u8>,
    /// Distance to the nearest boundary, filled by `build_distance_field`
    pub dist: Vec<u16>,
    pub max_distance: u16,
    /// One past the highest region id
    pub max_regions: u16,
}

impl CompactHeightfield {
    /// Builds the open-space representation and links every span to the
    /// neighbour it can step to in each of the four directions.
    ///
    /// Two spans connect when the shared clearance is at least
    /// `walkable_height` and the floor step is at most `walkable_climb`.
    pub fn build(hf: &Heightfield, walkable_height: i32, walkable_climb: i32) -> Result<Self> {
        let column_count = (hf.width * hf.height) as usize;
        let walkable = hf.walkable_span_count();
        let max_height = SPAN_MAX_HEIGHT as i32;

        let mut chf = Self {
            width: hf.width,
            height: hf.height,
            border_size: 0,
            walkable_height,
            walkable_climb,
            bmin: hf.bmin,
            bmax: hf.bmax + Vec3::new(0.0, walkable_height as f32 * hf.ch, 0.0),
            cs: hf.cs,
            ch: hf.ch,
            cells: vec![CompactCell::default(); column_count],
            spans: Vec::with_capacity(walkable),
            areas: Vec::with_capacity(walkable),
            dist: Vec::new(),
            max_distance: 0,
            max_regions: 0,
        };

        for z in 0..hf.height {
            for x in 0..hf.width {
                let column = hf.spans(x, z);
                let cell = &mut chf.cells[(x + z * hf.width) as usize];
                cell.index = chf.spans.len();
                for (si, span) in column.iter().enumerate() {
                    if span.area == NULL_AREA {
                        continue;
                    }
                    let bot = span.smax as i32;
                    let top = column.get(si + 1).map_or(max_height, |n| n.smin as i32);
                    chf.spans.push(CompactSpan {
                        y: bot.clamp(0, 0xffff) as u16,
                        h: (top - bot).clamp(0, 0xff) as u8,
                        reg: 0,
                        con: [NOT_CONNECTED; 4],
                    });
                    chf.areas.push(span.area);
                }
                cell.count = chf.spans.len() - cell.index;
            }
        }

        let mut too_many_layers = 0;
        for z in 0..chf.height {
            for x in 0..chf.width {
                let cell = chf.cells[(x + z * chf.width) as usize];
                for i in cell.index..cell.index + cell.count {
                    for dir in 0..4 {
                        let nx = x + DIR_OFFSET_X[dir];
                        let nz = z + DIR_OFFSET_Z[dir];
                        if nx < 0 || nz < 0 || nx >= chf.width || nz >= chf.height {
                            continue;
                        }
                        let ncell = chf.cells[(nx + nz * chf.width) as usize];
                        let s = chf.spans[i];
                        for k in ncell.index..ncell.index + ncell.count {
                            let ns = chf.spans[k];
                            let bot = s.y.max(ns.y) as i32;
                            let top = (s.y as i32 + s.h as i32).min(ns.y as i32 + ns.h as i32);
                            if top - bot >= walkable_height
                                && (ns.y as i32 - s.y as i32).abs() <= walkable_climb
                            {
                                let layer = k - ncell.index;
                                if layer >= MAX_LAYERS {
                                    too_many_layers = too_many_layers.max(layer);
                                    continue;
                                }
                                chf.spans[i].con[dir] = layer as u8;
                                break;
                            }
                        }
                    }
                }
            }
        }

        if too_many_layers > 0 {
            return Err(Error::NavMeshGeneration(format!(
                "Heightfield has too many layers ({}, max {})",
                too_many_layers, MAX_LAYERS
            )));
        }

        log::debug!(
            "Compact heightfield {}x{}: {} walkable spans",
            chf.width,
            chf.height,
            chf.spans.len()
        );
        Ok(chf)
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn walkable_span_count(&self) -> usize {
        self.areas.iter().filter(|&&a| a != NULL_AREA).count()
    }

    #[inline]
    pub fn cell(&self, x: i32, z: i32) -> CompactCell {
        self.cells[(x + z * self.width) as usize]
    }

    /// Index of the span linked from span `i` at column (x, z) in direction `dir`
    #[inline]
    pub fn neighbor(&self, x: i32, z: i32, i: usize, dir: usize) -> Option<(i32, i32, usize)> {
        let con = self.spans[i].con(dir)?;
        let nx = x + DIR_OFFSET_X[dir];
        let nz = z + DIR_OFFSET_Z[dir];
        Some((nx, nz, self.cell(nx, nz).index + con))
    }

    /// Iterates `(x, z, span index)` over every span
    pub fn iter_spans(&self) -> impl Iterator<Item = (i32, i32, usize)> + '_ {
        (0..self.height).flat_map(move |z| {
            (0..self.width).flat_map(move |x| {
                let cell = self.cell(x, z);
                (cell.index..cell.index + cell.count).map(move |i| (x, z, i))
            })
        })
    }

    /// Number of distinct non-border region ids assigned to spans
    pub fn region_count(&self) -> usize {
        let mut seen = std::collections::BTreeSet::new();
        for s in &self.spans {
            if s.reg != 0 && s.reg & BORDER_REG == 0 {
                seen.insert(s.reg);
            }
        }
        seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WALKABLE_AREA;

    fn flat_field(w: i32, h: i32) -> Heightfield {
        let mut hf = Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 5.0, h as f32),
            1.0,
            0.5,
        )
        .unwrap();
        for z in 0..h {
            for x in 0..w {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
            }
        }
        hf
    }

    #[test]
    fn test_build_links_neighbours() {
        let hf = flat_field(3, 3);
        let chf = CompactHeightfield::build(&hf, 2, 1).unwrap();
        assert_eq!(chf.span_count(), 9);

        let centre = chf.cell(1, 1).index;
        for dir in 0..4 {
            assert!(chf.neighbor(1, 1, centre, dir).is_some());
        }
        let corner = chf.cell(0, 0).index;
        assert!(chf.neighbor(0, 0, corner, 0).is_none());
        assert!(chf.neighbor(0, 0, corner, 3).is_none());
        let (nx, nz, _) = chf.neighbor(0, 0, corner, 2).unwrap();
        assert_eq!((nx, nz), (1, 0));
    }

    #[test]
    fn test_null_spans_are_dropped() {
        let mut hf = flat_field(2, 1);
        hf.add_span(0, 0, 10, 12, NULL_AREA, 0).unwrap();
        let chf = CompactHeightfield::build(&hf, 2, 1).unwrap();
        assert_eq!(chf.span_count(), 2);
        // Clearance under the overhang
        assert_eq!(chf.spans[chf.cell(0, 0).index].h, 8);
    }

    #[test]
    fn test_step_too_high_is_not_linked() {
        let mut hf = Heightfield::new(2, 1, Vec3::ZERO, Vec3::new(2.0, 10.0, 1.0), 1.0, 0.5).unwrap();
        hf.add_span(0, 0, 0, 2, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 0, 0, 8, WALKABLE_AREA, 1).unwrap();
        let chf = CompactHeightfield::build(&hf, 2, 3).unwrap();
        assert!(chf.neighbor(0, 0, 0, 2).is_none());
        let chf = CompactHeightfield::build(&hf, 2, 6).unwrap();
        assert!(chf.neighbor(0, 0, 0, 2).is_some());
    }
}
