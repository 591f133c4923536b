//! Triangle voxelization into a [`Heightfield`]

use glam::Vec3;
use navforge_common::{Error, InputGeometry, Result};

use crate::heightfield::Heightfield;
use crate::{NULL_AREA, SPAN_MAX_HEIGHT, WALKABLE_AREA};

/// Tags each triangle walkable when its slope is at most `max_slope_degrees`.
///
/// Returns one area id per triangle: [`WALKABLE_AREA`] or [`NULL_AREA`].
/// Triangles face up when wound clockwise seen from above.
pub fn mark_walkable_triangles(max_slope_degrees: f32, vertices: &[f32], indices: &[i32]) -> Vec<u8> {
    let walkable_thr = max_slope_degrees.to_radians().cos();
    let vertex = |i: i32| {
        let i = i as usize * 3;
        Vec3::new(vertices[i], vertices[i + 1], vertices[i + 2])
    };

    indices
        .chunks_exact(3)
        .map(|tri| {
            let (a, b, c) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
            let normal = (b - a).cross(c - a).normalize_or_zero();
            if normal.y > walkable_thr {
                WALKABLE_AREA
            } else {
                NULL_AREA
            }
        })
        .collect()
}

/// Splits a convex polygon by the axis-aligned line `coord = split` on the
/// given axis (0 = x, 2 = z). Returns the parts below and above the line.
fn divide_poly(poly: &[Vec3], split: f32, axis: usize) -> (Vec<Vec3>, Vec<Vec3>) {
    let mut below = Vec::with_capacity(poly.len() + 2);
    let mut above = Vec::with_capacity(poly.len() + 2);
    if poly.is_empty() {
        return (below, above);
    }
    let dist: Vec<f32> = poly.iter().map(|v| split - v[axis]).collect();

    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        let in_a = dist[j] >= 0.0;
        let in_b = dist[i] >= 0.0;
        if in_a != in_b {
            let s = dist[j] / (dist[j] - dist[i]);
            let crossing = poly[j] + (poly[i] - poly[j]) * s;
            below.push(crossing);
            above.push(crossing);
            if dist[i] > 0.0 {
                below.push(poly[i]);
            } else if dist[i] < 0.0 {
                above.push(poly[i]);
            }
        } else if in_b {
            below.push(poly[i]);
            if dist[i] == 0.0 {
                above.push(poly[i]);
            }
        } else {
            above.push(poly[i]);
        }
        j = i;
    }
    (below, above)
}

fn rasterize_triangle(
    hf: &mut Heightfield,
    tri: [Vec3; 3],
    area: u8,
    flag_merge_threshold: i32,
) -> Result<()> {
    let tmin = tri[0].min(tri[1]).min(tri[2]);
    let tmax = tri[0].max(tri[1]).max(tri[2]);
    if tmin.x > hf.bmax.x || tmax.x < hf.bmin.x || tmin.z > hf.bmax.z || tmax.z < hf.bmin.z {
        return Ok(());
    }

    let ics = 1.0 / hf.cs;
    let ich = 1.0 / hf.ch;
    let by = hf.bmax.y - hf.bmin.y;

    let z0 = (((tmin.z - hf.bmin.z) * ics) as i32).clamp(-1, hf.height - 1);
    let z1 = (((tmax.z - hf.bmin.z) * ics) as i32).clamp(0, hf.height - 1);

    let mut rest: Vec<Vec3> = tri.to_vec();
    for z in z0..=z1 {
        let cell_z = hf.bmin.z + z as f32 * hf.cs;
        let (row, above) = divide_poly(&rest, cell_z + hf.cs, 2);
        rest = above;
        if row.len() < 3 || z < 0 {
            continue;
        }

        let (min_x, max_x) = row
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.x), hi.max(v.x)));
        let x0 = (((min_x - hf.bmin.x) * ics) as i32).clamp(-1, hf.width - 1);
        let x1 = (((max_x - hf.bmin.x) * ics) as i32).clamp(0, hf.width - 1);

        let mut row_rest = row;
        for x in x0..=x1 {
            let cell_x = hf.bmin.x + x as f32 * hf.cs;
            let (cell, right) = divide_poly(&row_rest, cell_x + hf.cs, 0);
            row_rest = right;
            if cell.len() < 3 || x < 0 {
                continue;
            }

            let (mut smin, mut smax) = cell
                .iter()
                .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.y), hi.max(v.y)));
            smin -= hf.bmin.y;
            smax -= hf.bmin.y;
            if smax < 0.0 || smin > by {
                continue;
            }
            smin = smin.max(0.0);
            smax = smax.min(by);

            let max_height = SPAN_MAX_HEIGHT as i32;
            let ismin = ((smin * ich).floor() as i32).clamp(0, max_height);
            let ismax = ((smax * ich).ceil() as i32).clamp(ismin + 1, max_height);
            hf.add_span(x, z, ismin as u16, ismax as u16, area, flag_merge_threshold)?;
        }
    }
    Ok(())
}

impl Heightfield {
    /// Voxelizes every triangle of `geometry` that overlaps the grid.
    ///
    /// `areas` holds one area id per triangle, usually produced by
    /// [`mark_walkable_triangles`].
    pub fn rasterize_triangles(
        &mut self,
        geometry: &InputGeometry,
        areas: &[u8],
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if areas.len() != geometry.triangle_count() {
            return Err(Error::InvalidMesh(format!(
                "Expected {} area ids, got {}",
                geometry.triangle_count(),
                areas.len()
            )));
        }
        for (tri, &area) in areas.iter().enumerate() {
            rasterize_triangle(self, geometry.triangle(tri), area, flag_merge_threshold)?;
        }
        log::debug!(
            "Rasterized {} triangles into {}x{} heightfield ({} spans)",
            geometry.triangle_count(),
            self.width,
            self.height,
            self.span_count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(size: f32, y: f32) -> InputGeometry {
        InputGeometry::new(
            vec![0.0, y, 0.0, size, y, 0.0, size, y, size, 0.0, y, size],
            vec![0, 2, 1, 0, 3, 2],
        )
        .unwrap()
    }

    #[test]
    fn test_mark_walkable_triangles_by_slope() {
        // Flat, upward facing
        let flat = mark_walkable_triangles(45.0, &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0], &[0, 1, 2]);
        assert_eq!(flat, vec![WALKABLE_AREA]);

        // Vertical wall
        let wall = mark_walkable_triangles(45.0, &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0], &[0, 1, 2]);
        assert_eq!(wall, vec![NULL_AREA]);

        // 30 degree ramp passes at 45 but not at 20
        let rise = 30f32.to_radians().tan();
        let ramp = [0.0, 0.0, 0.0, 0.0, rise, 1.0, 1.0, 0.0, 0.0];
        assert_eq!(mark_walkable_triangles(45.0, &ramp, &[0, 1, 2]), vec![WALKABLE_AREA]);
        assert_eq!(mark_walkable_triangles(20.0, &ramp, &[0, 1, 2]), vec![NULL_AREA]);
    }

    #[test]
    fn test_divide_poly() {
        let square = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(0.0, 0.0, 2.0),
        ];
        let (left, right) = divide_poly(&square, 1.0, 0);
        assert_eq!(left.len(), 4);
        assert_eq!(right.len(), 4);
        assert!(left.iter().all(|v| v.x <= 1.0));
        assert!(right.iter().all(|v| v.x >= 1.0));
    }

    #[test]
    fn test_rasterize_flat_quad_fills_grid() {
        let geom = quad(4.0, 1.0);
        let mut hf = Heightfield::new(
            8,
            8,
            geom.bmin(),
            geom.bmax() + Vec3::new(0.0, 2.0, 0.0),
            0.5,
            0.1,
        )
        .unwrap();
        let areas = mark_walkable_triangles(45.0, geom.vertices(), geom.indices());
        hf.rasterize_triangles(&geom, &areas, 1).unwrap();

        assert_eq!(hf.span_count(), 64);
        assert_eq!(hf.walkable_span_count(), 64);
        for z in 0..8 {
            for x in 0..8 {
                assert_eq!(hf.spans(x, z).len(), 1);
            }
        }
    }

    #[test]
    fn test_rasterize_rejects_area_mismatch() {
        let geom = quad(1.0, 0.0);
        let mut hf = Heightfield::new(2, 2, Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0), 0.5, 0.1).unwrap();
        assert!(hf.rasterize_triangles(&geom, &[WALKABLE_AREA], 1).is_err());
    }

    #[test]
    fn test_geometry_outside_grid_is_ignored() {
        let geom = quad(1.0, 0.0);
        let mut hf = Heightfield::new(
            2,
            2,
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(11.0, 1.0, 11.0),
            0.5,
            0.1,
        )
        .unwrap();
        hf.rasterize_triangles(&geom, &[WALKABLE_AREA; 2], 1).unwrap();
        assert_eq!(hf.span_count(), 0);
    }
}
