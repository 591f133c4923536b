//! Planar geometry helpers used by the queries. All 2D tests work on the
//! xz plane.

use navforge_common::math::{vdot_2d, vlerp, vperp_2d, vsub, Vector3};

/// Squared xz distance from `pt` to segment p-q, and the segment parameter
/// of the closest point
pub fn distance_pt_seg_sqr_2d(pt: &Vector3, p: &Vector3, q: &Vector3) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Even-odd point in polygon test on the xz plane
pub fn point_in_polygon(pt: &Vector3, verts: &[Vector3]) -> bool {
    let n = verts.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Distance from `pt` to the closest polygon edge, plus the edge index and
/// the parameter along it
pub fn closest_edge(pt: &Vector3, verts: &[Vector3]) -> (f32, usize, f32) {
    let n = verts.len();
    let mut best = (f32::MAX, 0, 0.0);
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let (d, t) = distance_pt_seg_sqr_2d(pt, &verts[j], &verts[i]);
        if d < best.0 {
            best = (d, j, t);
        }
        j = i;
    }
    best
}

/// Closest point on the polygon boundary, with height interpolated along the edge
pub fn closest_point_on_boundary(pt: &Vector3, verts: &[Vector3]) -> Vector3 {
    let (_, edge, t) = closest_edge(pt, verts);
    let next = (edge + 1) % verts.len();
    vlerp(&verts[edge], &verts[next], t)
}

/// Height of triangle a-b-c at the xz position of `p`, when `p` lies inside it
pub fn closest_height_point_triangle(p: &Vector3, a: &Vector3, b: &Vector3, c: &Vector3) -> Option<f32> {
    const EPS: f32 = 1e-6;
    let v0 = vsub(c, a);
    let v1 = vsub(b, a);
    let v2 = vsub(p, a);

    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    let tolerance = -EPS * denom;
    if u >= tolerance && v >= tolerance && (u + v) <= denom - tolerance {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Parametric clip of segment p0-p1 against a convex polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyHit {
    pub tmin: f32,
    pub tmax: f32,
    /// Edge through which the segment enters, if it starts outside
    pub seg_min: Option<usize>,
    /// Edge through which the segment leaves, if it ends outside
    pub seg_max: Option<usize>,
}

/// Clips segment p0-p1 against the convex polygon on the xz plane. Returns
/// `None` when the segment misses the polygon.
pub fn intersect_segment_poly_2d(p0: &Vector3, p1: &Vector3, verts: &[Vector3]) -> Option<SegmentPolyHit> {
    const EPS: f32 = 1e-8;
    let mut hit = SegmentPolyHit {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };
    let dir = vsub(p1, p0);
    let n = verts.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let edge = vsub(&verts[i], &verts[j]);
        let diff = vsub(p0, &verts[j]);
        let num = vperp_2d(&edge, &diff);
        let den = vperp_2d(&dir, &edge);
        if den.abs() < EPS {
            // Parallel to this edge
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = Some(j);
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            hit.tmax = t;
            hit.seg_max = Some(j);
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }
    Some(hit)
}

/// Intersection parameters (s along a, t along b) of two xz segments
pub fn intersect_seg_seg_2d(ap: &Vector3, aq: &Vector3, bp: &Vector3, bq: &Vector3) -> Option<(f32, f32)> {
    let u = vsub(aq, ap);
    let v = vsub(bq, bp);
    let w = vsub(ap, bp);
    let d = vperp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    Some((vperp_2d(&v, &w) / d, vperp_2d(&u, &w) / d))
}

/// Average of the polygon vertices
pub fn poly_center(verts: &[Vector3]) -> Vector3 {
    let mut c = [0.0; 3];
    for v in verts {
        c[0] += v[0];
        c[1] += v[1];
        c[2] += v[2];
    }
    let s = 1.0 / verts.len().max(1) as f32;
    [c[0] * s, c[1] * s, c[2] * s]
}

/// Projects `pt` onto segment a-b in 3D-free xz terms and returns the
/// segment parameter
pub fn project_on_segment_2d(pt: &Vector3, a: &Vector3, b: &Vector3) -> f32 {
    let ab = vsub(b, a);
    let ap = vsub(pt, a);
    let len = vdot_2d(&ab, &ab);
    if len <= 0.0 {
        return 0.0;
    }
    (vdot_2d(&ap, &ab) / len).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square() -> Vec<Vector3> {
        vec![[0.0, 0.0, 0.0], [0.0, 0.0, 2.0], [2.0, 0.0, 2.0], [2.0, 0.0, 0.0]]
    }

    #[test]
    fn test_point_in_polygon() {
        let sq = square();
        assert!(point_in_polygon(&[1.0, 5.0, 1.0], &sq));
        assert!(!point_in_polygon(&[3.0, 0.0, 1.0], &sq));
    }

    #[test]
    fn test_distance_to_segment() {
        let (d, t) = distance_pt_seg_sqr_2d(&[1.0, 0.0, 1.0], &[0.0, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        assert_relative_eq!(d, 1.0);
        assert_relative_eq!(t, 0.5);
    }

    #[test]
    fn test_closest_height_on_triangle() {
        let a = [0.0, 0.0, 0.0];
        let b = [0.0, 2.0, 2.0];
        let c = [2.0, 0.0, 0.0];
        let h = closest_height_point_triangle(&[0.5, 0.0, 1.0], &a, &b, &c).unwrap();
        assert_relative_eq!(h, 1.0, epsilon = 1e-5);
        assert!(closest_height_point_triangle(&[5.0, 0.0, 5.0], &a, &b, &c).is_none());
    }

    #[test]
    fn test_segment_through_square() {
        let sq = square();
        let hit = intersect_segment_poly_2d(&[1.0, 0.0, 1.0], &[5.0, 0.0, 1.0], &sq).unwrap();
        assert_relative_eq!(hit.tmin, 0.0);
        assert_relative_eq!(hit.tmax, 0.25, epsilon = 1e-6);
        assert!(hit.seg_min.is_none());
        assert_eq!(hit.seg_max, Some(2));

        let inside = intersect_segment_poly_2d(&[0.5, 0.0, 0.5], &[1.5, 0.0, 1.5], &sq).unwrap();
        assert!(inside.seg_max.is_none());

        assert!(intersect_segment_poly_2d(&[5.0, 0.0, 5.0], &[6.0, 0.0, 6.0], &sq).is_none());
    }

    #[test]
    fn test_seg_seg() {
        let (s, t) = intersect_seg_seg_2d(
            &[0.0, 0.0, 0.0],
            &[2.0, 0.0, 0.0],
            &[1.0, 0.0, -1.0],
            &[1.0, 0.0, 1.0],
        )
        .unwrap();
        assert_relative_eq!(s, 0.5);
        assert_relative_eq!(t, 0.5);
    }

    #[test]
    fn test_closest_point_on_boundary() {
        let p = closest_point_on_boundary(&[1.0, 0.0, 3.0], &square());
        assert_relative_eq!(p[0], 1.0);
        assert_relative_eq!(p[2], 2.0);
    }
}
