//! Vector helpers over `[f32; 3]`
//!
//! The runtime side of the library stores positions as plain float triples
//! so tiles can be serialized and shared without conversion. These helpers
//! cover the handful of operations the queries need; 2D variants work on
//! the xz plane.

use std::f32::consts::PI;

pub type Vector3 = [f32; 3];

#[inline]
pub fn vadd(a: &Vector3, b: &Vector3) -> Vector3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vsub(a: &Vector3, b: &Vector3) -> Vector3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vscale(v: &Vector3, s: f32) -> Vector3 {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Returns `a + b * s`
#[inline]
pub fn vmad(a: &Vector3, b: &Vector3, s: f32) -> Vector3 {
    [a[0] + b[0] * s, a[1] + b[1] * s, a[2] + b[2] * s]
}

#[inline]
pub fn vlerp(a: &Vector3, b: &Vector3, t: f32) -> Vector3 {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

#[inline]
pub fn vdot(a: &Vector3, b: &Vector3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vdot_2d(a: &Vector3, b: &Vector3) -> f32 {
    a[0] * b[0] + a[2] * b[2]
}

#[inline]
pub fn vperp_2d(a: &Vector3, b: &Vector3) -> f32 {
    a[2] * b[0] - a[0] * b[2]
}

#[inline]
pub fn vcross(a: &Vector3, b: &Vector3) -> Vector3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub fn vlen(v: &Vector3) -> f32 {
    vdot(v, v).sqrt()
}

#[inline]
pub fn vlen_sqr(v: &Vector3) -> f32 {
    vdot(v, v)
}

#[inline]
pub fn vdist(a: &Vector3, b: &Vector3) -> f32 {
    vlen(&vsub(b, a))
}

#[inline]
pub fn vdist_sqr(a: &Vector3, b: &Vector3) -> f32 {
    vlen_sqr(&vsub(b, a))
}

#[inline]
pub fn vdist_2d(a: &Vector3, b: &Vector3) -> f32 {
    vdist_2d_sqr(a, b).sqrt()
}

#[inline]
pub fn vdist_2d_sqr(a: &Vector3, b: &Vector3) -> f32 {
    let dx = b[0] - a[0];
    let dz = b[2] - a[2];
    dx * dx + dz * dz
}

/// Normalizes `v`, leaving near-zero vectors untouched
pub fn vnormalize(v: &Vector3) -> Vector3 {
    let len = vlen(v);
    if len > 1e-6 {
        vscale(v, 1.0 / len)
    } else {
        *v
    }
}

/// Clamps the length of `v` to `max_len`
pub fn vclamp_len(v: &Vector3, max_len: f32) -> Vector3 {
    let len_sqr = vlen_sqr(v);
    if len_sqr > max_len * max_len && len_sqr > 0.0 {
        vscale(v, max_len / len_sqr.sqrt())
    } else {
        *v
    }
}

#[inline]
pub fn vmin(a: &Vector3, b: &Vector3) -> Vector3 {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

#[inline]
pub fn vmax(a: &Vector3, b: &Vector3) -> Vector3 {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

/// Returns true when the points are within `threshold` of each other
pub fn vequal(a: &Vector3, b: &Vector3, threshold: f32) -> bool {
    vdist_sqr(a, b) < threshold * threshold
}

/// Signed area of triangle (a, b, c) on the xz plane, times two
#[inline]
pub fn tri_area_2d(a: &Vector3, b: &Vector3, c: &Vector3) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// Axis-aligned box overlap test
pub fn overlap_bounds(amin: &Vector3, amax: &Vector3, bmin: &Vector3, bmax: &Vector3) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

#[inline]
pub fn deg_to_rad(deg: f32) -> f32 {
    deg * PI / 180.0
}

#[inline]
pub fn to_vec3(v: &Vector3) -> glam::Vec3 {
    glam::Vec3::from_array(*v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_basic_ops() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        assert_eq!(vsub(&b, &a), [3.0, 4.0, 0.0]);
        assert_relative_eq!(vdist(&a, &b), 5.0);
        assert_relative_eq!(vdist_2d(&a, &b), 3.0);
        assert_eq!(vlerp(&a, &b, 0.5), [2.5, 4.0, 3.0]);
        assert_eq!(vmad(&a, &b, 2.0), [9.0, 14.0, 9.0]);
    }

    #[test]
    fn test_clamp_len() {
        let v = vclamp_len(&[3.0, 0.0, 4.0], 2.5);
        assert_relative_eq!(vlen(&v), 2.5, epsilon = 1e-5);
        assert_eq!(vclamp_len(&[0.1, 0.0, 0.0], 1.0), [0.1, 0.0, 0.0]);
    }

    #[test]
    fn test_tri_area_sign() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 0.0, 1.0];
        assert!(tri_area_2d(&a, &b, &c) < 0.0);
        assert!(tri_area_2d(&a, &c, &b) > 0.0);
    }

    #[test]
    fn test_overlap_bounds() {
        let amin = [0.0, 0.0, 0.0];
        let amax = [1.0, 1.0, 1.0];
        assert!(overlap_bounds(&amin, &amax, &[0.5, 0.5, 0.5], &[2.0, 2.0, 2.0]));
        assert!(!overlap_bounds(&amin, &amax, &[1.5, 0.0, 0.0], &[2.0, 1.0, 1.0]));
    }
}
