//! Local velocity selection around nearby agents and walls
//!
//! Candidate velocities are sampled on rings around a biased copy of the
//! desired velocity. Each candidate is scored by how far it strays from the
//! desired and current velocities, which side of an obstacle it passes, and
//! how soon it would collide. The best candidate becomes the center of the
//! next, half-sized pattern.

use navforge_common::math::{vdot_2d, vperp_2d};
use navforge_detour::distance_pt_seg_sqr_2d;

const MAX_PATTERN_DIVS: u8 = 32;
const MAX_PATTERN_RINGS: u8 = 4;

/// Default capacities used by the crowd
pub const DEFAULT_MAX_CIRCLES: usize = 6;
pub const DEFAULT_MAX_SEGMENTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleAvoidanceParams {
    /// Share of the desired velocity the sample pattern is centered on
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    /// Look-ahead time for collisions in seconds
    pub horiz_time: f32,
    /// Samples per ring
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    /// Refinement passes
    pub adaptive_depth: u8,
}

impl ObstacleAvoidanceParams {
    pub fn low() -> Self {
        Self {
            weight_toi: 2.0,
            adaptive_divs: 5,
            adaptive_rings: 2,
            adaptive_depth: 1,
            ..Self::medium()
        }
    }

    pub fn medium() -> Self {
        Self {
            vel_bias: 0.5,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            adaptive_divs: 5,
            adaptive_rings: 2,
            adaptive_depth: 2,
        }
    }

    pub fn good() -> Self {
        Self {
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 3,
            ..Self::medium()
        }
    }

    pub fn high() -> Self {
        Self {
            adaptive_divs: 7,
            adaptive_rings: 3,
            adaptive_depth: 3,
            ..Self::medium()
        }
    }
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self::medium()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObstacleCircle {
    pub pos: [f32; 3],
    pub vel: [f32; 3],
    pub desired_vel: [f32; 3],
    pub radius: f32,
    /// Direction from the sampling agent to the obstacle
    dp: [f32; 3],
    /// Preferred passing side
    np: [f32; 3],
}

#[derive(Debug, Clone, Default)]
pub struct ObstacleSegment {
    pub p: [f32; 3],
    pub q: [f32; 3],
    /// Agent is already in contact with the segment
    touch: bool,
}

/// Obstacles collected for one sampling pass
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    max_circles: usize,
    max_segments: usize,
    circles: Vec<ObstacleCircle>,
    segments: Vec<ObstacleSegment>,
}

impl Default for ObstacleAvoidanceQuery {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CIRCLES, DEFAULT_MAX_SEGMENTS)
    }
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            max_circles,
            max_segments,
            circles: Vec::with_capacity(max_circles),
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Registers a moving circle; ignored once the circle capacity is reached
    pub fn add_circle(&mut self, pos: &[f32; 3], radius: f32, vel: &[f32; 3], desired_vel: &[f32; 3]) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            pos: *pos,
            vel: *vel,
            desired_vel: *desired_vel,
            radius,
            ..Default::default()
        });
    }

    pub fn add_segment(&mut self, p: &[f32; 3], q: &[f32; 3]) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment {
            p: *p,
            q: *q,
            touch: false,
        });
    }

    pub fn circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn circles(&self) -> &[ObstacleCircle] {
        &self.circles
    }

    pub fn segments(&self) -> &[ObstacleSegment] {
        &self.segments
    }

    /// Picks a velocity for an agent at `pos` with radius `radius`. Returns
    /// the chosen velocity and the number of candidates scored. With no
    /// registered obstacles the desired velocity is returned as is.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: &[f32; 3],
        radius: f32,
        max_speed: f32,
        vel: &[f32; 3],
        desired_vel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
    ) -> ([f32; 3], usize) {
        if self.circles.is_empty() && self.segments.is_empty() {
            return (*desired_vel, 0);
        }
        self.prepare(pos, desired_vel);

        let sampler = Sampler {
            params,
            pos,
            radius,
            vel,
            desired_vel,
            inv_vmax: if max_speed > 0.0 { 1.0 / max_speed } else { f32::MAX },
            inv_horiz_time: 1.0 / params.horiz_time.max(f32::EPSILON),
            circles: &self.circles,
            segments: &self.segments,
        };

        let pattern = sample_pattern(params, desired_vel);
        let mut center = [desired_vel[0] * params.vel_bias, 0.0, desired_vel[2] * params.vel_bias];
        let mut spread = max_speed * (1.0 - params.vel_bias);
        let limit = (max_speed + 0.001) * (max_speed + 0.001);
        let mut samples = 0;

        for _ in 0..params.adaptive_depth.max(1) {
            let mut best = center;
            let mut min_penalty = f32::MAX;
            for &(px, pz) in &pattern {
                let cand = [center[0] + px * spread, 0.0, center[2] + pz * spread];
                if cand[0] * cand[0] + cand[2] * cand[2] > limit {
                    continue;
                }
                let penalty = sampler.penalty(&cand);
                samples += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    best = cand;
                }
            }
            center = best;
            spread *= 0.5;
        }
        (center, samples)
    }

    fn prepare(&mut self, pos: &[f32; 3], desired_vel: &[f32; 3]) {
        for cir in &mut self.circles {
            cir.dp = normalize_2d(&[cir.pos[0] - pos[0], 0.0, cir.pos[2] - pos[2]]);
            let dv = [cir.desired_vel[0] - desired_vel[0], 0.0, cir.desired_vel[2] - desired_vel[2]];
            // Pass on the side the obstacle is not drifting towards
            let a = vperp_2d(&cir.dp, &dv);
            cir.np = if a < 0.01 {
                [-cir.dp[2], 0.0, cir.dp[0]]
            } else {
                [cir.dp[2], 0.0, -cir.dp[0]]
            };
        }
        for seg in &mut self.segments {
            seg.touch = distance_pt_seg_sqr_2d(pos, &seg.p, &seg.q).0 < 0.01 * 0.01;
        }
    }
}

/// Unit offsets of the sample pattern, rotated to face `desired_vel`
fn sample_pattern(params: &ObstacleAvoidanceParams, desired_vel: &[f32; 3]) -> Vec<(f32, f32)> {
    let divs = params.adaptive_divs.clamp(1, MAX_PATTERN_DIVS) as usize;
    let rings = params.adaptive_rings.clamp(1, MAX_PATTERN_RINGS) as usize;
    let da = std::f32::consts::TAU / divs as f32;
    let heading = if desired_vel[0].abs() + desired_vel[2].abs() > 1e-6 {
        desired_vel[2].atan2(desired_vel[0])
    } else {
        0.0
    };

    let mut pattern = Vec::with_capacity(1 + divs * rings);
    pattern.push((0.0, 0.0));
    for ring in 0..rings {
        let r = (rings - ring) as f32 / rings as f32;
        // Stagger alternate rings by half a division
        let offset = if ring % 2 == 1 { da * 0.5 } else { 0.0 };
        for i in 0..divs {
            let a = heading + offset + da * i as f32;
            pattern.push((a.cos() * r, a.sin() * r));
        }
    }
    pattern
}

struct Sampler<'a> {
    params: &'a ObstacleAvoidanceParams,
    pos: &'a [f32; 3],
    radius: f32,
    vel: &'a [f32; 3],
    desired_vel: &'a [f32; 3],
    inv_vmax: f32,
    inv_horiz_time: f32,
    circles: &'a [ObstacleCircle],
    segments: &'a [ObstacleSegment],
}

impl Sampler<'_> {
    fn penalty(&self, cand: &[f32; 3]) -> f32 {
        let p = self.params;
        let vpen = p.weight_des_vel * dist_2d(cand, self.desired_vel) * self.inv_vmax;
        let vcpen = p.weight_cur_vel * dist_2d(cand, self.vel) * self.inv_vmax;

        let mut tmin = p.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in self.circles {
            // Reciprocal velocity: each party takes half of the avoidance
            let vab = [
                cand[0] * 2.0 - self.vel[0] - cir.vel[0],
                0.0,
                cand[2] * 2.0 - self.vel[2] - cir.vel[2],
            ];
            side += (vdot_2d(&cir.dp, &vab) * 0.5 + 0.5)
                .min(vdot_2d(&cir.np, &vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(self.pos, self.radius, &vab, &cir.pos, cir.radius)
            else {
                continue;
            };
            // Already overlapping: steer out at half urgency
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }
            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
            }
        }

        for seg in self.segments {
            let htmin = if seg.touch {
                let dir = [seg.q[0] - seg.p[0], 0.0, seg.q[2] - seg.p[2]];
                let normal = [-dir[2], 0.0, dir[0]];
                // Moving away from a touching wall is free
                if vdot_2d(&normal, cand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match intersect_ray_segment(self.pos, cand, &seg.p, &seg.q) {
                    Some(t) => t * 2.0,
                    None => continue,
                }
            };
            if htmin < tmin {
                tmin = htmin;
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }
        let spen = p.weight_side * side;
        let tpen = p.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));
        vpen + vcpen + spen + tpen
    }
}

/// Times at which a circle at `c0` moving with `v` touches a static circle
/// at `c1`
fn sweep_circle_circle(c0: &[f32; 3], r0: f32, v: &[f32; 3], c1: &[f32; 3], r1: f32) -> Option<(f32, f32)> {
    let s = [c1[0] - c0[0], 0.0, c1[2] - c0[2]];
    let r = r0 + r1;
    let c = vdot_2d(&s, &s) - r * r;
    let a = vdot_2d(v, v);
    if a < 1e-6 {
        return None;
    }
    let b = vdot_2d(v, &s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Parameter along `dir` where the ray from `origin` crosses segment p-q
fn intersect_ray_segment(origin: &[f32; 3], dir: &[f32; 3], p: &[f32; 3], q: &[f32; 3]) -> Option<f32> {
    let v = [q[0] - p[0], 0.0, q[2] - p[2]];
    let w = [origin[0] - p[0], 0.0, origin[2] - p[2]];
    let d = vperp_2d(dir, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let inv_d = 1.0 / d;
    let t = vperp_2d(&v, &w) * inv_d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = vperp_2d(dir, &w) * inv_d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

fn dist_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dz = a[2] - b[2];
    (dx * dx + dz * dz).sqrt()
}

fn normalize_2d(v: &[f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[2] * v[2]).sqrt();
    if len > 1e-4 {
        [v[0] / len, 0.0, v[2] / len]
    } else {
        [0.0; 3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_no_obstacles_keeps_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::default();
        let dvel = [1.2, 0.0, -0.4];
        let (vel, samples) =
            query.sample_velocity_adaptive(&[0.0; 3], 0.5, 2.0, &[0.0; 3], &dvel, &ObstacleAvoidanceParams::default());
        assert_eq!(vel, dvel);
        assert_eq!(samples, 0);
    }

    #[test]
    fn test_circle_ahead_deflects() {
        let mut query = ObstacleAvoidanceQuery::default();
        let dvel = [1.0, 0.0, 0.0];
        query.add_circle(&[2.0, 0.0, 0.0], 0.5, &[0.0; 3], &[0.0; 3]);

        let (vel, samples) =
            query.sample_velocity_adaptive(&[0.0; 3], 0.5, 1.0, &dvel, &dvel, &ObstacleAvoidanceParams::default());
        assert!(samples > 0);
        assert!(dist_2d(&vel, &dvel) > 0.01, "{vel:?}");
        assert!(vel[0] * vel[0] + vel[2] * vel[2] <= 1.0 + 0.01);
    }

    #[test]
    fn test_capacity_and_reset() {
        let mut query = ObstacleAvoidanceQuery::new(1, 1);
        query.add_circle(&[0.0; 3], 1.0, &[0.0; 3], &[0.0; 3]);
        query.add_circle(&[1.0; 3], 1.0, &[0.0; 3], &[0.0; 3]);
        query.add_segment(&[0.0; 3], &[1.0, 0.0, 0.0]);
        query.add_segment(&[0.0; 3], &[0.0, 0.0, 1.0]);
        assert_eq!(query.circle_count(), 1);
        assert_eq!(query.segment_count(), 1);
        query.reset();
        assert_eq!(query.circle_count(), 0);
        assert_eq!(query.segment_count(), 0);
    }

    #[test]
    fn test_presets_scale_with_quality() {
        let low = ObstacleAvoidanceParams::low();
        let medium = ObstacleAvoidanceParams::medium();
        let high = ObstacleAvoidanceParams::high();
        assert_eq!(ObstacleAvoidanceParams::default(), medium);
        assert!(low.adaptive_depth < medium.adaptive_depth);
        assert!(low.weight_toi != medium.weight_toi);
        assert!(high.adaptive_rings > medium.adaptive_rings);
        assert_eq!(sample_pattern(&high, &[1.0, 0.0, 0.0]).len(), 1 + 7 * 3);
    }

    #[test]
    fn test_walls_touching_the_agent() {
        let mut query = ObstacleAvoidanceQuery::default();
        query.add_segment(&[-1.0, 0.0, 0.005], &[1.0, 0.0, 0.005]);
        query.add_segment(&[0.005, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        query.add_segment(&[0.5, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        query.add_segment(&[-1.0, 0.0, 0.5], &[1.0, 0.0, 0.5]);
        query.prepare(&[0.0; 3], &[1.0, 0.0, 0.0]);
        let touching: Vec<bool> = query.segments.iter().map(|s| s.touch).collect();
        assert_eq!(touching, [true, true, false, false]);
    }

    #[test]
    fn test_ray_segment_intersection() {
        let t = intersect_ray_segment(&[0.0; 3], &[2.0, 0.0, 0.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]);
        assert_relative_eq!(t.unwrap(), 0.5, epsilon = 1e-5);
        assert!(intersect_ray_segment(&[0.0; 3], &[0.0, 0.0, 1.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]).is_none());
    }
}
