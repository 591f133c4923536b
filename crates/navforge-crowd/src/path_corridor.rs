//! Polygon corridor followed by an agent
//!
//! The corridor is the chain of polygons from the polygon under the agent to
//! the polygon holding its target. Moving the agent or the target splices
//! the visited polygons into the chain instead of searching again.

use navforge_common::math::vdist_2d_sqr;
use navforge_detour::{
    NavMesh, NavMeshQuery, PolyRef, QueryFilter, Result, Status, StraightPathFlags,
};

/// Default cap on corridor length
pub const DEFAULT_MAX_PATH: usize = 256;

/// Corners closer than this to the agent are dropped
const MIN_CORNER_DIST: f32 = 0.01;

/// Waypoint ahead of the agent along its corridor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon the waypoint is entered from
    pub poly: PolyRef,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PathCorridor {
    pos: [f32; 3],
    target: [f32; 3],
    path: Vec<PolyRef>,
    max_path: usize,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PATH)
    }
}

impl PathCorridor {
    pub fn new(max_path: usize) -> Self {
        Self {
            pos: [0.0; 3],
            target: [0.0; 3],
            path: Vec::new(),
            max_path: max_path.max(1),
        }
    }

    /// Single-polygon corridor with the agent and target both at `pos`
    pub fn reset(&mut self, reference: PolyRef, pos: [f32; 3]) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if reference.is_valid() {
            self.path.push(reference);
        }
    }

    /// Replaces the corridor with `path`, truncated to the corridor capacity
    pub fn set_corridor(&mut self, target: [f32; 3], path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path.extend_from_slice(&path[..path.len().min(self.max_path)]);
    }

    pub fn pos(&self) -> [f32; 3] {
        self.pos
    }

    pub fn target(&self) -> [f32; 3] {
        self.target
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    /// First polygon, `PolyRef::NULL` for an empty corridor
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }

    /// Up to `max_corners` string-pulled waypoints ahead of the agent. The
    /// agent's own position is not included; the last corner carries
    /// [`StraightPathFlags::END`] when the target is within reach.
    pub fn find_corners(&self, query: &NavMeshQuery, max_corners: usize) -> Result<Vec<Corner>> {
        if self.path.is_empty() {
            return Ok(Vec::new());
        }
        let straight = query.find_straight_path(&self.pos, &self.target, &self.path, max_corners + 1)?;

        let mut corners = Vec::with_capacity(straight.len());
        for i in 0..straight.len() {
            let pos = straight.point(i);
            let flags = straight.flags[i];
            let near = vdist_2d_sqr(&pos, &self.pos) < MIN_CORNER_DIST * MIN_CORNER_DIST;
            // Drop the start and anything on top of the agent, but never a
            // corner that starts an off-mesh connection
            if corners.is_empty() && near && !flags.contains(StraightPathFlags::OFFMESH_CONNECTION) {
                if flags.contains(StraightPathFlags::END) {
                    corners.push(Corner {
                        pos,
                        flags,
                        poly: straight.refs[i],
                    });
                }
                continue;
            }
            corners.push(Corner {
                pos,
                flags,
                poly: straight.refs[i],
            });
            if flags.contains(StraightPathFlags::OFFMESH_CONNECTION) || corners.len() >= max_corners {
                break;
            }
        }
        Ok(corners)
    }

    /// Moves the agent along the surface towards `new_pos` and drops or adds
    /// the polygons it crossed. Returns the constrained position.
    pub fn move_position(
        &mut self,
        new_pos: &[f32; 3],
        query: &NavMeshQuery,
        filter: &dyn QueryFilter,
    ) -> Result<[f32; 3]> {
        let start = *self.path.first().ok_or(Status::InvalidParam)?;
        let (mut result, visited) = query.move_along_surface(start, &self.pos, new_pos, filter)?;
        merge_start_moved(&mut self.path, &visited, self.max_path);

        if let Some(&first) = self.path.first() {
            if let Ok(h) = query.get_poly_height(first, &result) {
                result[1] = h;
            }
        }
        self.pos = result;
        Ok(result)
    }

    /// Moves the target along the surface towards `new_pos`, extending or
    /// shortening the end of the corridor. Returns the constrained target.
    pub fn move_target_position(
        &mut self,
        new_pos: &[f32; 3],
        query: &NavMeshQuery,
        filter: &dyn QueryFilter,
    ) -> Result<[f32; 3]> {
        let last = *self.path.last().ok_or(Status::InvalidParam)?;
        let (result, visited) = query.move_along_surface(last, &self.target, new_pos, filter)?;
        merge_end_moved(&mut self.path, &visited, self.max_path);
        self.target = result;
        Ok(result)
    }

    /// Shortcuts the start of the corridor when `next` is visible from the
    /// agent within `range`
    pub fn optimize_path_visibility(
        &mut self,
        next: &[f32; 3],
        range: f32,
        query: &NavMeshQuery,
        filter: &dyn QueryFilter,
    ) -> Result<bool> {
        let Some(&start) = self.path.first() else {
            return Ok(false);
        };
        let mut goal = *next;
        let dist = vdist_2d_sqr(&self.pos, &goal).sqrt();
        if dist < 0.01 {
            return Ok(false);
        }
        // Overshoot a little so a reachable goal lands inside the next polygon
        let scale = (dist + 0.01).min(range) / dist;
        for i in [0, 2] {
            goal[i] = self.pos[i] + (goal[i] - self.pos[i]) * scale;
        }

        let hit = query.raycast(start, &self.pos, &goal, filter)?;
        if hit.path.len() > 1 && hit.t > 0.99 {
            let before = self.path.len();
            merge_start_shortcut(&mut self.path, &hit.path, self.max_path);
            return Ok(self.path.len() != before);
        }
        Ok(false)
    }

    /// True when the first `max_look_ahead` polygons still exist in
    /// `nav_mesh` and pass `filter`
    pub fn is_valid(&self, max_look_ahead: usize, nav_mesh: &NavMesh, filter: &dyn QueryFilter) -> bool {
        self.path.iter().take(max_look_ahead).all(|&r| match nav_mesh.get_tile_and_poly(r) {
            Ok((tile, poly)) => filter.pass_filter(r, tile, poly),
            Err(_) => false,
        })
    }

    /// Restarts the corridor from `safe_ref` when its first polygon is gone
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: [f32; 3]) -> bool {
        if !safe_ref.is_valid() {
            return false;
        }
        self.pos = safe_pos;
        if self.path.first() != Some(&safe_ref) {
            self.path.insert(0, safe_ref);
            self.path.truncate(self.max_path);
        }
        true
    }

    /// Drops the corridor up to and including the off-mesh connection
    /// `off_mesh_ref` and places the agent at its far end. Returns the
    /// connection's entry and exit points.
    pub fn move_over_off_mesh_connection(
        &mut self,
        off_mesh_ref: PolyRef,
        nav_mesh: &NavMesh,
    ) -> Option<([f32; 3], [f32; 3])> {
        let idx = self.path.iter().position(|&r| r == off_mesh_ref)?;
        let (tile, poly) = nav_mesh.get_tile_and_poly(off_mesh_ref).ok()?;
        if !poly.is_off_mesh() {
            return None;
        }
        let verts = tile.poly_vertices(poly);
        // The entry is whichever endpoint the agent is standing next to
        let (start, end) = if vdist_2d_sqr(&verts[0], &self.pos) <= vdist_2d_sqr(&verts[1], &self.pos) {
            (verts[0], verts[1])
        } else {
            (verts[1], verts[0])
        };
        self.path.drain(..=idx);
        self.pos = end;
        Some((start, end))
    }

    /// True when the agent stands on the last polygon of the corridor within
    /// `radius` of the target, measured on the XZ plane
    pub fn is_at_target(&self, radius: f32) -> bool {
        self.path.len() <= 1 && vdist_2d_sqr(&self.pos, &self.target) <= radius * radius
    }
}

/// Last index in `path` (searched backwards) that also appears in
/// `visited`, with its index in `visited`
fn furthest_common(path: &[PolyRef], visited: &[PolyRef], from_end: bool) -> Option<(usize, usize)> {
    let find = |i: usize| visited.iter().rposition(|&v| v == path[i]).map(|j| (i, j));
    if from_end {
        (0..path.len()).rev().find_map(find)
    } else {
        (0..path.len()).find_map(find)
    }
}

/// The agent walked `visited` starting from the first polygon of `path`
fn merge_start_moved(path: &mut Vec<PolyRef>, visited: &[PolyRef], max_path: usize) {
    let Some((fp, fv)) = furthest_common(path, visited, true) else {
        return;
    };
    let mut merged: Vec<PolyRef> = visited[fv..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[fp + 1..]);
    merged.truncate(max_path);
    *path = merged;
}

/// The target walked `visited` starting from the last polygon of `path`
fn merge_end_moved(path: &mut Vec<PolyRef>, visited: &[PolyRef], max_path: usize) {
    let Some((fp, fv)) = furthest_common(path, visited, false) else {
        return;
    };
    path.truncate(fp + 1);
    path.extend_from_slice(&visited[fv + 1..]);
    path.truncate(max_path);
}

/// `visited` is a straight route from the first polygon to somewhere
/// further along `path`
fn merge_start_shortcut(path: &mut Vec<PolyRef>, visited: &[PolyRef], max_path: usize) {
    let Some((fp, fv)) = furthest_common(path, visited, true) else {
        return;
    };
    if fv == 0 {
        return;
    }
    let mut merged = visited[..fv].to_vec();
    merged.extend_from_slice(&path[fp..]);
    merged.truncate(max_path);
    *path = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(i: u32) -> PolyRef {
        PolyRef::new(1, 0, i)
    }

    #[test]
    fn test_reset_and_set_corridor() {
        let mut c = PathCorridor::default();
        assert!(c.first_poly().is_null());
        c.reset(r(3), [1.0, 0.0, 1.0]);
        assert_eq!(c.path(), &[r(3)]);
        assert_eq!(c.target(), [1.0, 0.0, 1.0]);

        c.set_corridor([5.0, 0.0, 1.0], &[r(3), r(4), r(5)]);
        assert_eq!(c.first_poly(), r(3));
        assert_eq!(c.last_poly(), r(5));
        assert_eq!(c.path_count(), 3);

        let mut small = PathCorridor::new(2);
        small.set_corridor([0.0; 3], &[r(1), r(2), r(3)]);
        assert_eq!(small.path(), &[r(1), r(2)]);
    }

    #[test]
    fn test_merge_start_moved_forward() {
        let mut path = vec![r(1), r(2), r(3), r(4)];
        merge_start_moved(&mut path, &[r(1), r(2), r(3)], 16);
        assert_eq!(path, vec![r(3), r(4)]);
    }

    #[test]
    fn test_merge_start_moved_off_corridor() {
        let mut path = vec![r(1), r(2), r(3)];
        merge_start_moved(&mut path, &[r(1), r(9)], 16);
        assert_eq!(path, vec![r(9), r(1), r(2), r(3)]);

        let mut unrelated = vec![r(1), r(2)];
        merge_start_moved(&mut unrelated, &[r(7), r(8)], 16);
        assert_eq!(unrelated, vec![r(1), r(2)]);
    }

    #[test]
    fn test_merge_end_moved() {
        let mut path = vec![r(1), r(2), r(3)];
        merge_end_moved(&mut path, &[r(3), r(4), r(5)], 16);
        assert_eq!(path, vec![r(1), r(2), r(3), r(4), r(5)]);

        // Target moved back into the corridor
        let mut path = vec![r(1), r(2), r(3)];
        merge_end_moved(&mut path, &[r(3), r(2)], 16);
        assert_eq!(path, vec![r(1), r(2)]);
    }

    #[test]
    fn test_merge_start_shortcut() {
        let mut path = vec![r(1), r(2), r(3), r(4), r(5)];
        merge_start_shortcut(&mut path, &[r(1), r(7), r(4)], 16);
        assert_eq!(path, vec![r(1), r(7), r(4), r(5)]);
    }

    #[test]
    fn test_fix_path_start() {
        let mut c = PathCorridor::default();
        c.set_corridor([0.0; 3], &[r(2), r(3)]);
        assert!(!c.fix_path_start(PolyRef::NULL, [0.0; 3]));
        assert!(c.fix_path_start(r(1), [1.0, 0.0, 0.0]));
        assert_eq!(c.path(), &[r(1), r(2), r(3)]);
        assert_eq!(c.pos(), [1.0, 0.0, 0.0]);
    }
}
