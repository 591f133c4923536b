//! Spatial queries and path searches over a [`NavMesh`]

use std::collections::{HashSet, VecDeque};

use bitflags::bitflags;
use navforge_common::math::{tri_area_2d, vdist, vdist_sqr, vequal, vlerp, vnormalize};

use crate::geometry::{
    closest_point_on_boundary, distance_pt_seg_sqr_2d, intersect_segment_poly_2d, point_in_polygon,
    project_on_segment_2d,
};
use crate::nav_mesh::{MeshTile, NavMesh, Poly};
use crate::node_pool::{NodeFlags, NodePool, OpenList};
use crate::query_filter::QueryFilter;
use crate::sliced::SlicedSearch;
use crate::{PolyRef, Result, Status, LINK_INTERNAL};

/// Default size of the search node pool
pub const DEFAULT_MAX_NODES: usize = 2048;
/// Scales the A* heuristic slightly below the true distance
const H_SCALE: f32 = 0.999;
const MOVE_MAX_STACK: usize = 48;

bitflags! {
    /// Per-waypoint flags of a straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct StraightPathFlags: u8 {
        const START = 0x01;
        const END = 0x02;
        /// Waypoint is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// Polygon corridor returned by a path search
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    pub path: Vec<PolyRef>,
    /// [`Status::Success`] or [`Status::PartialResult`]
    pub status: Status,
}

impl PathResult {
    pub fn is_partial(&self) -> bool {
        self.status.is_partial()
    }
}

/// Waypoints produced by string pulling a corridor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StraightPath {
    /// Flat xyz triples
    pub points: Vec<f32>,
    pub flags: Vec<StraightPathFlags>,
    /// Polygon entered at each waypoint, null for the end point
    pub refs: Vec<PolyRef>,
}

impl StraightPath {
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn point(&self, i: usize) -> [f32; 3] {
        [self.points[i * 3], self.points[i * 3 + 1], self.points[i * 3 + 2]]
    }

    fn append(&mut self, pos: &[f32; 3], flags: StraightPathFlags, reference: PolyRef) {
        let n = self.len();
        // Merge with the previous point unless that would drop the start
        if n > 1 && vequal(&self.point(n - 1), pos, 1e-6) {
            self.flags[n - 1] = flags;
            self.refs[n - 1] = reference;
            return;
        }
        self.points.extend_from_slice(pos);
        self.flags.push(flags);
        self.refs.push(reference);
    }
}

/// Result of [`NavMeshQuery::raycast`]
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Fraction of the segment travelled before the hit, `f32::MAX` if the
    /// end point was reached
    pub t: f32,
    pub hit_normal: [f32; 3],
    /// Polygons visited, in order
    pub path: Vec<PolyRef>,
    /// Edge of the last polygon that stopped the ray
    pub hit_edge_index: Option<usize>,
}

impl RaycastHit {
    pub fn reached_end(&self) -> bool {
        self.t == f32::MAX
    }
}

/// Polygons reached by [`NavMeshQuery::find_polys_around_circle`]; the three
/// vectors are parallel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircleSearchResult {
    pub refs: Vec<PolyRef>,
    /// Polygon each entry was reached from, null for the start
    pub parents: Vec<PolyRef>,
    pub costs: Vec<f32>,
}

/// Progress of one A* search, shared by [`NavMeshQuery::find_path`] and the
/// sliced search
#[derive(Debug, Clone)]
pub(crate) struct SearchState {
    pool: NodePool,
    open: OpenList,
    pub start_ref: PolyRef,
    pub end_ref: PolyRef,
    pub end_pos: [f32; 3],
    last_best: usize,
    last_best_cost: f32,
    reached: Option<usize>,
    pub out_of_nodes: bool,
}

impl SearchState {
    /// Seeds `pool` with the start node. The pool is cleared first, so node
    /// indices never outlive the search that created them.
    pub(crate) fn new(
        mut pool: NodePool,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
    ) -> Self {
        let h = vdist(start_pos, end_pos) * H_SCALE;
        let start = pool.reset_with(start_ref);
        let node = pool.node_mut(start);
        node.pos = *start_pos;
        node.total = h;
        node.flags = NodeFlags::OPEN;
        let mut open = OpenList::default();
        open.push(start, h);

        Self {
            pool,
            open,
            start_ref,
            end_ref,
            end_pos: *end_pos,
            last_best: start,
            last_best_cost: h,
            reached: None,
            out_of_nodes: false,
        }
    }

    pub(crate) fn into_pool(self) -> NodePool {
        self.pool
    }
}

/// Outcome of one search iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchStep {
    Continue,
    Reached,
    Exhausted,
}

/// Query engine bound to one navigation mesh
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    pub(crate) nav_mesh: &'a NavMesh,
    pub(crate) pool: NodePool,
    pub(crate) open: OpenList,
    pub(crate) sliced: Option<SlicedSearch>,
}

impl<'a> NavMeshQuery<'a> {
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self::with_max_nodes(nav_mesh, DEFAULT_MAX_NODES)
    }

    pub fn with_max_nodes(nav_mesh: &'a NavMesh, max_nodes: usize) -> Self {
        Self {
            nav_mesh,
            pool: NodePool::new(max_nodes.max(1)),
            open: OpenList::default(),
            sliced: None,
        }
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    /// Polygon closest to `center` inside the box `center` ± `half_extents`
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Result<(PolyRef, [f32; 3])> {
        let nav = self.nav_mesh;
        let mut best: Option<(f32, PolyRef, [f32; 3])> = None;

        for reference in nav.query_polygons(center, half_extents) {
            let (tile, poly) = nav.get_tile_and_poly(reference)?;
            if !filter.pass_filter(reference, tile, poly) {
                continue;
            }
            let (closest, over) = nav.closest_point_on_poly(reference, center)?;
            // Directly above or below the polygon only the height beyond
            // the climb distance counts
            let d = if over {
                let dy = (center[1] - closest[1]).abs() - tile.header.walkable_climb;
                if dy > 0.0 {
                    dy * dy
                } else {
                    0.0
                }
            } else {
                vdist_sqr(center, &closest)
            };
            if best.map_or(true, |(bd, _, _)| d < bd) {
                best = Some((d, reference, closest));
            }
        }

        best.map(|(_, r, p)| (r, p)).ok_or(Status::NotFound)
    }

    /// Filtered polygons overlapping the box `center` ± `half_extents`
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Vec<PolyRef> {
        let nav = self.nav_mesh;
        nav.query_polygons(center, half_extents)
            .into_iter()
            .filter(|&r| {
                nav.get_tile_and_poly(r)
                    .map(|(t, p)| filter.pass_filter(r, t, p))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// A* search for a polygon corridor from `start_ref` to `end_ref`.
    ///
    /// When the end polygon cannot be reached, or the corridor is longer
    /// than `max_path`, the corridor towards the polygon closest to the end
    /// is returned with [`Status::PartialResult`].
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_path: usize,
    ) -> Result<PathResult> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !self.nav_mesh.is_valid_poly_ref(end_ref) {
            return Err(Status::InvalidParam);
        }
        if start_ref == end_ref {
            return Ok(PathResult {
                path: vec![start_ref],
                status: Status::Success,
            });
        }

        let pool = std::mem::replace(&mut self.pool, NodePool::new(0));
        let mut state = SearchState::new(pool, start_ref, end_ref, start_pos, end_pos);
        while self.search_step(&mut state, filter) == SearchStep::Continue {}
        let result = self.search_result(&state, max_path);
        self.pool = state.into_pool();
        Ok(result)
    }

    pub(crate) fn max_nodes(&self) -> usize {
        self.pool.max_nodes()
    }

    /// Expands the cheapest open node
    pub(crate) fn search_step(&self, state: &mut SearchState, filter: &dyn QueryFilter) -> SearchStep {
        let nav = self.nav_mesh;
        let Some(best) = state.open.pop(&state.pool) else {
            return SearchStep::Exhausted;
        };
        {
            let node = state.pool.node_mut(best);
            node.flags.remove(NodeFlags::OPEN);
            node.flags.insert(NodeFlags::CLOSED);
        }

        let best_node = state.pool.node(best).clone();
        if best_node.poly == state.end_ref {
            state.last_best = best;
            state.reached = Some(best);
            return SearchStep::Reached;
        }

        let Ok((tile, poly)) = nav.get_tile_and_poly(best_node.poly) else {
            return SearchStep::Continue;
        };
        let parent_ref = best_node.parent.map(|p| state.pool.node(p).poly);

        for link in tile.links_of(poly) {
            let nref = link.reference;
            if nref.is_null() || Some(nref) == parent_ref {
                continue;
            }
            let Ok((ntile, npoly)) = nav.get_tile_and_poly(nref) else {
                continue;
            };
            if !filter.pass_filter(nref, ntile, npoly) {
                continue;
            }
            let Some(nidx) = state.pool.get_or_alloc(nref) else {
                state.out_of_nodes = true;
                continue;
            };

            if state.pool.node(nidx).flags == NodeFlags::default() {
                let Ok((left, right)) =
                    self.get_portal_points_of(best_node.poly, tile, poly, nref, ntile, npoly)
                else {
                    continue;
                };
                state.pool.node_mut(nidx).pos = vlerp(&left, &right, 0.5);
            }
            let npos = state.pool.node(nidx).pos;

            let (cost, heuristic) = if nref == state.end_ref {
                let cur = filter.get_cost(&best_node.pos, &npos, best_node.poly, tile, poly);
                let end = filter.get_cost(&npos, &state.end_pos, nref, ntile, npoly);
                (best_node.cost + cur + end, 0.0)
            } else {
                let cur = filter.get_cost(&best_node.pos, &npos, best_node.poly, tile, poly);
                (best_node.cost + cur, vdist(&npos, &state.end_pos) * H_SCALE)
            };
            let total = cost + heuristic;

            let nnode = state.pool.node(nidx);
            if (nnode.flags.contains(NodeFlags::OPEN) || nnode.flags.contains(NodeFlags::CLOSED))
                && total >= nnode.total
            {
                continue;
            }

            let nnode = state.pool.node_mut(nidx);
            nnode.parent = Some(best);
            nnode.cost = cost;
            nnode.total = total;
            nnode.flags.remove(NodeFlags::CLOSED);
            nnode.flags.insert(NodeFlags::OPEN);
            state.open.push(nidx, total);

            if heuristic < state.last_best_cost {
                state.last_best_cost = heuristic;
                state.last_best = nidx;
            }
        }
        SearchStep::Continue
    }

    pub(crate) fn search_result(&self, state: &SearchState, max_path: usize) -> PathResult {
        let target = state.reached.unwrap_or(state.last_best);
        let mut path = state.pool.path_to(target);
        let mut partial = state.reached.is_none();
        let max_path = max_path.max(1);
        if path.len() > max_path {
            path.truncate(max_path);
            partial = true;
        }
        if state.out_of_nodes {
            log::debug!("Path search from {} ran out of nodes", state.start_ref);
        }
        PathResult {
            path,
            status: if partial { Status::PartialResult } else { Status::Success },
        }
    }

    /// String-pulls the corridor `path` into waypoints from `start_pos` to
    /// `end_pos`. The start and end points are always included.
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<StraightPath> {
        if path.is_empty() || max_points == 0 {
            return Err(Status::InvalidParam);
        }
        let nav = self.nav_mesh;
        let last = path.len() - 1;
        let closest_start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let mut closest_end = self.closest_point_on_poly_boundary(path[last], end_pos)?;

        let mut out = StraightPath::default();
        out.append(&closest_start, StraightPathFlags::START, path[0]);
        if out.len() >= max_points {
            return Ok(out);
        }

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut portal_left = apex;
            let mut portal_right = apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_off_mesh = false;
            let mut right_off_mesh = false;
            let mut left_ref = path[0];
            let mut right_ref = path[0];

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_off_mesh) = if i + 1 < path.len() {
                    match self.get_portal_points(path[i], path[i + 1]) {
                        Ok((l, r)) => {
                            let off = nav
                                .get_tile_and_poly(path[i + 1])
                                .map_or(false, |(_, p)| p.is_off_mesh());
                            if i == 0 && distance_pt_seg_sqr_2d(&apex, &l, &r).0 < 0.001 * 0.001 {
                                i += 1;
                                continue;
                            }
                            (l, r, off)
                        }
                        Err(_) => {
                            // Corridor is broken; stop at the last valid polygon
                            closest_end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            out.append(&closest_end, StraightPathFlags::END, PolyRef::NULL);
                            return Ok(out);
                        }
                    }
                } else {
                    (closest_end, closest_end, false)
                };
                let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

                if tri_area_2d(&apex, &portal_right, &right) <= 0.0 {
                    if vequal(&apex, &portal_right, 1e-6) || tri_area_2d(&apex, &portal_left, &right) > 0.0 {
                        portal_right = right;
                        right_ref = next_ref;
                        right_off_mesh = to_off_mesh;
                        right_index = i;
                    } else {
                        apex = portal_left;
                        apex_index = left_index;
                        let flags = if left_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        out.append(&apex, flags, left_ref);
                        if out.len() >= max_points {
                            return Ok(out);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                if tri_area_2d(&apex, &portal_left, &left) >= 0.0 {
                    if vequal(&apex, &portal_left, 1e-6) || tri_area_2d(&apex, &portal_right, &left) < 0.0 {
                        portal_left = left;
                        left_ref = next_ref;
                        left_off_mesh = to_off_mesh;
                        left_index = i;
                    } else {
                        apex = portal_right;
                        apex_index = right_index;
                        let flags = if right_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        out.append(&apex, flags, right_ref);
                        if out.len() >= max_points {
                            return Ok(out);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }
                i += 1;
            }
        }

        out.append(&closest_end, StraightPathFlags::END, PolyRef::NULL);
        Ok(out)
    }

    /// Walks the polygons along the segment start-end until the end is
    /// reached or a wall or filtered polygon blocks the way
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Result<RaycastHit> {
        let nav = self.nav_mesh;
        if !nav.is_valid_poly_ref(start_ref) {
            return Err(Status::InvalidParam);
        }
        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: [0.0; 3],
            path: Vec::new(),
            hit_edge_index: None,
        };

        let mut cur_ref = start_ref;
        loop {
            let (tile, poly) = nav.get_tile_and_poly(cur_ref)?;
            let verts = tile.poly_vertices(poly);
            let nv = verts.len();

            let Some(seg) = intersect_segment_poly_2d(start_pos, end_pos, &verts) else {
                return Ok(hit);
            };
            hit.hit_edge_index = seg.seg_max;
            if seg.tmax > hit.t {
                hit.t = seg.tmax;
            }
            hit.path.push(cur_ref);

            let Some(edge) = seg.seg_max else {
                hit.t = f32::MAX;
                return Ok(hit);
            };

            let mut next_ref = None;
            for link in tile.links_of(poly) {
                if link.edge as usize != edge {
                    continue;
                }
                let Ok((ntile, npoly)) = nav.get_tile_and_poly(link.reference) else {
                    continue;
                };
                if npoly.is_off_mesh() || !filter.pass_filter(link.reference, ntile, npoly) {
                    continue;
                }
                if link.side == LINK_INTERNAL || (link.bmin == 0 && link.bmax == 255) {
                    next_ref = Some(link.reference);
                    break;
                }

                // Partial portal: the ray must cross inside the linked range
                let v0 = verts[edge];
                let v1 = verts[(edge + 1) % nv];
                let axis = if link.side == 0 || link.side == 2 { 2 } else { 0 };
                let s = 1.0 / 255.0;
                let mut lmin = v0[axis] + (v1[axis] - v0[axis]) * (link.bmin as f32 * s);
                let mut lmax = v0[axis] + (v1[axis] - v0[axis]) * (link.bmax as f32 * s);
                if lmin > lmax {
                    std::mem::swap(&mut lmin, &mut lmax);
                }
                let c = start_pos[axis] + (end_pos[axis] - start_pos[axis]) * seg.tmax;
                if c >= lmin && c <= lmax {
                    next_ref = Some(link.reference);
                    break;
                }
            }

            match next_ref {
                Some(r) => cur_ref = r,
                None => {
                    let va = verts[edge];
                    let vb = verts[(edge + 1) % nv];
                    let dx = vb[0] - va[0];
                    let dz = vb[2] - va[2];
                    hit.hit_normal = vnormalize(&[dz, 0.0, -dx]);
                    return Ok(hit);
                }
            }
        }
    }

    /// Moves from `start_pos` towards `end_pos` constrained to the surface,
    /// sliding along walls. Returns the reached position and the visited
    /// polygons from start to the polygon containing the result.
    pub fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Result<([f32; 3], Vec<PolyRef>)> {
        let nav = self.nav_mesh;
        if !nav.is_valid_poly_ref(start_ref) {
            return Err(Status::InvalidParam);
        }

        // (polygon, parent index)
        let mut nodes: Vec<(PolyRef, Option<usize>)> = vec![(start_ref, None)];
        let mut visited: HashSet<PolyRef> = HashSet::from([start_ref]);
        let mut stack: VecDeque<usize> = VecDeque::from([0]);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = 0;

        let search_pos = vlerp(start_pos, end_pos, 0.5);
        let search_rad = vdist(start_pos, end_pos) * 0.5 + 0.001;
        let search_rad_sqr = search_rad * search_rad;

        while let Some(cur) = stack.pop_front() {
            let cur_ref = nodes[cur].0;
            let (tile, poly) = nav.get_tile_and_poly(cur_ref)?;
            let verts = tile.poly_vertices(poly);
            let nv = verts.len();

            if point_in_polygon(end_pos, &verts) {
                best_node = cur;
                best_pos = *end_pos;
                break;
            }

            let mut j = nv - 1;
            for i in 0..nv {
                let neighbors: Vec<PolyRef> = tile
                    .links_of(poly)
                    .filter(|l| l.edge as usize == j)
                    .filter_map(|l| {
                        let (nt, np) = nav.get_tile_and_poly(l.reference).ok()?;
                        (!np.is_off_mesh() && filter.pass_filter(l.reference, nt, np)).then_some(l.reference)
                    })
                    .collect();

                if neighbors.is_empty() {
                    let (d, t) = distance_pt_seg_sqr_2d(end_pos, &verts[j], &verts[i]);
                    if d < best_dist {
                        best_pos = vlerp(&verts[j], &verts[i], t);
                        best_dist = d;
                        best_node = cur;
                    }
                } else {
                    for nref in neighbors {
                        if visited.contains(&nref) {
                            continue;
                        }
                        let (d, _) = distance_pt_seg_sqr_2d(&search_pos, &verts[j], &verts[i]);
                        if d > search_rad_sqr {
                            continue;
                        }
                        if stack.len() < MOVE_MAX_STACK {
                            visited.insert(nref);
                            nodes.push((nref, Some(cur)));
                            stack.push_back(nodes.len() - 1);
                        }
                    }
                }
                j = i;
            }
        }

        let mut path = Vec::new();
        let mut cur = Some(best_node);
        while let Some(i) = cur {
            path.push(nodes[i].0);
            cur = nodes[i].1;
        }
        path.reverse();
        Ok((best_pos, path))
    }

    /// Dijkstra flood from `start_ref` over polygons whose portals lie
    /// within `radius` of `center`
    pub fn find_polys_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
    ) -> Result<CircleSearchResult> {
        let nav = self.nav_mesh;
        if !nav.is_valid_poly_ref(start_ref) || radius < 0.0 || !radius.is_finite() {
            return Err(Status::InvalidParam);
        }
        self.pool.clear();
        self.open.clear();

        let start = self.pool.get_or_alloc(start_ref).ok_or(Status::OutOfNodes)?;
        {
            let node = self.pool.node_mut(start);
            node.pos = *center;
            node.cost = 0.0;
            node.total = 0.0;
            node.parent = None;
            node.flags = NodeFlags::OPEN;
        }
        self.open.push(start, 0.0);

        let radius_sqr = radius * radius;
        let mut result = CircleSearchResult::default();

        while let Some(best) = self.open.pop(&self.pool) {
            {
                let node = self.pool.node_mut(best);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }
            let best_node = self.pool.node(best).clone();
            let Ok((tile, poly)) = nav.get_tile_and_poly(best_node.poly) else {
                continue;
            };
            let parent_ref = best_node.parent.map(|p| self.pool.node(p).poly);

            result.refs.push(best_node.poly);
            result.parents.push(parent_ref.unwrap_or(PolyRef::NULL));
            result.costs.push(best_node.total);

            for link in tile.links_of(poly) {
                let nref = link.reference;
                if nref.is_null() || Some(nref) == parent_ref {
                    continue;
                }
                let Ok((ntile, npoly)) = nav.get_tile_and_poly(nref) else {
                    continue;
                };
                if !filter.pass_filter(nref, ntile, npoly) {
                    continue;
                }
                let Ok((va, vb)) = self.get_portal_points_of(best_node.poly, tile, poly, nref, ntile, npoly) else {
                    continue;
                };
                if distance_pt_seg_sqr_2d(center, &va, &vb).0 > radius_sqr {
                    continue;
                }
                let Some(nidx) = self.pool.get_or_alloc(nref) else {
                    continue;
                };
                if self.pool.node(nidx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }
                if self.pool.node(nidx).flags == NodeFlags::default() {
                    self.pool.node_mut(nidx).pos = vlerp(&va, &vb, 0.5);
                }
                let npos = self.pool.node(nidx).pos;
                let total = best_node.total + filter.get_cost(&best_node.pos, &npos, best_node.poly, tile, poly);

                let nnode = self.pool.node_mut(nidx);
                if nnode.flags.contains(NodeFlags::OPEN) && total >= nnode.total {
                    continue;
                }
                nnode.parent = Some(best);
                nnode.total = total;
                nnode.cost = total;
                nnode.flags.insert(NodeFlags::OPEN);
                self.open.push(nidx, total);
            }
        }
        Ok(result)
    }

    /// Height of the polygon surface at the xz position of `pos`
    pub fn get_poly_height(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<f32> {
        let (tile, poly) = self.nav_mesh.get_tile_and_poly(reference)?;
        let verts = tile.poly_vertices(poly);
        if poly.is_off_mesh() {
            let t = project_on_segment_2d(pos, &verts[0], &verts[1]);
            return Ok(verts[0][1] + (verts[1][1] - verts[0][1]) * t);
        }
        if !point_in_polygon(pos, &verts) {
            return Err(Status::InvalidParam);
        }
        Ok(tile
            .poly_height(reference.poly_index(), pos)
            .unwrap_or_else(|| closest_point_on_boundary(pos, &verts)[1]))
    }

    /// Closest point on the polygon surface, and whether `pos` is over it
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        self.nav_mesh.closest_point_on_poly(reference, pos)
    }

    /// `pos` itself when it lies over the polygon, otherwise the closest
    /// point on its boundary
    pub fn closest_point_on_poly_boundary(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<[f32; 3]> {
        let (tile, poly) = self.nav_mesh.get_tile_and_poly(reference)?;
        let verts = tile.poly_vertices(poly);
        if poly.is_off_mesh() {
            let t = project_on_segment_2d(pos, &verts[0], &verts[1]);
            return Ok(vlerp(&verts[0], &verts[1], t));
        }
        if point_in_polygon(pos, &verts) {
            return Ok(*pos);
        }
        Ok(closest_point_on_boundary(pos, &verts))
    }

    pub fn get_poly_center(&self, reference: PolyRef) -> Result<[f32; 3]> {
        self.nav_mesh.poly_center(reference)
    }

    /// Boundary segments of the polygon that do not lead to a polygon
    /// accepted by `filter`
    pub fn get_poly_wall_segments(
        &self,
        reference: PolyRef,
        filter: &dyn QueryFilter,
    ) -> Result<Vec<([f32; 3], [f32; 3])>> {
        let nav = self.nav_mesh;
        let (tile, poly) = nav.get_tile_and_poly(reference)?;
        let verts = tile.poly_vertices(poly);
        let nv = verts.len();
        let mut segments = Vec::new();

        for j in 0..nv {
            let va = verts[j];
            let vb = verts[(j + 1) % nv];
            let mut open: Vec<(u8, u8)> = tile
                .links_of(poly)
                .filter(|l| l.edge as usize == j)
                .filter(|l| {
                    nav.get_tile_and_poly(l.reference)
                        .map(|(t, p)| !p.is_off_mesh() && filter.pass_filter(l.reference, t, p))
                        .unwrap_or(false)
                })
                .map(|l| if l.side == LINK_INTERNAL { (0, 255) } else { (l.bmin, l.bmax) })
                .collect();
            open.sort_unstable();

            let mut cursor = 0u8;
            let mut emit = |from: u8, to: u8| {
                if to > from {
                    let s = 1.0 / 255.0;
                    segments.push((
                        vlerp(&va, &vb, from as f32 * s),
                        vlerp(&va, &vb, to as f32 * s),
                    ));
                }
            };
            for (lo, hi) in open {
                emit(cursor, lo);
                cursor = cursor.max(hi);
            }
            emit(cursor, 255);
        }
        Ok(segments)
    }

    /// Left and right end of the portal from `from` into `to`
    pub fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<([f32; 3], [f32; 3])> {
        let (from_tile, from_poly) = self.nav_mesh.get_tile_and_poly(from)?;
        let (to_tile, to_poly) = self.nav_mesh.get_tile_and_poly(to)?;
        self.get_portal_points_of(from, from_tile, from_poly, to, to_tile, to_poly)
    }

    /// Midpoint of the portal between two adjacent polygons
    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (l, r) = self.get_portal_points(from, to)?;
        Ok(vlerp(&l, &r, 0.5))
    }

    fn get_portal_points_of(
        &self,
        from: PolyRef,
        from_tile: &MeshTile,
        from_poly: &Poly,
        to: PolyRef,
        to_tile: &MeshTile,
        to_poly: &Poly,
    ) -> Result<([f32; 3], [f32; 3])> {
        let link = from_tile
            .links_of(from_poly)
            .find(|l| l.reference == to)
            .ok_or(Status::InvalidParam)?;

        if from_poly.is_off_mesh() {
            let v = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
            return Ok((v, v));
        }
        if to_poly.is_off_mesh() {
            let back = to_tile
                .links_of(to_poly)
                .find(|l| l.reference == from)
                .ok_or(Status::InvalidParam)?;
            let v = to_tile.verts[to_poly.verts[back.edge as usize] as usize];
            return Ok((v, v));
        }

        let nv = from_poly.vert_count as usize;
        let v0 = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
        let v1 = from_tile.verts[from_poly.verts[(link.edge as usize + 1) % nv] as usize];
        if link.is_partial() {
            let s = 1.0 / 255.0;
            return Ok((
                vlerp(&v0, &v1, link.bmin as f32 * s),
                vlerp(&v0, &v1, link.bmax as f32 * s),
            ));
        }
        Ok((v0, v1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::strip_nav_mesh;
    use crate::DefaultQueryFilter;
    use approx::assert_relative_eq;

    #[test]
    fn test_find_nearest_poly() {
        let nav = strip_nav_mesh();
        let query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();

        let (r, p) = query.find_nearest_poly(&[5.0, 0.5, 1.0], &[1.0, 2.0, 1.0], &filter).unwrap();
        assert_eq!(r.poly_index(), 2);
        assert_relative_eq!(p[1], 0.0);

        let err = query.find_nearest_poly(&[50.0, 0.0, 50.0], &[1.0; 3], &filter);
        assert_eq!(err, Err(Status::NotFound));
    }

    #[test]
    fn test_find_path_across_strip() {
        let nav = strip_nav_mesh();
        let mut query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();
        let a = nav.poly_ref(0, 0);
        let c = nav.poly_ref(0, 2);

        let res = query.find_path(a, c, &[1.0, 0.0, 1.0], &[5.0, 0.0, 1.0], &filter, 64).unwrap();
        assert_eq!(res.status, Status::Success);
        assert_eq!(res.path, vec![a, nav.poly_ref(0, 1), c]);

        let short = query.find_path(a, c, &[1.0, 0.0, 1.0], &[5.0, 0.0, 1.0], &filter, 2).unwrap();
        assert!(short.is_partial());
        assert_eq!(short.path.len(), 2);

        let same = query.find_path(a, a, &[1.0, 0.0, 1.0], &[1.5, 0.0, 1.0], &filter, 64).unwrap();
        assert_eq!(same.path, vec![a]);

        assert_eq!(
            query.find_path(PolyRef::NULL, c, &[0.0; 3], &[0.0; 3], &filter, 64),
            Err(Status::InvalidParam)
        );
    }

    #[test]
    fn test_straight_path_on_open_strip() {
        let nav = strip_nav_mesh();
        let mut query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let end = [5.0, 0.0, 1.0];
        let path = query
            .find_path(nav.poly_ref(0, 0), nav.poly_ref(0, 2), &start, &end, &filter, 64)
            .unwrap()
            .path;

        let straight = query.find_straight_path(&start, &end, &path, 16).unwrap();
        assert_eq!(straight.points.len(), straight.len() * 3);
        assert_eq!(straight.len(), 2);
        assert_eq!(straight.flags[0], StraightPathFlags::START);
        assert_eq!(straight.flags[1], StraightPathFlags::END);
        assert_eq!(straight.point(1), end);
    }

    #[test]
    fn test_straight_path_keeps_start_and_end_for_one_poly() {
        let nav = strip_nav_mesh();
        let query = NavMeshQuery::new(&nav);
        let p = [1.0, 0.0, 1.0];
        let straight = query.find_straight_path(&p, &p, &[nav.poly_ref(0, 0)], 8).unwrap();
        assert_eq!(straight.len(), 2);
    }

    #[test]
    fn test_raycast() {
        let nav = strip_nav_mesh();
        let query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();
        let start_ref = nav.poly_ref(0, 0);

        let clear = query.raycast(start_ref, &[1.0, 0.0, 1.0], &[5.0, 0.0, 1.0], &filter).unwrap();
        assert!(clear.reached_end());
        assert_eq!(clear.path.len(), 3);

        let blocked = query.raycast(start_ref, &[1.0, 0.0, 1.0], &[8.0, 0.0, 1.0], &filter).unwrap();
        assert!(!blocked.reached_end());
        assert_relative_eq!(blocked.t, 5.0 / 7.0, epsilon = 1e-4);
        assert_eq!(blocked.path.len(), 3);
        assert_relative_eq!(blocked.hit_normal[0].abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_move_along_surface_clamps_to_edge() {
        let nav = strip_nav_mesh();
        let query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();
        let (pos, visited) = query
            .move_along_surface(nav.poly_ref(0, 0), &[1.0, 0.0, 1.0], &[8.0, 0.0, 1.0], &filter)
            .unwrap();
        assert_relative_eq!(pos[0], 6.0, epsilon = 1e-4);
        assert_relative_eq!(pos[2], 1.0, epsilon = 1e-4);
        assert_eq!(visited.first(), Some(&nav.poly_ref(0, 0)));
        assert_eq!(visited.last(), Some(&nav.poly_ref(0, 2)));

        let (inside, _) = query
            .move_along_surface(nav.poly_ref(0, 0), &[1.0, 0.0, 1.0], &[3.0, 0.0, 1.5], &filter)
            .unwrap();
        assert_eq!(inside, [3.0, 0.0, 1.5]);
    }

    #[test]
    fn test_polys_around_circle() {
        let nav = strip_nav_mesh();
        let mut query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();
        let res = query
            .find_polys_around_circle(nav.poly_ref(0, 0), &[1.0, 0.0, 1.0], 1.5, &filter)
            .unwrap();
        assert_eq!(res.refs.len(), 2);
        assert_eq!(res.parents.len(), 2);
        assert_eq!(res.costs.len(), 2);
        assert!(res.parents[0].is_null());
        assert_eq!(res.parents[1], res.refs[0]);
        assert!(res.costs[1] > 0.0);
    }

    #[test]
    fn test_poly_height_and_walls() {
        let nav = strip_nav_mesh();
        let query = NavMeshQuery::new(&nav);
        let filter = DefaultQueryFilter::default();
        let middle = nav.poly_ref(0, 1);

        assert_relative_eq!(query.get_poly_height(middle, &[3.0, 10.0, 1.0]).unwrap(), 0.0);
        assert_eq!(query.get_poly_height(middle, &[9.0, 0.0, 1.0]), Err(Status::InvalidParam));

        assert_eq!(query.get_poly_wall_segments(middle, &filter).unwrap().len(), 2);
        assert_eq!(query.get_poly_wall_segments(nav.poly_ref(0, 0), &filter).unwrap().len(), 3);

        let b = query.closest_point_on_poly_boundary(middle, &[3.0, 0.0, 5.0]).unwrap();
        assert_relative_eq!(b[2], 2.0);
    }
}
