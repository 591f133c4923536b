//! Crowd of agents steering along path corridors
//!
//! Each tick of [`CrowdManager::update`] runs the same stages in order:
//! corridors that no longer match the mesh are repaired, pending move
//! requests are planned, neighbours are gathered from the
//! proximity grid, corridors are shortened and string-pulled into corners,
//! a desired velocity is steered towards the next corner, separation and
//! local avoidance adjust it, and the result is integrated and constrained
//! back onto the navigation mesh.

use bitflags::bitflags;
use log::{debug, warn};
use navforge_common::debug::{push_circle, push_cross, push_line, Color, DebugVertex};
use navforge_common::math::{vdist_2d, vlerp};
use navforge_detour::{
    distance_pt_seg_sqr_2d, DefaultQueryFilter, NavMesh, NavMeshQuery, PolyRef, QueryFilter, Result, Status,
    StraightPathFlags,
};

use crate::obstacle_avoidance::{ObstacleAvoidanceParams, ObstacleAvoidanceQuery};
use crate::path_corridor::{Corner, PathCorridor, DEFAULT_MAX_PATH};
use crate::proximity_grid::ProximityGrid;

/// Agent slots in a crowd
pub const MAX_AGENTS: usize = 128;

/// Neighbours considered for separation and avoidance
pub const MAX_NEIGHBOURS: usize = 6;

/// Corners looked ahead along the corridor
pub const MAX_CORNERS: usize = 4;

/// Avoidance parameter slots, see [`CrowdManager::set_obstacle_avoidance_params`]
pub const MAX_AVOIDANCE_PARAMS: usize = 4;

/// Agents within this distance of their target stop
const ARRIVAL_DIST: f32 = 0.1;

/// Corridor polygons checked against the mesh every tick
const CHECK_LOOK_AHEAD: usize = 10;

const MIN_SPEED: f32 = 1e-4;

bitflags! {
    /// Per-agent behaviours run by [`CrowdManager::update`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct UpdateFlags: u8 {
        /// Round corners instead of heading straight at them
        const ANTICIPATE_TURNS = 0x01;
        const OBSTACLE_AVOIDANCE = 0x02;
        const SEPARATION = 0x04;
        /// Shortcut the corridor when the next corners are visible
        const OPTIMIZE_VIS = 0x08;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self::ANTICIPATE_TURNS | Self::OBSTACLE_AVOIDANCE | Self::SEPARATION | Self::OPTIMIZE_VIS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum AgentState {
    /// Slot without a live agent
    #[default]
    Invalid,
    /// Standing still
    Idle,
    /// Following its corridor
    Walking,
    /// Crossing an off-mesh connection
    OffMesh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MoveRequestState {
    #[default]
    None,
    /// Waiting to be planned on the next non-zero update
    Pending,
    Valid,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Neighbours and walls closer than this are considered when steering
    pub collision_query_range: f32,
    /// Look-ahead distance for corridor shortcuts
    pub path_optimization_range: f32,
    /// Strength of the push away from nearby agents
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index into the crowd's avoidance parameter slots
    pub obstacle_avoidance_type: usize,
}

impl Default for AgentParams {
    fn default() -> Self {
        let radius = 0.6;
        Self {
            radius,
            height: 2.0,
            max_acceleration: 8.0,
            max_speed: 3.5,
            collision_query_range: radius * 12.0,
            path_optimization_range: radius * 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OffMeshAnim {
    init_pos: [f32; 3],
    start: [f32; 3],
    end: [f32; 3],
    t: f32,
    t_mid: f32,
    t_max: f32,
}

#[derive(Debug, Clone)]
pub struct CrowdAgent {
    pub active: bool,
    pub state: AgentState,
    pub target_state: MoveRequestState,
    pub params: AgentParams,
    pub pos: [f32; 3],
    pub vel: [f32; 3],
    /// Velocity requested by path following and separation
    pub desired_vel: [f32; 3],
    /// Velocity chosen by local avoidance
    pub new_vel: [f32; 3],
    pub target_pos: [f32; 3],
    pub target_ref: PolyRef,
    pub corridor: PathCorridor,
    pub corners: Vec<Corner>,
    pub neighbours: Vec<usize>,
    anim: Option<OffMeshAnim>,
}

impl CrowdAgent {
    fn new(pos: [f32; 3], params: AgentParams) -> Self {
        Self {
            active: true,
            state: AgentState::Idle,
            target_state: MoveRequestState::None,
            params,
            pos,
            vel: [0.0; 3],
            desired_vel: [0.0; 3],
            new_vel: [0.0; 3],
            target_pos: pos,
            target_ref: PolyRef::NULL,
            corridor: PathCorridor::new(DEFAULT_MAX_PATH),
            corners: Vec::new(),
            neighbours: Vec::new(),
            anim: None,
        }
    }

    /// Clears every field and marks the agent inactive
    pub fn reset(&mut self) {
        self.active = false;
        self.state = AgentState::Invalid;
        self.target_state = MoveRequestState::None;
        self.pos = [0.0; 3];
        self.target_pos = [0.0; 3];
        self.target_ref = PolyRef::NULL;
        self.corridor.reset(PolyRef::NULL, [0.0; 3]);
        self.neighbours.clear();
        self.anim = None;
        self.stop();
    }

    /// Advances the position by the current velocity. Speed limits are
    /// applied by the crowd before this is called.
    pub fn integrate(&mut self, dt: f32) {
        for (p, v) in self.pos.iter_mut().zip(self.vel) {
            *p += v * dt;
        }
    }

    /// Polygon the agent stands on, null when it is off the mesh
    pub fn current_poly(&self) -> PolyRef {
        self.corridor.first_poly()
    }

    /// Horizontal speed
    pub fn speed(&self) -> f32 {
        (self.vel[0] * self.vel[0] + self.vel[2] * self.vel[2]).sqrt()
    }

    fn placement_extents(&self) -> [f32; 3] {
        [
            self.params.radius * 2.0,
            self.params.height.max(self.params.radius * 1.5),
            self.params.radius * 2.0,
        ]
    }

    fn stop(&mut self) {
        self.vel = [0.0; 3];
        self.desired_vel = [0.0; 3];
        self.new_vel = [0.0; 3];
        self.corners.clear();
    }
}

/// Agents and settings of a crowd, detached from its navigation mesh so the
/// mesh can be changed
#[derive(Debug, Clone)]
pub struct DetachedCrowd {
    agents: Vec<Option<CrowdAgent>>,
    filter: DefaultQueryFilter,
    avoidance_params: [ObstacleAvoidanceParams; MAX_AVOIDANCE_PARAMS],
}

impl DetachedCrowd {
    pub fn max_agents(&self) -> usize {
        self.agents.len()
    }
}

/// Fixed pool of agents moving over one navigation mesh
pub struct CrowdManager<'a> {
    nav_mesh: &'a NavMesh,
    query: NavMeshQuery<'a>,
    filter: DefaultQueryFilter,
    agents: Vec<Option<CrowdAgent>>,
    grid: ProximityGrid,
    avoidance: ObstacleAvoidanceQuery,
    avoidance_params: [ObstacleAvoidanceParams; MAX_AVOIDANCE_PARAMS],
}

impl<'a> CrowdManager<'a> {
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self::with_capacity(nav_mesh, MAX_AGENTS)
    }

    pub fn with_capacity(nav_mesh: &'a NavMesh, max_agents: usize) -> Self {
        Self {
            nav_mesh,
            query: NavMeshQuery::new(nav_mesh),
            filter: DefaultQueryFilter::default(),
            agents: vec![None; max_agents],
            grid: ProximityGrid::new(AgentParams::default().radius * 3.0),
            avoidance: ObstacleAvoidanceQuery::default(),
            avoidance_params: [
                ObstacleAvoidanceParams::low(),
                ObstacleAvoidanceParams::medium(),
                ObstacleAvoidanceParams::good(),
                ObstacleAvoidanceParams::high(),
            ],
        }
    }

    /// Releases the navigation mesh and keeps the agents. Corridors that
    /// point at tiles rebuilt or removed in the meantime are repaired on the
    /// first update after [`CrowdManager::attach`].
    pub fn detach(self) -> DetachedCrowd {
        DetachedCrowd {
            agents: self.agents,
            filter: self.filter,
            avoidance_params: self.avoidance_params,
        }
    }

    /// Puts detached agents on `nav_mesh`
    pub fn attach(nav_mesh: &'a NavMesh, crowd: DetachedCrowd) -> Self {
        let mut manager = Self::with_capacity(nav_mesh, crowd.agents.len());
        manager.agents = crowd.agents;
        manager.filter = crowd.filter;
        manager.avoidance_params = crowd.avoidance_params;
        manager
    }

    pub fn max_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents.iter().flatten().filter(|a| a.active).count()
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    pub fn filter(&self) -> &DefaultQueryFilter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut DefaultQueryFilter {
        &mut self.filter
    }

    pub fn obstacle_avoidance_params(&self, index: usize) -> Option<&ObstacleAvoidanceParams> {
        self.avoidance_params.get(index)
    }

    pub fn set_obstacle_avoidance_params(&mut self, index: usize, params: ObstacleAvoidanceParams) -> bool {
        match self.avoidance_params.get_mut(index) {
            Some(slot) => {
                *slot = params;
                true
            }
            None => false,
        }
    }

    /// Places a new agent on the mesh near `pos` and returns its slot.
    /// An agent that cannot be placed on the mesh is still added and fails
    /// its move requests while it stays off the mesh.
    pub fn add_agent(&mut self, pos: [f32; 3], params: AgentParams) -> Result<usize> {
        if !pos.iter().all(|c| c.is_finite())
            || !params.radius.is_finite()
            || params.radius <= 0.0
            || params.max_speed.is_nan()
            || params.max_speed < 0.0
        {
            return Err(Status::InvalidParam);
        }
        let slot = self
            .agents
            .iter()
            .position(|a| a.as_ref().map_or(true, |a| !a.active))
            .ok_or(Status::BufferTooSmall)?;

        let mut agent = CrowdAgent::new(pos, params);
        let ext = agent.placement_extents();
        match self.query.find_nearest_poly(&pos, &ext, &self.filter) {
            Ok((reference, nearest)) => {
                agent.pos = nearest;
                agent.target_pos = nearest;
                agent.corridor.reset(reference, nearest);
            }
            Err(status) => {
                warn!("agent {slot} placed off the navigation mesh at {pos:?}: {status}");
                agent.corridor.reset(PolyRef::NULL, pos);
            }
        }
        self.agents[slot] = Some(agent);
        Ok(slot)
    }

    /// Resets the agent and frees its slot; false if it held no agent
    pub fn remove_agent(&mut self, index: usize) -> bool {
        match self.get_agent_mut(index) {
            Some(agent) => {
                agent.reset();
                true
            }
            None => false,
        }
    }

    /// Active agent in slot `index`
    pub fn get_agent(&self, index: usize) -> Option<&CrowdAgent> {
        self.agents.get(index)?.as_ref().filter(|a| a.active)
    }

    pub fn get_agent_mut(&mut self, index: usize) -> Option<&mut CrowdAgent> {
        self.agents.get_mut(index)?.as_mut().filter(|a| a.active)
    }

    /// Active agents with their slots
    pub fn agents(&self) -> impl Iterator<Item = (usize, &CrowdAgent)> {
        self.agents
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().filter(|a| a.active).map(|a| (i, a)))
    }

    /// Asks agent `index` to walk to `target`. The path is planned on the
    /// next update with a non-zero time step.
    pub fn request_move_position(&mut self, index: usize, target: [f32; 3]) -> bool {
        if !target.iter().all(|c| c.is_finite()) {
            return false;
        }
        let Some(agent) = self.get_agent_mut(index) else {
            return false;
        };
        agent.target_pos = target;
        agent.target_ref = PolyRef::NULL;
        agent.target_state = MoveRequestState::Pending;
        true
    }

    /// Drops the current move request and stops the agent
    pub fn reset_move_target(&mut self, index: usize) -> bool {
        let Some(agent) = self.get_agent_mut(index) else {
            return false;
        };
        agent.target_state = MoveRequestState::None;
        agent.target_ref = PolyRef::NULL;
        let (first, pos) = (agent.corridor.first_poly(), agent.pos);
        agent.corridor.reset(first, pos);
        if agent.state == AgentState::Walking {
            agent.state = AgentState::Idle;
        }
        agent.stop();
        true
    }

    /// Advances the simulation by `dt` seconds. A non-positive or
    /// non-finite `dt` leaves every agent untouched.
    pub fn update(&mut self, dt: f32) {
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }
        let slots: Vec<usize> = self.agents().map(|(i, _)| i).collect();

        self.check_path_validity(&slots);
        self.process_move_requests(&slots);
        self.update_neighbours(&slots);
        self.update_corners(&slots);
        self.trigger_off_mesh_connections(&slots);
        self.steer(&slots);
        self.separate(&slots);
        self.avoid(&slots);
        self.integrate(&slots, dt);
        self.move_along_corridors(&slots);
        self.animate_off_mesh(&slots, dt);
        self.detect_arrival(&slots);
    }

    /// Re-places agents whose current polygon is gone and replans corridors
    /// that run through stale polygons
    fn check_path_validity(&mut self, slots: &[usize]) {
        let nav = self.nav_mesh;
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state == AgentState::OffMesh {
                continue;
            }

            let first = agent.corridor.first_poly();
            let on_mesh = nav
                .get_tile_and_poly(first)
                .map_or(false, |(tile, poly)| self.filter.pass_filter(first, tile, poly));
            if !on_mesh {
                let ext = agent.placement_extents();
                match self.query.find_nearest_poly(&agent.pos, &ext, &self.filter) {
                    Ok((reference, nearest)) => {
                        debug!("agent {i}: moved back onto polygon {reference}");
                        agent.pos = nearest;
                        agent.corridor.reset(reference, nearest);
                    }
                    Err(_) => agent.corridor.reset(PolyRef::NULL, agent.pos),
                }
                agent.corners.clear();
                if agent.target_state == MoveRequestState::Valid {
                    agent.target_state = MoveRequestState::Pending;
                }
                continue;
            }

            if agent.target_state == MoveRequestState::Valid
                && !agent.corridor.is_valid(CHECK_LOOK_AHEAD, nav, &self.filter)
            {
                debug!("agent {i}: corridor is stale, replanning");
                agent.target_state = MoveRequestState::Pending;
            }
        }
    }

    fn process_move_requests(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.target_state != MoveRequestState::Pending {
                continue;
            }
            let start_ref = agent.corridor.first_poly();
            let ext = agent.placement_extents();
            let planned = if start_ref.is_null() {
                Err(Status::InvalidParam)
            } else {
                plan_path(&mut self.query, &self.filter, start_ref, &agent.pos, &agent.target_pos, &ext)
            };

            match planned {
                Ok((target_ref, target, path)) => {
                    debug!("agent {i}: planned {} polygons to {target:?}", path.len());
                    agent.target_ref = target_ref;
                    agent.target_pos = target;
                    agent.corridor.set_corridor(target, &path);
                    agent.target_state = MoveRequestState::Valid;
                    if agent.state == AgentState::Idle {
                        agent.state = AgentState::Walking;
                    }
                }
                Err(status) => {
                    debug!("agent {i}: move request failed: {status}");
                    agent.target_state = MoveRequestState::Failed;
                    if agent.state == AgentState::Walking {
                        agent.state = AgentState::Idle;
                    }
                    agent.stop();
                }
            }
        }
    }

    fn update_neighbours(&mut self, slots: &[usize]) {
        self.grid.clear();
        for &i in slots {
            if let Some(agent) = self.agents[i].as_ref() {
                self.grid.add_item(i, &agent.pos, agent.params.radius);
            }
        }

        for &i in slots {
            let Some(agent) = self.agents[i].as_ref() else {
                continue;
            };
            let (pos, range, height) = (agent.pos, agent.params.collision_query_range, agent.params.height);
            let mut found: Vec<(f32, usize)> = self
                .grid
                .query_items(&pos, range)
                .into_iter()
                .filter(|&j| j != i)
                .filter_map(|j| {
                    let other = self.agents[j].as_ref()?;
                    if (other.pos[1] - pos[1]).abs() > (height + other.params.height) * 0.5 {
                        return None;
                    }
                    let d = vdist_2d(&pos, &other.pos);
                    (d < range).then_some((d, j))
                })
                .collect();
            found.sort_by(|a, b| a.0.total_cmp(&b.0));
            found.truncate(MAX_NEIGHBOURS);

            if let Some(agent) = self.agents[i].as_mut() {
                agent.neighbours = found.into_iter().map(|(_, j)| j).collect();
            }
        }
    }

    fn update_corners(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state != AgentState::Walking {
                agent.corners.clear();
                continue;
            }
            agent.corners = agent.corridor.find_corners(&self.query, MAX_CORNERS).unwrap_or_default();

            if agent.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !agent.corners.is_empty() {
                let next = agent.corners[1.min(agent.corners.len() - 1)].pos;
                let range = agent.params.path_optimization_range;
                if let Ok(true) = agent.corridor.optimize_path_visibility(&next, range, &self.query, &self.filter) {
                    agent.corners = agent.corridor.find_corners(&self.query, MAX_CORNERS).unwrap_or_default();
                }
            }
        }
    }

    fn trigger_off_mesh_connections(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state != AgentState::Walking {
                continue;
            }
            let Some(last) = agent.corners.last().copied() else {
                continue;
            };
            if !last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION) {
                continue;
            }
            let trigger = agent.params.radius * 2.25;
            if vdist_2d(&agent.pos, &last.pos) > trigger {
                continue;
            }
            let init_pos = agent.pos;
            if let Some((start, end)) = agent.corridor.move_over_off_mesh_connection(last.poly, self.nav_mesh) {
                let speed = agent.params.max_speed.max(MIN_SPEED);
                let t_mid = vdist_2d(&init_pos, &start) / speed;
                agent.anim = Some(OffMeshAnim {
                    init_pos,
                    start,
                    end,
                    t: 0.0,
                    t_mid,
                    t_max: t_mid + vdist_2d(&start, &end) / speed,
                });
                agent.state = AgentState::OffMesh;
                agent.stop();
                debug!("agent {i}: crossing off-mesh connection {}", last.poly);
            }
        }
    }

    fn steer(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state != AgentState::Walking || agent.corners.is_empty() {
                agent.desired_vel = [0.0; 3];
                continue;
            }
            let dir = if agent.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                smooth_steer_dir(&agent.pos, &agent.corners)
            } else {
                straight_steer_dir(&agent.pos, &agent.corners)
            };

            // Slow down when approaching the end of the corridor
            let slow_down = agent.params.radius * 2.0;
            let mut scale = 1.0;
            if let Some(last) = agent.corners.last() {
                if last.flags.contains(StraightPathFlags::END) {
                    scale = (vdist_2d(&agent.pos, &last.pos) / slow_down).min(1.0);
                }
            }
            let speed = agent.params.max_speed * scale;
            agent.desired_vel = [dir[0] * speed, 0.0, dir[2] * speed];
        }
    }

    fn separate(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_ref() else {
                continue;
            };
            if agent.state != AgentState::Walking
                || !agent.params.update_flags.contains(UpdateFlags::SEPARATION)
                || agent.params.separation_weight <= 0.0
            {
                continue;
            }

            let mut disp = [0.0f32; 3];
            let mut count = 0.0f32;
            for &j in &agent.neighbours {
                let Some(other) = self.agents[j].as_ref() else {
                    continue;
                };
                let diff = [agent.pos[0] - other.pos[0], 0.0, agent.pos[2] - other.pos[2]];
                let dist_sqr = diff[0] * diff[0] + diff[2] * diff[2];
                // Separation reaches out to twice the combined radius
                let range = (agent.params.radius + other.params.radius) * 2.0;
                if dist_sqr < 1e-5 || dist_sqr > range * range {
                    continue;
                }
                let dist = dist_sqr.sqrt();
                let weight = agent.params.separation_weight * (1.0 - (dist / range) * (dist / range));
                disp[0] += diff[0] * weight / dist;
                disp[2] += diff[2] * weight / dist;
                count += 1.0;
            }
            if count == 0.0 {
                continue;
            }

            let desired_speed = vlen_2d(&agent.desired_vel);
            let mut dvel = agent.desired_vel;
            dvel[0] += disp[0] / count;
            dvel[2] += disp[2] / count;
            // Separation may turn the agent but never speed it up
            let speed = vlen_2d(&dvel);
            if speed > desired_speed && speed > 0.0 {
                let s = desired_speed / speed;
                dvel[0] *= s;
                dvel[2] *= s;
            }
            if let Some(agent) = self.agents[i].as_mut() {
                agent.desired_vel = dvel;
            }
        }
    }

    fn avoid(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_ref() else {
                continue;
            };
            let walking = agent.state == AgentState::Walking;
            if !walking || !agent.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                let dvel = agent.desired_vel;
                if let Some(agent) = self.agents[i].as_mut() {
                    agent.new_vel = dvel;
                }
                continue;
            }

            self.avoidance.reset();
            for &j in &agent.neighbours {
                if let Some(other) = self.agents[j].as_ref() {
                    self.avoidance.add_circle(&other.pos, other.params.radius, &other.vel, &other.desired_vel);
                }
            }
            let first = agent.corridor.first_poly();
            if !first.is_null() {
                let range = agent.params.collision_query_range;
                let mut walls = collect_walls(&mut self.query, &self.filter, first, &agent.pos, range);
                walls.sort_by(|a, b| a.0.total_cmp(&b.0));
                for (_, p, q) in &walls {
                    self.avoidance.add_segment(p, q);
                }
            }

            let params = self
                .avoidance_params
                .get(agent.params.obstacle_avoidance_type)
                .copied()
                .unwrap_or_default();
            let (new_vel, _) = self.avoidance.sample_velocity_adaptive(
                &agent.pos,
                agent.params.radius,
                agent.params.max_speed,
                &agent.vel,
                &agent.desired_vel,
                &params,
            );
            if let Some(agent) = self.agents[i].as_mut() {
                agent.new_vel = new_vel;
            }
        }
    }

    fn integrate(&mut self, slots: &[usize], dt: f32) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state != AgentState::Walking {
                continue;
            }
            let max_delta = agent.params.max_acceleration * dt;
            let mut dv = [agent.new_vel[0] - agent.vel[0], 0.0, agent.new_vel[2] - agent.vel[2]];
            let ds = vlen_2d(&dv);
            if ds > max_delta && ds > 0.0 {
                dv[0] *= max_delta / ds;
                dv[2] *= max_delta / ds;
            }
            agent.vel[0] += dv[0];
            agent.vel[2] += dv[2];
            agent.vel[1] = 0.0;

            let speed = agent.speed();
            if speed > agent.params.max_speed {
                let s = agent.params.max_speed / speed;
                agent.vel[0] *= s;
                agent.vel[2] *= s;
            }
            if agent.speed() > MIN_SPEED {
                agent.integrate(dt);
            } else {
                agent.vel = [0.0; 3];
            }
        }
    }

    fn move_along_corridors(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state != AgentState::Walking {
                continue;
            }
            let wanted = agent.pos;
            match agent.corridor.move_position(&wanted, &self.query, &self.filter) {
                Ok(pos) => agent.pos = pos,
                Err(status) => {
                    warn!("agent {i}: could not move along corridor: {status}");
                    agent.pos = agent.corridor.pos();
                    agent.vel = [0.0; 3];
                }
            }
        }
    }

    fn animate_off_mesh(&mut self, slots: &[usize], dt: f32) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            let Some(anim) = agent.anim.as_mut() else {
                continue;
            };
            anim.t += dt;
            if anim.t >= anim.t_max {
                agent.pos = anim.end;
                agent.anim = None;
                agent.state = AgentState::Walking;
                continue;
            }
            agent.pos = if anim.t < anim.t_mid {
                vlerp(&anim.init_pos, &anim.start, anim.t / anim.t_mid)
            } else {
                let span = (anim.t_max - anim.t_mid).max(f32::EPSILON);
                vlerp(&anim.start, &anim.end, (anim.t - anim.t_mid) / span)
            };
        }
    }

    fn detect_arrival(&mut self, slots: &[usize]) {
        for &i in slots {
            let Some(agent) = self.agents[i].as_mut() else {
                continue;
            };
            if agent.state == AgentState::Walking && agent.corridor.is_at_target(ARRIVAL_DIST) {
                debug!("agent {i}: arrived at {:?}", agent.corridor.target());
                agent.state = AgentState::Idle;
                agent.target_state = MoveRequestState::None;
                agent.stop();
            }
        }
    }
}

/// Resolves the target polygon and searches a corridor to it. Partial
/// paths end at the closest reachable point of their last polygon.
fn plan_path(
    query: &mut NavMeshQuery,
    filter: &DefaultQueryFilter,
    start_ref: PolyRef,
    start_pos: &[f32; 3],
    target: &[f32; 3],
    ext: &[f32; 3],
) -> Result<(PolyRef, [f32; 3], Vec<PolyRef>)> {
    let (target_ref, target_pos) = query.find_nearest_poly(target, ext, filter)?;
    let found = query.find_path(start_ref, target_ref, start_pos, &target_pos, filter, DEFAULT_MAX_PATH)?;
    let last = *found.path.last().ok_or(Status::NotFound)?;
    let target_pos = if found.is_partial() {
        query.closest_point_on_poly(last, &target_pos)?.0
    } else {
        target_pos
    };
    Ok((target_ref, target_pos, found.path))
}

/// Wall segments of polygons around `pos` within `range`, with their
/// squared distance to `pos`
fn collect_walls(
    query: &mut NavMeshQuery,
    filter: &DefaultQueryFilter,
    start_ref: PolyRef,
    pos: &[f32; 3],
    range: f32,
) -> Vec<(f32, [f32; 3], [f32; 3])> {
    let Ok(around) = query.find_polys_around_circle(start_ref, pos, range, filter) else {
        return Vec::new();
    };
    let mut walls = Vec::new();
    for reference in around.refs {
        let Ok(segments) = query.get_poly_wall_segments(reference, filter) else {
            continue;
        };
        for (p, q) in segments {
            let (d, _) = distance_pt_seg_sqr_2d(pos, &p, &q);
            if d <= range * range {
                walls.push((d, p, q));
            }
        }
    }
    walls
}

fn vlen_2d(v: &[f32; 3]) -> f32 {
    (v[0] * v[0] + v[2] * v[2]).sqrt()
}

fn normalize_2d(v: [f32; 3]) -> [f32; 3] {
    let len = vlen_2d(&v);
    if len > 1e-6 {
        [v[0] / len, 0.0, v[2] / len]
    } else {
        [0.0; 3]
    }
}

fn straight_steer_dir(pos: &[f32; 3], corners: &[Corner]) -> [f32; 3] {
    let c = corners[0].pos;
    normalize_2d([c[0] - pos[0], 0.0, c[2] - pos[2]])
}

/// Heads at the first corner while leaning away from the second so the
/// agent rounds the turn
fn smooth_steer_dir(pos: &[f32; 3], corners: &[Corner]) -> [f32; 3] {
    let p0 = corners[0].pos;
    let p1 = corners[1.min(corners.len() - 1)].pos;
    let dir0 = [p0[0] - pos[0], 0.0, p0[2] - pos[2]];
    let dir1 = normalize_2d([p1[0] - pos[0], 0.0, p1[2] - pos[2]]);
    let len0 = vlen_2d(&dir0);
    normalize_2d([dir0[0] - dir1[0] * len0 * 0.5, 0.0, dir0[2] - dir1[2] * len0 * 0.5])
}

/// Debug lines for every active agent: a cross at its position, its radius,
/// and a line along its velocity
pub fn draw_agents(crowd: &CrowdManager) -> Vec<DebugVertex> {
    let mut out = Vec::new();
    for (_, agent) in crowd.agents() {
        let color = match agent.state {
            AgentState::Invalid => Color::RED,
            AgentState::Idle => Color::GRAY,
            AgentState::Walking => Color::GREEN,
            AgentState::OffMesh => Color::ORANGE,
        };
        let r = agent.params.radius;
        let p = agent.pos;
        push_cross(&mut out, p, r * 0.5, color);
        push_circle(&mut out, p, r, 12, color);
        if agent.speed() > MIN_SPEED {
            push_line(&mut out, p, [p[0] + agent.vel[0], p[1], p[2] + agent.vel[2]], Color::YELLOW);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn corner(x: f32, z: f32) -> Corner {
        Corner {
            pos: [x, 0.0, z],
            flags: StraightPathFlags::empty(),
            poly: PolyRef::NULL,
        }
    }

    #[test]
    fn test_default_params() {
        let params = AgentParams::default();
        assert!(params.update_flags.contains(UpdateFlags::SEPARATION));
        assert!(params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE));
        assert!(params.obstacle_avoidance_type < MAX_AVOIDANCE_PARAMS);
    }

    #[test]
    fn test_agent_integrate_is_unclamped() {
        let params = AgentParams::default();
        let mut agent = CrowdAgent::new([1.0, 2.0, 3.0], params.clone());
        agent.vel = [params.max_speed * 10.0, 1.0, -2.0];
        agent.integrate(0.5);
        assert_relative_eq!(agent.pos[0], 1.0 + params.max_speed * 5.0, epsilon = 1e-5);
        assert_relative_eq!(agent.pos[1], 2.5, epsilon = 1e-5);
        assert_relative_eq!(agent.pos[2], 2.0, epsilon = 1e-5);

        agent.integrate(0.0);
        assert_relative_eq!(agent.pos[2], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_agent_reset_clears_state() {
        let mut agent = CrowdAgent::new([1.0, 0.0, 1.0], AgentParams::default());
        agent.state = AgentState::Walking;
        agent.target_state = MoveRequestState::Valid;
        agent.vel = [1.0, 0.0, 1.0];
        agent.corners.push(corner(2.0, 2.0));
        agent.neighbours.push(3);
        agent.corridor.reset(PolyRef::new(1, 0, 4), [1.0, 0.0, 1.0]);

        agent.reset();
        assert!(!agent.active);
        assert_eq!(agent.state, AgentState::Invalid);
        assert_eq!(agent.target_state, MoveRequestState::None);
        assert_eq!(agent.pos, [0.0; 3]);
        assert_eq!(agent.vel, [0.0; 3]);
        assert_eq!(agent.speed(), 0.0);
        assert!(agent.corners.is_empty() && agent.neighbours.is_empty());
        assert!(agent.current_poly().is_null());
        assert_eq!(agent.corridor.path_count(), 0);
    }

    #[test]
    fn test_straight_steer_dir() {
        let dir = straight_steer_dir(&[0.0; 3], &[corner(3.0, 4.0)]);
        assert_relative_eq!(dir[0], 0.6, epsilon = 1e-5);
        assert_relative_eq!(dir[2], 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_smooth_steer_leans_away_from_turn() {
        let corners = [corner(4.0, 0.0), corner(4.0, 4.0)];
        let dir = smooth_steer_dir(&[0.0; 3], &corners);
        // Heading is still mostly forward but bends away from the next corner
        assert!(dir[0] > 0.5);
        assert!(dir[2] < 0.0);
        let single = smooth_steer_dir(&[0.0; 3], &corners[..1]);
        assert_relative_eq!(single[0], 1.0, epsilon = 1e-5);
    }
}
