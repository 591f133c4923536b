//! Crowd simulation on navforge navigation meshes
//!
//! [`CrowdManager`] moves a pool of agents over a [`NavMesh`](navforge_detour::NavMesh).
//! Each agent follows a [`PathCorridor`], keeps its distance from its
//! neighbours and picks a collision-free velocity with
//! [`ObstacleAvoidanceQuery`].
//!
//! ```rust,ignore
//! let mut crowd = CrowdManager::new(&nav_mesh);
//! let agent = crowd.add_agent([0.0, 0.0, 0.0], AgentParams::default())?;
//! crowd.request_move_position(agent, [5.0, 0.0, 3.0]);
//! for _ in 0..100 {
//!     crowd.update(0.1);
//! }
//! let lines = draw_agents(&crowd);
//! ```

mod crowd;
mod obstacle_avoidance;
mod path_corridor;
mod proximity_grid;

pub use crowd::{
    draw_agents, AgentParams, AgentState, CrowdAgent, CrowdManager, DetachedCrowd, MoveRequestState, UpdateFlags,
    MAX_AGENTS, MAX_AVOIDANCE_PARAMS, MAX_CORNERS, MAX_NEIGHBOURS,
};
pub use obstacle_avoidance::{
    ObstacleAvoidanceParams, ObstacleAvoidanceQuery, ObstacleCircle, ObstacleSegment, DEFAULT_MAX_CIRCLES,
    DEFAULT_MAX_SEGMENTS,
};
pub use path_corridor::{Corner, PathCorridor, DEFAULT_MAX_PATH};
pub use proximity_grid::ProximityGrid;
