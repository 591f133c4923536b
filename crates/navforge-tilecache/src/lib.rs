//! Runtime obstacles for tiled navigation meshes
//!
//! [`TileCache`] keeps a registry of cylinder and box obstacles next to a
//! tiled [`NavMesh`](navforge_detour::NavMesh). Changes to the registry mark
//! the affected tiles dirty; each call to [`TileCache::update`] rebuilds a
//! bounded number of them so the cost can be spread over frames.
//!
//! ```rust,ignore
//! let mut cache = TileCache::new();
//! cache.init(&nav_mesh, &geometry, &config, bmin, bmax)?;
//! let id = cache.add_obstacle([2.0, 0.0, 3.0], 1.0, 2.0)?;
//! while cache.dirty_tile_count() > 0 {
//!     cache.update(&mut nav_mesh, Some(1))?;
//! }
//! cache.remove_obstacle(id)?;
//! ```

mod obstacle;
mod tile_cache;

pub use obstacle::{Obstacle, ObstacleId, ObstacleKind, ObstacleState};
pub use tile_cache::TileCache;
