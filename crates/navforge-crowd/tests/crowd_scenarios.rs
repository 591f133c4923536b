use navforge_common::math::vdist_2d;
use navforge_crowd::{
    draw_agents, AgentParams, AgentState, CrowdManager, MoveRequestState, PathCorridor, UpdateFlags, DEFAULT_MAX_PATH,
    MAX_AGENTS,
};
use navforge_detour::test_geometry::{flat_plane, platforms_with_gap};
use navforge_detour::{
    DefaultQueryFilter, NavMesh, NavMeshBuildConfig, NavMeshBuilder, NavMeshQuery, OffMeshConnection,
    OffMeshConnectionBuilder, StraightPathFlags, TiledNavMeshBuilder,
};
use navforge_tilecache::TileCache;

const DT: f32 = 0.1;
const EXTENTS: [f32; 3] = [2.0, 4.0, 2.0];

fn build_plane(size: f32) -> NavMesh {
    let geom = flat_plane(size).unwrap();
    let result = NavMeshBuilder::build_single(&geom, &NavMeshBuildConfig::default());
    assert!(result.success, "{:?}", result.error_message);
    result.nav_mesh.unwrap()
}

/// Tiled 20 x 20 plane and a tile cache bound to it
fn tiled_plane_with_cache() -> (NavMesh, TileCache) {
    let geom = flat_plane(20.0).unwrap();
    let config = NavMeshBuildConfig::default();
    let (bmin, bmax) = (geom.bmin().into(), geom.bmax().into());
    let mut builder = TiledNavMeshBuilder::new();
    builder.initialize(bmin, bmax, &config).unwrap();
    let result = builder.build_all(&geom);
    assert!(result.success, "{:?}", result.error_message);
    let nav = result.nav_mesh.unwrap();

    let mut cache = TileCache::new();
    cache.init(&nav, &geom, &config, bmin, bmax).unwrap();
    (nav, cache)
}

/// Slot of the tile whose bounds hold `pos` in xz
fn tile_under(nav: &NavMesh, pos: [f32; 3]) -> usize {
    nav.tiles()
        .find(|(_, t)| {
            let (bmin, bmax) = (t.header.bmin, t.header.bmax);
            pos[0] >= bmin[0] && pos[0] <= bmax[0] && pos[2] >= bmin[2] && pos[2] <= bmax[2]
        })
        .map(|(i, _)| i)
        .unwrap()
}

#[test]
fn test_new_crowd_is_empty() {
    let nav = build_plane(10.0);
    let crowd = CrowdManager::new(&nav);
    assert_eq!(crowd.max_agents(), MAX_AGENTS);
    assert_eq!(crowd.active_agent_count(), 0);
    assert!(crowd.get_agent(0).is_none());
    assert!(draw_agents(&crowd).is_empty());
}

#[test]
fn test_add_and_remove_agent() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::new(&nav);

    let idx = crowd.add_agent([1.0, 0.0, 1.0], AgentParams::default()).unwrap();
    assert_eq!(crowd.active_agent_count(), 1);
    let agent = crowd.get_agent(idx).unwrap();
    assert!(agent.active);
    assert_eq!(agent.state, AgentState::Idle);
    assert_eq!(agent.target_state, MoveRequestState::None);
    assert!(!agent.corridor.first_poly().is_null());

    assert!(crowd.remove_agent(idx));
    assert_eq!(crowd.active_agent_count(), 0);
    assert!(crowd.get_agent(idx).is_none());
    assert!(!crowd.remove_agent(idx));
    assert!(!crowd.request_move_position(idx, [2.0, 0.0, 2.0]));
    assert!(!crowd.request_move_position(MAX_AGENTS + 5, [2.0, 0.0, 2.0]));
}

#[test]
fn test_full_crowd_rejects_agents() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::with_capacity(&nav, 2);
    crowd.add_agent([-1.0, 0.0, 0.0], AgentParams::default()).unwrap();
    crowd.add_agent([1.0, 0.0, 0.0], AgentParams::default()).unwrap();
    assert!(crowd.add_agent([0.0, 0.0, 2.0], AgentParams::default()).is_err());

    // Freed slots are reused
    assert!(crowd.remove_agent(0));
    assert_eq!(crowd.add_agent([0.0, 0.0, 2.0], AgentParams::default()), Ok(0));
}

#[test]
fn test_zero_time_step_is_a_no_op() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::new(&nav);
    let idx = crowd.add_agent([-3.0, 0.0, 0.0], AgentParams::default()).unwrap();
    let start = crowd.get_agent(idx).unwrap().pos;

    assert!(crowd.request_move_position(idx, [3.0, 0.0, 0.0]));
    crowd.update(0.0);
    crowd.update(-1.0);
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Pending);
    assert_eq!(agent.state, AgentState::Idle);
    assert_eq!(agent.pos, start);

    crowd.update(DT);
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Valid);
    assert_eq!(agent.state, AgentState::Walking);
}

#[test]
fn test_agent_reaches_target_without_speeding() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::new(&nav);
    let params = AgentParams::default();
    let max_speed = params.max_speed;
    let idx = crowd.add_agent([-3.0, 0.0, -1.0], params).unwrap();
    let target = [3.0, 0.0, 2.0];
    assert!(crowd.request_move_position(idx, target));

    let mut arrived = false;
    for _ in 0..300 {
        crowd.update(DT);
        let agent = crowd.get_agent(idx).unwrap();
        assert!(agent.speed() <= max_speed + 1e-3, "speed {}", agent.speed());
        if agent.state == AgentState::Idle {
            arrived = true;
            break;
        }
    }
    assert!(arrived);
    let agent = crowd.get_agent(idx).unwrap();
    assert!(vdist_2d(&agent.pos, &target) < 0.2, "{:?}", agent.pos);
    assert_eq!(agent.speed(), 0.0);
}

#[test]
fn test_unreachable_request_fails() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::new(&nav);
    let idx = crowd.add_agent([0.0, 0.0, 0.0], AgentParams::default()).unwrap();
    assert!(crowd.request_move_position(idx, [100.0, 0.0, 100.0]));
    crowd.update(DT);
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Failed);
    assert_eq!(agent.state, AgentState::Idle);
}

#[test]
fn test_separation_pushes_agents_apart() {
    let nav = build_plane(12.0);
    let mut crowd = CrowdManager::new(&nav);
    let params = AgentParams {
        update_flags: UpdateFlags::SEPARATION,
        ..Default::default()
    };
    let a = crowd.add_agent([-4.0, 0.0, -0.4], params.clone()).unwrap();
    let b = crowd.add_agent([-4.0, 0.0, 0.4], params).unwrap();
    crowd.request_move_position(a, [4.0, 0.0, -0.4]);
    crowd.request_move_position(b, [4.0, 0.0, 0.4]);

    let before = vdist_2d(&crowd.get_agent(a).unwrap().pos, &crowd.get_agent(b).unwrap().pos);
    for _ in 0..5 {
        crowd.update(DT);
    }
    let pa = crowd.get_agent(a).unwrap().pos;
    let pb = crowd.get_agent(b).unwrap().pos;
    assert!(vdist_2d(&pa, &pb) > before);
    assert!(pa[2] < -0.4 && pb[2] > 0.4);
}

#[test]
fn test_agent_crosses_off_mesh_connection() {
    let geom = platforms_with_gap(6.0, 2.0, 0.0).unwrap();
    let result = NavMeshBuilder::build_single(&geom, &NavMeshBuildConfig::default());
    assert!(result.success, "{:?}", result.error_message);
    let mut nav = result.nav_mesh.unwrap();
    let jump = OffMeshConnection::new([-2.0, 0.0, 0.0], [2.0, 0.0, 0.0], 1.0, true);
    OffMeshConnectionBuilder::add_connection(&mut nav, &jump).unwrap();

    let mut crowd = CrowdManager::new(&nav);
    let idx = crowd.add_agent([-4.0, 0.0, 0.0], AgentParams::default()).unwrap();
    let target = [4.0, 0.0, 0.0];
    crowd.request_move_position(idx, target);

    let mut jumped = false;
    for _ in 0..400 {
        crowd.update(DT);
        let agent = crowd.get_agent(idx).unwrap();
        jumped |= agent.state == AgentState::OffMesh;
        if jumped && agent.state == AgentState::Idle {
            break;
        }
    }
    let agent = crowd.get_agent(idx).unwrap();
    assert!(jumped);
    assert_eq!(agent.state, AgentState::Idle);
    assert!(vdist_2d(&agent.pos, &target) < 0.2, "{:?}", agent.pos);
}

#[test]
fn test_draw_agents_marks_each_agent() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::new(&nav);
    crowd.add_agent([0.0, 0.0, 0.0], AgentParams::default()).unwrap();
    let one = draw_agents(&crowd);
    assert!(one.len() >= 4);
    assert_eq!(one.len() % 2, 0);

    crowd.add_agent([2.0, 0.0, 2.0], AgentParams::default()).unwrap();
    assert!(draw_agents(&crowd).len() >= one.len() * 2);
}

#[test]
fn test_corridor_follows_agent_across_polygons() {
    let nav = build_plane(10.0);
    let filter = DefaultQueryFilter::default();
    let mut query = NavMeshQuery::new(&nav);
    let sp = [-4.0, 0.0, -4.0];
    let ep = [4.0, 0.0, 4.0];
    let (start, sp) = query.find_nearest_poly(&sp, &EXTENTS, &filter).unwrap();
    let (end, ep) = query.find_nearest_poly(&ep, &EXTENTS, &filter).unwrap();
    let path = query.find_path(start, end, &sp, &ep, &filter, 256).unwrap();

    let mut corridor = PathCorridor::default();
    corridor.reset(start, sp);
    assert!(corridor.is_valid(8, &nav, &filter));
    corridor.set_corridor(ep, &path.path);
    assert_eq!(corridor.first_poly(), start);
    assert_eq!(corridor.last_poly(), end);

    let corners = corridor.find_corners(&query, 4).unwrap();
    assert!(!corners.is_empty());
    assert!(corners.last().unwrap().flags.contains(StraightPathFlags::END) || corners.len() == 4);

    // Step along the corridor until the agent stands on the last polygon
    for _ in 0..200 {
        let pos = corridor.pos();
        let dx = ep[0] - pos[0];
        let dz = ep[2] - pos[2];
        let len = (dx * dx + dz * dz).sqrt();
        if len < 0.05 {
            break;
        }
        let step = len.min(0.25) / len;
        let wanted = [pos[0] + dx * step, pos[1], pos[2] + dz * step];
        corridor.move_position(&wanted, &query, &filter).unwrap();
    }
    assert_eq!(corridor.path_count(), 1);
    assert_eq!(corridor.first_poly(), end);
    assert!(corridor.is_at_target(0.1));
}

#[test]
fn test_agents_replan_after_tile_rebuild() {
    let (mut nav, mut cache) = tiled_plane_with_cache();
    let filter = DefaultQueryFilter::default();
    let target = [6.0, 0.0, 0.5];

    let mut crowd = CrowdManager::new(&nav);
    let idx = crowd.add_agent([-6.0, 0.0, 0.5], AgentParams::default()).unwrap();
    crowd.request_move_position(idx, target);
    for _ in 0..3 {
        crowd.update(DT);
    }
    let walked = crowd.get_agent(idx).unwrap().clone();
    assert_eq!(walked.state, AgentState::Walking);
    assert!(walked.corridor.is_valid(DEFAULT_MAX_PATH, &nav, &filter));
    let detached = crowd.detach();

    // A wall across the corridor rebuilds the tiles it runs through
    cache.add_box_obstacle([-1.0, -1.0, -3.0], [1.0, 2.0, 3.0]).unwrap();
    cache.update(&mut nav, None).unwrap();
    assert!(!walked.corridor.is_valid(DEFAULT_MAX_PATH, &nav, &filter));
    assert!(!nav.is_valid_poly_ref(walked.current_poly()));

    let mut crowd = CrowdManager::attach(&nav, detached);
    crowd.update(DT);
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Valid);
    assert_eq!(agent.state, AgentState::Walking);
    assert!(agent.corridor.is_valid(DEFAULT_MAX_PATH, &nav, &filter));

    let mut arrived = false;
    for _ in 0..600 {
        crowd.update(DT);
        if crowd.get_agent(idx).unwrap().state == AgentState::Idle {
            arrived = true;
            break;
        }
    }
    assert!(arrived);
    let agent = crowd.get_agent(idx).unwrap();
    assert!(vdist_2d(&agent.pos, &target) < 0.3, "{:?}", agent.pos);
}

#[test]
fn test_agent_on_removed_tile_fails_its_request() {
    let (mut nav, _) = tiled_plane_with_cache();
    let start = [-6.0, 0.0, 0.5];

    let mut crowd = CrowdManager::new(&nav);
    let idx = crowd.add_agent(start, AgentParams::default()).unwrap();
    crowd.request_move_position(idx, [6.0, 0.0, 0.5]);
    crowd.update(DT);
    let corridor = crowd.get_agent(idx).unwrap().corridor.clone();
    let detached = crowd.detach();

    let slot = tile_under(&nav, start);
    nav.remove_tile(slot).unwrap();
    assert!(!corridor.is_valid(DEFAULT_MAX_PATH, &nav, &DefaultQueryFilter::default()));

    let mut crowd = CrowdManager::attach(&nav, detached);
    crowd.update(DT);
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Failed);
    assert_eq!(agent.state, AgentState::Idle);
    assert!(agent.current_poly().is_null());
}

#[test]
fn test_removed_agent_slot_is_reset() {
    let nav = build_plane(10.0);
    let mut crowd = CrowdManager::with_capacity(&nav, 1);
    let idx = crowd.add_agent([1.0, 0.0, 1.0], AgentParams::default()).unwrap();
    crowd.request_move_position(idx, [3.0, 0.0, 3.0]);
    crowd.update(DT);
    assert!(crowd.remove_agent(idx));
    assert_eq!(crowd.active_agent_count(), 0);
    assert!(crowd.agents().next().is_none());

    let again = crowd.add_agent([-1.0, 0.0, -1.0], AgentParams::default()).unwrap();
    assert_eq!(again, idx);
    let agent = crowd.get_agent(again).unwrap();
    assert_eq!(agent.state, AgentState::Idle);
    assert_eq!(agent.target_state, MoveRequestState::None);
}
