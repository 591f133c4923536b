//! Tile cache with runtime obstacles
//!
//! The cache sits next to a tiled [`NavMesh`]. Adding or removing an
//! obstacle marks every tile whose padded bounds it overlaps as dirty;
//! [`TileCache::update`] then rebuilds dirty tiles from the source geometry
//! with the overlapping obstacles carved out and swaps them into the mesh.
//!
//! Every tile's obstacle-free build is kept as an LZ4-compressed tile
//! record. A dirty tile that no longer has any obstacle on it is restored
//! from that record instead of running the voxel pipeline again.
//!
//! Off-mesh connections that start on a rebuilt tile are remembered and put
//! back after the rebuild. A connection whose start point is carved away
//! stays remembered and returns once the surface under it does.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use navforge_common::math::overlap_bounds;
use navforge_common::{Error, InputGeometry};
use navforge_detour::{
    MeshTile, NavMesh, NavMeshBuildConfig, NavMeshSerializer, OffMeshConnection, OffMeshConnectionBuilder,
    Result, Status, TiledNavMeshBuilder,
};
use navforge_recast::CarveVolume;

use crate::obstacle::{Obstacle, ObstacleId, ObstacleKind, ObstacleState};

type TileCoord = (i32, i32);

/// Obstacle-free build of one tile
#[derive(Debug, Clone)]
enum CachedTile {
    /// The tile has no walkable surface
    Empty,
    /// LZ4-compressed tile record
    Compressed(Vec<u8>),
}

/// Obstacle registry and incremental tile rebuilder
#[derive(Debug, Default)]
pub struct TileCache {
    builder: TiledNavMeshBuilder,
    geometry: InputGeometry,
    obstacles: BTreeMap<ObstacleId, Obstacle>,
    next_id: ObstacleId,
    dirty: VecDeque<TileCoord>,
    dirty_set: HashSet<TileCoord>,
    clean: HashMap<TileCoord, CachedTile>,
    /// Off-mesh connections seen on each rebuilt tile
    off_mesh: HashMap<TileCoord, Vec<OffMeshConnection>>,
    initialized: bool,
}

impl TileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the cache to `nav_mesh`, a tiled mesh built from `geometry`
    /// with `config` over `bmin`..`bmax`. The current tiles of the mesh are
    /// taken as the obstacle-free builds.
    pub fn init(
        &mut self,
        nav_mesh: &NavMesh,
        geometry: &InputGeometry,
        config: &NavMeshBuildConfig,
        bmin: [f32; 3],
        bmax: [f32; 3],
    ) -> navforge_common::Result<()> {
        let mut builder = TiledNavMeshBuilder::new();
        builder.initialize(bmin, bmax, config)?;

        let expected = builder.nav_mesh_params();
        let actual = nav_mesh.params();
        if (expected.tile_width - actual.tile_width).abs() > 1e-4
            || (expected.tile_height - actual.tile_height).abs() > 1e-4
            || (0..3).any(|i| (expected.origin[i] - actual.origin[i]).abs() > 1e-4)
        {
            return Err(Error::NavMeshGeneration(format!(
                "Tile grid of the navigation mesh (origin {:?}, tile {}) does not match the cache (origin {:?}, tile {})",
                actual.origin, actual.tile_width, expected.origin, expected.tile_width
            )));
        }

        let mut clean = HashMap::new();
        for (_, tile) in nav_mesh.tiles() {
            clean.insert((tile.header.x, tile.header.z), compress_tile(tile)?);
        }

        *self = Self {
            builder,
            geometry: geometry.clone(),
            obstacles: BTreeMap::new(),
            next_id: 1,
            dirty: VecDeque::new(),
            dirty_set: HashSet::new(),
            clean,
            off_mesh: HashMap::new(),
            initialized: true,
        };
        log::info!(
            "Tile cache bound to a {}x{} tile grid with {} cached tiles",
            self.builder.tile_count_x(),
            self.builder.tile_count_z(),
            self.clean.len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Adds an upright cylinder obstacle standing on `pos`
    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleId> {
        self.insert_obstacle(ObstacleKind::Cylinder { pos, radius, height })
    }

    /// Adds an axis-aligned box obstacle
    pub fn add_box_obstacle(&mut self, bmin: [f32; 3], bmax: [f32; 3]) -> Result<ObstacleId> {
        self.insert_obstacle(ObstacleKind::Box { bmin, bmax })
    }

    fn insert_obstacle(&mut self, kind: ObstacleKind) -> Result<ObstacleId> {
        if !self.initialized || !kind.is_valid() {
            return Err(Status::InvalidParam);
        }
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).ok_or(Status::BufferTooSmall)?;

        let mut obstacle = Obstacle {
            id,
            kind,
            state: ObstacleState::Pending,
            touched: Vec::new(),
        };
        obstacle.touched = self.touched_tiles(&obstacle);
        for &coord in &obstacle.touched {
            self.mark_dirty(coord);
        }
        if obstacle.touched.is_empty() {
            obstacle.state = ObstacleState::Baked;
        }
        log::debug!("Added obstacle {} touching {} tiles", id, obstacle.touched.len());
        self.obstacles.insert(id, obstacle);
        Ok(id)
    }

    /// Removes an obstacle; the tiles it touched are queued for a rebuild
    pub fn remove_obstacle(&mut self, id: ObstacleId) -> Result<()> {
        let obstacle = self.obstacles.remove(&id).ok_or(Status::InvalidParam)?;
        for &coord in &obstacle.touched {
            self.mark_dirty(coord);
        }
        log::debug!("Removed obstacle {}", id);
        Ok(())
    }

    pub fn get_obstacle(&self, id: ObstacleId) -> Option<&Obstacle> {
        self.obstacles.get(&id)
    }

    pub fn obstacles(&self) -> impl Iterator<Item = &Obstacle> {
        self.obstacles.values()
    }

    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len()
    }

    pub fn dirty_tile_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_tile_dirty(&self, x: i32, z: i32) -> bool {
        self.dirty_set.contains(&(x, z))
    }

    /// Number of tiles with a cached obstacle-free build
    pub fn cached_tile_count(&self) -> usize {
        self.clean.len()
    }

    /// Total size of the compressed tile records
    pub fn cache_size_bytes(&self) -> usize {
        self.clean
            .values()
            .map(|c| match c {
                CachedTile::Empty => 0,
                CachedTile::Compressed(data) => data.len(),
            })
            .sum()
    }

    /// Rebuilds up to `max_tiles` dirty tiles (all of them for `None`) in
    /// queue order and returns how many were processed. A tile whose
    /// rebuild fails is left out of the mesh and still counts as processed.
    pub fn update(&mut self, nav_mesh: &mut NavMesh, max_tiles: Option<usize>) -> Result<usize> {
        if !self.initialized {
            return Err(Status::InvalidParam);
        }
        let limit = max_tiles.unwrap_or(usize::MAX);
        let mut processed = 0;
        while processed < limit {
            let Some(coord) = self.dirty.pop_front() else {
                break;
            };
            self.dirty_set.remove(&coord);
            self.rebuild_tile(nav_mesh, coord);
            processed += 1;
        }

        for obstacle in self.obstacles.values_mut() {
            if obstacle.state == ObstacleState::Pending
                && obstacle.touched.iter().all(|c| !self.dirty_set.contains(c))
            {
                obstacle.state = ObstacleState::Baked;
            }
        }
        if processed > 0 {
            log::info!(
                "Tile cache rebuilt {} tiles, {} still dirty",
                processed,
                self.dirty.len()
            );
        }
        Ok(processed)
    }

    fn mark_dirty(&mut self, coord: TileCoord) {
        if self.dirty_set.insert(coord) {
            self.dirty.push_back(coord);
        }
    }

    /// Tile bounds grown by the build border, unbounded in height
    fn padded_tile_bounds(&self, x: i32, z: i32) -> ([f32; 3], [f32; 3]) {
        let (mut bmin, mut bmax) = self.builder.tile_bounds(x, z);
        let config = self.builder.config();
        let pad = config.tile_border_size() as f32 * config.cell_size;
        bmin[0] -= pad;
        bmin[2] -= pad;
        bmax[0] += pad;
        bmax[2] += pad;
        bmin[1] = f32::MIN;
        bmax[1] = f32::MAX;
        (bmin, bmax)
    }

    fn touched_tiles(&self, obstacle: &Obstacle) -> Vec<TileCoord> {
        let (omin, omax) = obstacle.bounds();
        let (gmin, gmax) = self.builder.bounds();
        let config = self.builder.config();
        let pad = config.tile_border_size() as f32 * config.cell_size;
        if omax[0] < gmin[0] - pad || omin[0] > gmax[0] + pad || omax[2] < gmin[2] - pad || omin[2] > gmax[2] + pad {
            return Vec::new();
        }

        let (x0, z0) = self.builder.tile_coord(omin[0] - pad, omin[2] - pad);
        let (x1, z1) = self.builder.tile_coord(omax[0] + pad, omax[2] + pad);
        let mut out = Vec::new();
        for z in z0..=z1 {
            for x in x0..=x1 {
                let (tmin, tmax) = self.padded_tile_bounds(x, z);
                if overlap_bounds(&omin, &omax, &tmin, &tmax) {
                    out.push((x, z));
                }
            }
        }
        out
    }

    fn volumes_for_tile(&self, x: i32, z: i32) -> Vec<CarveVolume> {
        let (tmin, tmax) = self.padded_tile_bounds(x, z);
        self.obstacles
            .values()
            .filter(|o| {
                let (omin, omax) = o.bounds();
                overlap_bounds(&omin, &omax, &tmin, &tmax)
            })
            .map(Obstacle::volume)
            .collect()
    }

    fn rebuild_tile(&mut self, nav_mesh: &mut NavMesh, (x, z): TileCoord) {
        let volumes = self.volumes_for_tile(x, z);
        let built = if volumes.is_empty() {
            self.clean_tile(x, z)
        } else {
            self.builder.build_tile(&self.geometry, x, z, &volumes)
        };

        if let Some(index) = nav_mesh.tile_index_at(x, z) {
            match nav_mesh.remove_tile(index) {
                Ok(old) => self.remember_off_mesh(x, z, &old),
                Err(status) => log::warn!("Failed to remove tile ({}, {}): {}", x, z, status),
            }
        }
        match built {
            Ok(Some(tile)) => {
                if let Err(status) = nav_mesh.add_tile(tile) {
                    log::warn!("Failed to add rebuilt tile ({}, {}): {}", x, z, status);
                }
            }
            Ok(None) => log::debug!("Tile ({}, {}) has no walkable surface left", x, z),
            Err(e) => log::warn!("Failed to rebuild tile ({}, {}): {}", x, z, e),
        }
        self.restore_off_mesh(nav_mesh, x, z);
    }

    fn remember_off_mesh(&mut self, x: i32, z: i32, tile: &MeshTile) {
        if tile.off_mesh_links.is_empty() {
            return;
        }
        let known = self.off_mesh.entry((x, z)).or_default();
        for link in &tile.off_mesh_links {
            let Some(poly) = tile.polys.get(link.poly as usize) else {
                continue;
            };
            let connection = OffMeshConnection {
                start: link.start,
                end: link.end,
                radius: link.radius,
                area: poly.area,
                flags: poly.flags,
                bidirectional: link.bidirectional,
                user_id: link.user_id,
            };
            if !known.contains(&connection) {
                known.push(connection);
            }
        }
    }

    /// Re-adds the remembered connections of a tile that are not in the
    /// mesh. Ones that cannot be placed yet are kept for a later rebuild.
    fn restore_off_mesh(&self, nav_mesh: &mut NavMesh, x: i32, z: i32) {
        let Some(known) = self.off_mesh.get(&(x, z)) else {
            return;
        };
        for connection in known {
            if has_off_mesh_link(nav_mesh, connection) {
                continue;
            }
            if let Err(status) = OffMeshConnectionBuilder::add_connection(nav_mesh, connection) {
                log::debug!(
                    "Off-mesh connection at {:?} not restored on tile ({}, {}): {}",
                    connection.start,
                    x,
                    z,
                    status
                );
            }
        }
    }

    /// Number of off-mesh connections kept for rebuilt tiles
    pub fn remembered_off_mesh_count(&self) -> usize {
        self.off_mesh.values().map(Vec::len).sum()
    }

    /// Obstacle-free tile, from the cache when present
    fn clean_tile(&mut self, x: i32, z: i32) -> navforge_common::Result<Option<MeshTile>> {
        match self.clean.get(&(x, z)) {
            Some(CachedTile::Empty) => return Ok(None),
            Some(CachedTile::Compressed(data)) => return decompress_tile(data).map(Some),
            None => {}
        }

        let tile = self.builder.build_tile(&self.geometry, x, z, &[])?;
        let cached = match &tile {
            Some(t) => compress_tile(t)?,
            None => CachedTile::Empty,
        };
        self.clean.insert((x, z), cached);
        Ok(tile)
    }
}

fn has_off_mesh_link(nav_mesh: &NavMesh, connection: &OffMeshConnection) -> bool {
    nav_mesh.tiles().any(|(_, tile)| {
        tile.off_mesh_links
            .iter()
            .any(|l| l.start == connection.start && l.end == connection.end && l.user_id == connection.user_id)
    })
}

fn compress_tile(tile: &MeshTile) -> navforge_common::Result<CachedTile> {
    let record = NavMeshSerializer::write_tile(tile)?;
    Ok(CachedTile::Compressed(lz4_flex::compress_prepend_size(&record)))
}

fn decompress_tile(data: &[u8]) -> navforge_common::Result<MeshTile> {
    let record = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Serialization(format!("LZ4 decompression failed: {}", e)))?;
    NavMeshSerializer::read_tile(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use navforge_detour::test_geometry::flat_plane;

    fn setup() -> (TileCache, NavMesh) {
        let geom = flat_plane(20.0).unwrap();
        let config = NavMeshBuildConfig::default();
        let (bmin, bmax) = (geom.bmin().into(), geom.bmax().into());
        let mut builder = TiledNavMeshBuilder::new();
        builder.initialize(bmin, bmax, &config).unwrap();
        let nav = builder.build_all(&geom).nav_mesh.unwrap();

        let mut cache = TileCache::new();
        cache.init(&nav, &geom, &config, bmin, bmax).unwrap();
        (cache, nav)
    }

    #[test]
    fn test_uninitialized_rejects_obstacles() {
        let mut cache = TileCache::new();
        assert_eq!(cache.add_obstacle([0.0; 3], 1.0, 2.0), Err(Status::InvalidParam));
        let mut nav = NavMesh::new(Default::default());
        assert_eq!(cache.update(&mut nav, None), Err(Status::InvalidParam));
    }

    #[test]
    fn test_init_seeds_clean_cache() {
        let (cache, nav) = setup();
        assert!(cache.is_initialized());
        assert_eq!(cache.cached_tile_count(), nav.tile_count());
        assert!(cache.cache_size_bytes() > 0);
        assert_eq!(cache.obstacle_count(), 0);
        assert_eq!(cache.dirty_tile_count(), 0);
    }

    #[test]
    fn test_init_rejects_mismatched_grid() {
        let (_, nav) = setup();
        let geom = flat_plane(20.0).unwrap();
        let config = NavMeshBuildConfig {
            tile_size: 16,
            ..Default::default()
        };
        let mut cache = TileCache::new();
        assert!(cache
            .init(&nav, &geom, &config, geom.bmin().into(), geom.bmax().into())
            .is_err());
        assert!(!cache.is_initialized());
    }

    #[test]
    fn test_ids_start_at_one_and_grow() {
        let (mut cache, _) = setup();
        let a = cache.add_obstacle([0.0; 3], 1.0, 2.0).unwrap();
        let b = cache.add_box_obstacle([2.0, 0.0, 2.0], [3.0, 2.0, 3.0]).unwrap();
        assert_eq!((a, b), (1, 2));
        cache.remove_obstacle(a).unwrap();
        assert_eq!(cache.add_obstacle([0.0; 3], 1.0, 2.0).unwrap(), 3);
        assert_eq!(cache.remove_obstacle(0), Err(Status::InvalidParam));
        assert_eq!(cache.remove_obstacle(a), Err(Status::InvalidParam));
    }

    #[test]
    fn test_obstacle_outside_grid_is_baked() {
        let (mut cache, _) = setup();
        let id = cache.add_obstacle([500.0, 0.0, 500.0], 1.0, 2.0).unwrap();
        assert_eq!(cache.dirty_tile_count(), 0);
        assert_eq!(cache.get_obstacle(id).unwrap().state, ObstacleState::Baked);
    }

    #[test]
    fn test_dirty_queue_has_no_duplicates() {
        let (mut cache, _) = setup();
        cache.add_obstacle([0.0, 0.0, 0.0], 0.5, 2.0).unwrap();
        let first = cache.dirty_tile_count();
        cache.add_obstacle([0.1, 0.0, 0.1], 0.5, 2.0).unwrap();
        assert_eq!(cache.dirty_tile_count(), first);
    }

    #[test]
    fn test_restore_from_cache_matches_original() {
        let (mut cache, mut nav) = setup();
        let (x, z) = (1, 1);
        let before = nav.get_tile_at(x, z).unwrap().clone();
        let id = cache.add_obstacle([0.0, 0.0, 0.0], 1.0, 2.0).unwrap();
        cache.update(&mut nav, None).unwrap();
        cache.remove_obstacle(id).unwrap();
        cache.update(&mut nav, None).unwrap();

        let after = nav.get_tile_at(x, z).unwrap();
        assert_eq!(after.polys.len(), before.polys.len());
        assert_eq!(after.verts, before.verts);
        assert_eq!(after.detail_tris, before.detail_tris);
    }
}
