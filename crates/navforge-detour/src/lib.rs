//! Runtime navigation meshes and queries
//!
//! A [`NavMesh`] is a grid of [`MeshTile`]s built from Recast polygon meshes
//! by [`NavMeshBuilder`] or [`TiledNavMeshBuilder`]. Polygons are addressed
//! by [`PolyRef`] handles that stay valid until their tile is removed.
//! [`NavMeshQuery`] runs nearest-polygon lookups, A* searches (regular and
//! sliced), string pulling, raycasts and local surface moves over a mesh.

mod bv_tree;
pub mod debug_draw;
mod geometry;
mod nav_mesh;
mod nav_mesh_builder;
mod nav_mesh_query;
mod node_pool;
mod off_mesh;
mod query_filter;
mod serializer;
mod sliced;
mod status;
pub mod test_geometry;

pub use bv_tree::BVNode;
pub use geometry::{
    closest_height_point_triangle, distance_pt_seg_sqr_2d, intersect_segment_poly_2d,
    point_in_polygon, SegmentPolyHit,
};
pub use nav_mesh::{
    Link, MeshTile, NavMesh, OffMeshLink, Poly, PolyDetail, PolyVerts, TileHeader,
};
pub use nav_mesh_builder::{
    create_tile, BuildStats, NavMeshBuildConfig, NavMeshBuildResult, NavMeshBuilder, TiledNavMeshBuildResult,
    TiledNavMeshBuilder,
};
pub use nav_mesh_query::{
    CircleSearchResult, NavMeshQuery, PathResult, RaycastHit, StraightPath, StraightPathFlags,
};
pub use off_mesh::{OffMeshConnection, OffMeshConnectionBuilder, OFF_MESH_DEFAULT_AREA};
pub use query_filter::{DefaultQueryFilter, QueryFilter, QueryFilterClone};
pub use serializer::{NavMeshSerializer, NAVMESH_MAGIC, NAVMESH_VERSION};
pub use sliced::SlicedStatus;
pub use status::{Result, Status};

use bitflags::bitflags;

/// Maximum vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 6;
/// Neighbour flag for edges that continue into another tile; the low bits
/// hold the direction (0: -x, 1: +z, 2: +x, 3: -z)
pub const EXT_LINK: u16 = 0x8000;
/// Link side value for links inside one tile
pub const LINK_INTERNAL: u8 = 0xff;
/// Link edge value for links that enter an off-mesh connection
pub const OFF_MESH_EDGE: u8 = 0xff;
/// Number of area ids with a configurable traversal cost
pub const MAX_AREAS: usize = 64;

const POLY_BITS: u32 = 24;
const TILE_BITS: u32 = 20;
const SALT_BITS: u32 = 16;
const POLY_MASK: u64 = (1 << POLY_BITS) - 1;
const TILE_MASK: u64 = (1 << TILE_BITS) - 1;
const SALT_MASK: u64 = (1 << SALT_BITS) - 1;

/// Handle to one polygon of a [`NavMesh`].
///
/// Encodes the tile slot, the polygon index inside the tile and the tile's
/// salt at the time the handle was issued. A handle whose salt no longer
/// matches its tile slot refers to a removed tile and is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyRef(u64);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    pub fn new(salt: u32, tile_index: u32, poly_index: u32) -> Self {
        Self(
            ((salt as u64 & SALT_MASK) << (POLY_BITS + TILE_BITS))
                | ((tile_index as u64 & TILE_MASK) << POLY_BITS)
                | (poly_index as u64 & POLY_MASK),
        )
    }

    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn salt(&self) -> u32 {
        ((self.0 >> (POLY_BITS + TILE_BITS)) & SALT_MASK) as u32
    }

    pub fn tile_index(&self) -> usize {
        ((self.0 >> POLY_BITS) & TILE_MASK) as usize
    }

    pub fn poly_index(&self) -> usize {
        (self.0 & POLY_MASK) as usize
    }

    /// True for any non-null handle; use [`NavMesh::is_valid_poly_ref`] to
    /// check it against a mesh
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.tile_index(), self.poly_index(), self.salt())
    }
}

bitflags! {
    /// Per-polygon ability flags consulted by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct PolyFlags: u16 {
        const WALK = 0x01;
        const SWIM = 0x02;
        const DOOR = 0x04;
        const JUMP = 0x08;
        const DISABLED = 0x10;
        const ALL = 0xffff;
    }
}

/// Kind of polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PolyType {
    #[default]
    Ground,
    /// Two-vertex polygon joining the start and end of an off-mesh connection
    OffMeshConnection,
}

impl PolyType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PolyType::Ground => 0,
            PolyType::OffMeshConnection => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PolyType::Ground),
            1 => Some(PolyType::OffMeshConnection),
            _ => None,
        }
    }
}

/// Layout of the tile grid
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshParams {
    /// World position of the grid origin (tile 0, 0)
    pub origin: [f32; 3],
    pub tile_width: f32,
    pub tile_height: f32,
    pub max_tiles: usize,
    pub max_polys_per_tile: usize,
}

impl Default for NavMeshParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            tile_width: 1.0,
            tile_height: 1.0,
            max_tiles: 1,
            max_polys_per_tile: 1 << POLY_BITS,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::nav_mesh::{MeshTile, NavMesh, Poly, PolyDetail, TileHeader};
    use crate::{NavMeshParams, PolyFlags, PolyType};

    /// Single tile holding three 2x2 quads in a row along +x, from x 0 to 6
    pub fn strip_nav_mesh() -> NavMesh {
        let mut tile = MeshTile::new(TileHeader {
            x: 0,
            z: 0,
            bmin: [0.0, -1.0, 0.0],
            bmax: [6.0, 1.0, 2.0],
            walkable_height: 2.0,
            walkable_radius: 0.5,
            walkable_climb: 0.5,
        });
        for i in 0..4 {
            let x = i as f32 * 2.0;
            tile.verts.push([x, 0.0, 0.0]);
            tile.verts.push([x, 0.0, 2.0]);
        }
        for i in 0..3u16 {
            let mut poly = Poly::new(63, PolyType::Ground, PolyFlags::WALK);
            poly.vert_count = 4;
            poly.verts[..4].copy_from_slice(&[2 * i, 2 * i + 1, 2 * i + 3, 2 * i + 2]);
            poly.neighbors[0] = if i > 0 { i } else { 0 };
            poly.neighbors[2] = if i < 2 { i + 2 } else { 0 };
            tile.polys.push(poly);

            let base = tile.detail_verts.len() as u32;
            for &v in &[2 * i, 2 * i + 1, 2 * i + 3, 2 * i + 2] {
                tile.detail_verts.push(tile.verts[v as usize]);
            }
            tile.detail_meshes.push(PolyDetail {
                vert_base: base,
                vert_count: 4,
                tri_base: tile.detail_tris.len() as u32,
                tri_count: 2,
            });
            tile.detail_tris.push([0, 1, 2]);
            tile.detail_tris.push([0, 2, 3]);
        }

        let mut nav = NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: 6.0,
            tile_height: 6.0,
            max_tiles: 1,
            max_polys_per_tile: 16,
        });
        nav.add_tile(tile).expect("strip tile");
        nav
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poly_ref_fields() {
        let r = PolyRef::new(3, 17, 4242);
        assert_eq!(r.salt(), 3);
        assert_eq!(r.tile_index(), 17);
        assert_eq!(r.poly_index(), 4242);
        assert!(r.is_valid());
        assert!(PolyRef::NULL.is_null());
        assert!(!PolyRef::NULL.is_valid());
    }

    #[test]
    fn test_poly_ref_with_salt_is_never_null() {
        assert!(PolyRef::new(1, 0, 0).is_valid());
        assert_ne!(PolyRef::new(1, 0, 0), PolyRef::new(2, 0, 0));
    }

    #[test]
    fn test_poly_type_roundtrip() {
        for t in [PolyType::Ground, PolyType::OffMeshConnection] {
            assert_eq!(PolyType::from_u8(t.to_u8()), Some(t));
        }
        assert_eq!(PolyType::from_u8(9), None);
    }
}
