//! Binary and JSON persistence of navigation meshes
//!
//! The binary layout is little endian:
//!
//! ```text
//! magic "NFNM" | version | params | tile count | (byte length, tile record)*
//! ```
//!
//! Links are not stored; they are rebuilt when the tiles are added back to
//! a mesh on load.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use navforge_common::{Error, Result};

use crate::bv_tree::BVNode;
use crate::nav_mesh::{MeshTile, NavMesh, OffMeshLink, Poly, PolyDetail, TileHeader};
use crate::{NavMeshParams, PolyFlags, PolyType, EXT_LINK, MAX_VERTS_PER_POLY};

/// 'NFNM' read as a little endian u32
pub const NAVMESH_MAGIC: u32 = u32::from_le_bytes(*b"NFNM");
pub const NAVMESH_VERSION: u32 = 1;

// Smallest encoded sizes, used to reject impossible counts before allocating
const VERT_SIZE: usize = 12;
const POLY_SIZE: usize = MAX_VERTS_PER_POLY * 4 + 5;
const DETAIL_MESH_SIZE: usize = 16;
const DETAIL_TRI_SIZE: usize = 3;
const BV_NODE_SIZE: usize = 28;
const OFF_MESH_SIZE: usize = 31;

/// Saves and loads [`NavMesh`]es
#[derive(Debug, Clone, Copy, Default)]
pub struct NavMeshSerializer;

impl NavMeshSerializer {
    /// Encodes the whole mesh
    pub fn save(nav_mesh: &NavMesh) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_nav_mesh(&mut out, nav_mesh).map_err(to_error)?;
        Ok(out)
    }

    /// Decodes a mesh written by [`NavMeshSerializer::save`]
    pub fn load(data: &[u8]) -> Result<NavMesh> {
        let mut cursor = Cursor::new(data);
        let (params, tiles) = read_nav_mesh(&mut cursor).map_err(to_error)?;

        let mut nav_mesh = NavMesh::new(params);
        for tile in tiles {
            let (x, z) = (tile.header.x, tile.header.z);
            nav_mesh
                .add_tile(tile)
                .map_err(|s| Error::Serialization(format!("cannot add tile ({}, {}): {}", x, z, s)))?;
        }
        log::debug!(
            "Loaded navigation mesh with {} tiles from {} bytes",
            nav_mesh.tile_count(),
            data.len()
        );
        Ok(nav_mesh)
    }

    pub fn save_to_file<P: AsRef<Path>>(nav_mesh: &NavMesh, path: P) -> Result<()> {
        let data = Self::save(nav_mesh)?;
        fs::write(path.as_ref(), data)?;
        log::info!("Saved navigation mesh to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NavMesh> {
        let data = fs::read(path.as_ref())?;
        Self::load(&data)
    }

    /// Encodes a single tile record
    pub fn write_tile(tile: &MeshTile) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_tile(&mut out, tile).map_err(to_error)?;
        Ok(out)
    }

    /// Decodes a single tile record. The tile comes back without links.
    pub fn read_tile(data: &[u8]) -> Result<MeshTile> {
        read_tile(&mut Cursor::new(data)).map_err(to_error)
    }

    #[cfg(feature = "serialization")]
    pub fn save_json(nav_mesh: &NavMesh) -> Result<String> {
        let snapshot = JsonSnapshot {
            params: *nav_mesh.params(),
            tiles: nav_mesh.tiles().map(|(_, t)| t.clone()).collect(),
        };
        serde_json::to_string(&snapshot).map_err(|e| Error::Serialization(e.to_string()))
    }

    #[cfg(feature = "serialization")]
    pub fn load_json(json: &str) -> Result<NavMesh> {
        let snapshot: JsonSnapshot =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut nav_mesh = NavMesh::new(snapshot.params);
        for tile in snapshot.tiles {
            validate_tile(&tile).map_err(to_error)?;
            nav_mesh
                .add_tile(tile)
                .map_err(|s| Error::Serialization(s.to_string()))?;
        }
        Ok(nav_mesh)
    }
}

#[cfg(feature = "serialization")]
#[derive(serde::Serialize, serde::Deserialize)]
struct JsonSnapshot {
    params: NavMeshParams,
    tiles: Vec<MeshTile>,
}

fn to_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Serialization("unexpected end of data".to_string()),
        _ => Error::Serialization(e.to_string()),
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn write_nav_mesh<W: Write>(w: &mut W, nav_mesh: &NavMesh) -> io::Result<()> {
    w.write_u32::<LittleEndian>(NAVMESH_MAGIC)?;
    w.write_u32::<LittleEndian>(NAVMESH_VERSION)?;

    let params = nav_mesh.params();
    write_vec3(w, &params.origin)?;
    w.write_f32::<LittleEndian>(params.tile_width)?;
    w.write_f32::<LittleEndian>(params.tile_height)?;
    w.write_u32::<LittleEndian>(params.max_tiles as u32)?;
    w.write_u32::<LittleEndian>(params.max_polys_per_tile as u32)?;

    w.write_u32::<LittleEndian>(nav_mesh.tile_count() as u32)?;
    for (_, tile) in nav_mesh.tiles() {
        let mut record = Vec::new();
        write_tile(&mut record, tile)?;
        w.write_u32::<LittleEndian>(record.len() as u32)?;
        w.write_all(&record)?;
    }
    Ok(())
}

fn read_nav_mesh(r: &mut Cursor<&[u8]>) -> io::Result<(NavMeshParams, Vec<MeshTile>)> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != NAVMESH_MAGIC {
        return Err(invalid(format!("wrong magic number {:#010x}", magic)));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != NAVMESH_VERSION {
        return Err(invalid(format!("unsupported version {}", version)));
    }

    let params = NavMeshParams {
        origin: read_vec3(r)?,
        tile_width: r.read_f32::<LittleEndian>()?,
        tile_height: r.read_f32::<LittleEndian>()?,
        max_tiles: r.read_u32::<LittleEndian>()? as usize,
        max_polys_per_tile: r.read_u32::<LittleEndian>()? as usize,
    };
    if !(params.tile_width > 0.0 && params.tile_height > 0.0) {
        return Err(invalid("tile size must be positive"));
    }

    let tile_count = r.read_u32::<LittleEndian>()? as usize;
    if tile_count > params.max_tiles {
        return Err(invalid(format!(
            "{} tiles exceed the limit of {}",
            tile_count, params.max_tiles
        )));
    }
    let mut tiles = Vec::with_capacity(tile_count.min(remaining(r) / 4));
    for _ in 0..tile_count {
        let len = r.read_u32::<LittleEndian>()? as usize;
        if len > remaining(r) {
            return Err(invalid("tile record is truncated"));
        }
        let start = r.position() as usize;
        let record = &r.get_ref()[start..start + len];
        tiles.push(read_tile(&mut Cursor::new(record))?);
        r.set_position((start + len) as u64);
    }
    Ok((params, tiles))
}

fn write_tile<W: Write>(w: &mut W, tile: &MeshTile) -> io::Result<()> {
    let h = &tile.header;
    w.write_i32::<LittleEndian>(h.x)?;
    w.write_i32::<LittleEndian>(h.z)?;
    write_vec3(w, &h.bmin)?;
    write_vec3(w, &h.bmax)?;
    w.write_f32::<LittleEndian>(h.walkable_height)?;
    w.write_f32::<LittleEndian>(h.walkable_radius)?;
    w.write_f32::<LittleEndian>(h.walkable_climb)?;

    for count in [
        tile.verts.len(),
        tile.polys.len(),
        tile.detail_meshes.len(),
        tile.detail_verts.len(),
        tile.detail_tris.len(),
        tile.bv_tree.len(),
        tile.off_mesh_links.len(),
    ] {
        w.write_u32::<LittleEndian>(count as u32)?;
    }

    for v in &tile.verts {
        write_vec3(w, v)?;
    }
    for p in &tile.polys {
        for &v in &p.verts {
            w.write_u16::<LittleEndian>(v)?;
        }
        for &n in &p.neighbors {
            w.write_u16::<LittleEndian>(n)?;
        }
        w.write_u16::<LittleEndian>(p.flags.bits())?;
        w.write_u8(p.vert_count)?;
        w.write_u8(p.area)?;
        w.write_u8(p.poly_type.to_u8())?;
    }
    for d in &tile.detail_meshes {
        w.write_u32::<LittleEndian>(d.vert_base)?;
        w.write_u32::<LittleEndian>(d.vert_count)?;
        w.write_u32::<LittleEndian>(d.tri_base)?;
        w.write_u32::<LittleEndian>(d.tri_count)?;
    }
    for v in &tile.detail_verts {
        write_vec3(w, v)?;
    }
    for t in &tile.detail_tris {
        w.write_all(t)?;
    }
    for n in &tile.bv_tree {
        write_vec3(w, &n.bmin)?;
        write_vec3(w, &n.bmax)?;
        w.write_i32::<LittleEndian>(n.index)?;
    }
    for c in &tile.off_mesh_links {
        write_vec3(w, &c.start)?;
        write_vec3(w, &c.end)?;
        w.write_f32::<LittleEndian>(c.radius)?;
        w.write_u16::<LittleEndian>(c.poly)?;
        w.write_u8(c.bidirectional as u8)?;
        w.write_u32::<LittleEndian>(c.user_id)?;
    }
    Ok(())
}

fn read_tile(r: &mut Cursor<&[u8]>) -> io::Result<MeshTile> {
    let mut header = TileHeader::new(r.read_i32::<LittleEndian>()?, r.read_i32::<LittleEndian>()?);
    header.bmin = read_vec3(r)?;
    header.bmax = read_vec3(r)?;
    header.walkable_height = r.read_f32::<LittleEndian>()?;
    header.walkable_radius = r.read_f32::<LittleEndian>()?;
    header.walkable_climb = r.read_f32::<LittleEndian>()?;

    let mut counts = [0usize; 7];
    for c in counts.iter_mut() {
        *c = r.read_u32::<LittleEndian>()? as usize;
    }
    let [nverts, npolys, ndmeshes, ndverts, ndtris, nbv, noff] = counts;
    let needed = [
        (nverts, VERT_SIZE),
        (npolys, POLY_SIZE),
        (ndmeshes, DETAIL_MESH_SIZE),
        (ndverts, VERT_SIZE),
        (ndtris, DETAIL_TRI_SIZE),
        (nbv, BV_NODE_SIZE),
        (noff, OFF_MESH_SIZE),
    ]
    .iter()
    .fold(0usize, |acc, &(n, size)| acc.saturating_add(n.saturating_mul(size)));
    if needed > remaining(r) {
        return Err(invalid(format!(
            "tile ({}, {}) needs {} bytes, {} left",
            header.x,
            header.z,
            needed,
            remaining(r)
        )));
    }

    let mut tile = MeshTile::new(header);
    tile.verts = (0..nverts).map(|_| read_vec3(r)).collect::<io::Result<_>>()?;

    for _ in 0..npolys {
        let mut verts = [0u16; MAX_VERTS_PER_POLY];
        for v in verts.iter_mut() {
            *v = r.read_u16::<LittleEndian>()?;
        }
        let mut neighbors = [0u16; MAX_VERTS_PER_POLY];
        for n in neighbors.iter_mut() {
            *n = r.read_u16::<LittleEndian>()?;
        }
        let flags = PolyFlags::from_bits_retain(r.read_u16::<LittleEndian>()?);
        let vert_count = r.read_u8()?;
        let area = r.read_u8()?;
        let poly_type = PolyType::from_u8(r.read_u8()?).ok_or_else(|| invalid("unknown polygon type"))?;

        let mut poly = Poly::new(area, poly_type, flags);
        poly.verts = verts;
        poly.neighbors = neighbors;
        poly.vert_count = vert_count;
        tile.polys.push(poly);
    }

    for _ in 0..ndmeshes {
        tile.detail_meshes.push(PolyDetail {
            vert_base: r.read_u32::<LittleEndian>()?,
            vert_count: r.read_u32::<LittleEndian>()?,
            tri_base: r.read_u32::<LittleEndian>()?,
            tri_count: r.read_u32::<LittleEndian>()?,
        });
    }

    tile.detail_verts = (0..ndverts).map(|_| read_vec3(r)).collect::<io::Result<_>>()?;
    for _ in 0..ndtris {
        let mut t = [0u8; 3];
        r.read_exact(&mut t)?;
        tile.detail_tris.push(t);
    }
    for _ in 0..nbv {
        tile.bv_tree.push(BVNode {
            bmin: read_vec3(r)?,
            bmax: read_vec3(r)?,
            index: r.read_i32::<LittleEndian>()?,
        });
    }
    for _ in 0..noff {
        let link = OffMeshLink {
            start: read_vec3(r)?,
            end: read_vec3(r)?,
            radius: r.read_f32::<LittleEndian>()?,
            poly: r.read_u16::<LittleEndian>()?,
            bidirectional: r.read_u8()? != 0,
            user_id: r.read_u32::<LittleEndian>()?,
        };
        tile.off_mesh_links.push(link);
    }
    validate_tile(&tile)?;
    Ok(tile)
}

/// Checks every stored index against the arrays it points into, so a
/// loaded tile can be queried without bounds failures
fn validate_tile(tile: &MeshTile) -> io::Result<()> {
    let npolys = tile.polys.len();
    for poly in &tile.polys {
        let n = poly.vert_count as usize;
        if !(2..=MAX_VERTS_PER_POLY).contains(&n) {
            return Err(invalid(format!("polygon has {} vertices", n)));
        }
        if poly.verts[..n].iter().any(|&v| v as usize >= tile.verts.len()) {
            return Err(invalid("polygon vertex index out of range"));
        }
        // Internal neighbours are stored as index + 1, portals carry EXT_LINK
        let bad_neighbour = poly.neighbors[..n]
            .iter()
            .any(|&nei| nei != 0 && nei & EXT_LINK == 0 && nei as usize > npolys);
        if bad_neighbour {
            return Err(invalid("polygon neighbour index out of range"));
        }
    }

    if tile.detail_meshes.len() < npolys {
        return Err(invalid("missing detail meshes"));
    }
    for d in &tile.detail_meshes {
        let verts_end = d.vert_base as usize + d.vert_count as usize;
        let tris_end = d.tri_base as usize + d.tri_count as usize;
        if verts_end > tile.detail_verts.len() || tris_end > tile.detail_tris.len() {
            return Err(invalid("detail mesh range out of bounds"));
        }
        let tris = &tile.detail_tris[d.tri_base as usize..tris_end];
        if tris.iter().flatten().any(|&v| u32::from(v) >= d.vert_count) {
            return Err(invalid("detail triangle vertex index out of range"));
        }
    }

    let nbv = tile.bv_tree.len();
    for (i, node) in tile.bv_tree.iter().enumerate() {
        // Leaves name a polygon, internal nodes skip forward within the tree
        let in_range = if node.is_leaf() {
            (node.index as usize) < npolys
        } else {
            (1..=nbv - i).contains(&(node.index.unsigned_abs() as usize))
        };
        if !in_range {
            return Err(invalid(format!("bounding volume node {} index {} out of range", i, node.index)));
        }
    }

    if tile.off_mesh_links.iter().any(|c| c.poly as usize >= npolys) {
        return Err(invalid("off-mesh connection polygon out of range"));
    }
    Ok(())
}

fn remaining(r: &Cursor<&[u8]>) -> usize {
    r.get_ref().len().saturating_sub(r.position() as usize)
}

fn write_vec3<W: Write>(w: &mut W, v: &[f32; 3]) -> io::Result<()> {
    for &c in v {
        w.write_f32::<LittleEndian>(c)?;
    }
    Ok(())
}

fn read_vec3<R: Read>(r: &mut R) -> io::Result<[f32; 3]> {
    Ok([
        r.read_f32::<LittleEndian>()?,
        r.read_f32::<LittleEndian>()?,
        r.read_f32::<LittleEndian>()?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::strip_nav_mesh;

    #[test]
    fn test_round_trip_keeps_counts_and_links() {
        let nav = strip_nav_mesh();
        let data = NavMeshSerializer::save(&nav).unwrap();
        assert!(!data.is_empty());

        let loaded = NavMeshSerializer::load(&data).unwrap();
        assert_eq!(loaded.tile_count(), 1);
        let (a, b) = (nav.get_tile(0).unwrap(), loaded.get_tile(0).unwrap());
        assert_eq!(a.poly_count(), b.poly_count());
        assert_eq!(a.vertex_count(), b.vertex_count());
        assert_eq!(a.link_count(), b.link_count());
        assert_eq!(a.detail_tris, b.detail_tris);
    }

    #[test]
    fn test_rejects_garbage() {
        for data in [&[][..], &[0u8; 8][..], &b"NFNM"[..]] {
            let err = NavMeshSerializer::load(data).unwrap_err();
            assert!(matches!(err, Error::Serialization(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_rejects_truncated_tile() {
        let nav = strip_nav_mesh();
        let data = NavMeshSerializer::save(&nav).unwrap();
        let cut = &data[..data.len() - 10];
        assert!(matches!(NavMeshSerializer::load(cut), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_rejects_huge_counts() {
        let nav = strip_nav_mesh();
        let mut record = NavMeshSerializer::write_tile(nav.get_tile(0).unwrap()).unwrap();
        // First count (vertices) follows the 2 coords, 2 bounds and 3 agent floats
        let offset = 8 + 24 + 12;
        record[offset..offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(NavMeshSerializer::read_tile(&record).is_err());
    }

    /// Byte offset of the polygon records in a tile record
    fn polys_offset(tile: &MeshTile) -> usize {
        8 + 24 + 12 + 7 * 4 + tile.verts.len() * VERT_SIZE
    }

    #[test]
    fn test_rejects_out_of_range_polygon_neighbour() {
        let nav = strip_nav_mesh();
        let tile = nav.get_tile(0).unwrap();
        let mut record = NavMeshSerializer::write_tile(tile).unwrap();
        // First neighbour of the first polygon
        let offset = polys_offset(tile) + MAX_VERTS_PER_POLY * 2;
        record[offset..offset + 2].copy_from_slice(&200u16.to_le_bytes());
        assert!(matches!(NavMeshSerializer::read_tile(&record), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_rejects_out_of_range_detail_triangle() {
        let nav = strip_nav_mesh();
        let mut tile = nav.get_tile(0).unwrap().clone();
        tile.detail_tris[0] = [0, 1, 200];
        let record = NavMeshSerializer::write_tile(&tile).unwrap();
        let err = NavMeshSerializer::read_tile(&record).unwrap_err();
        assert!(err.to_string().contains("detail triangle"), "{}", err);
    }

    #[test]
    fn test_rejects_out_of_range_bv_nodes() {
        let nav = strip_nav_mesh();
        let tile = nav.get_tile(0).unwrap();
        assert!(!tile.bv_tree.is_empty());

        let leaf = tile.bv_tree.iter().position(|n| n.is_leaf()).unwrap();
        let mut bad_leaf = tile.clone();
        bad_leaf.bv_tree[leaf].index = 99;

        let mut bad_escape = tile.clone();
        bad_escape.bv_tree[0].index = i32::MIN;

        for broken in [bad_leaf, bad_escape] {
            let record = NavMeshSerializer::write_tile(&broken).unwrap();
            let err = NavMeshSerializer::read_tile(&record).unwrap_err();
            assert!(err.to_string().contains("bounding volume"), "{}", err);
        }
    }

    #[test]
    fn test_tile_record_round_trip() {
        let nav = strip_nav_mesh();
        let tile = nav.get_tile(0).unwrap();
        let record = NavMeshSerializer::write_tile(tile).unwrap();
        let back = NavMeshSerializer::read_tile(&record).unwrap();
        assert_eq!(back.polys.len(), tile.polys.len());
        assert_eq!(back.bv_tree, tile.bv_tree);
        assert_eq!(back.link_count(), 0);
    }
}
