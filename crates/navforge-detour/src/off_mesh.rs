//! Off-mesh connections added to an existing navigation mesh

use crate::nav_mesh::{NavMesh, OffMeshLink};
use crate::{PolyFlags, PolyRef, Result, Status};

/// Area id given to connection polygons unless set otherwise
pub const OFF_MESH_DEFAULT_AREA: u8 = 63;

/// Jump, ladder or teleport between two points of the mesh
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshConnection {
    pub start: [f32; 3],
    pub end: [f32; 3],
    /// Search radius for the polygons the end points attach to
    pub radius: f32,
    pub area: u8,
    pub flags: PolyFlags,
    pub bidirectional: bool,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn new(start: [f32; 3], end: [f32; 3], radius: f32, bidirectional: bool) -> Self {
        Self {
            start,
            end,
            radius,
            area: OFF_MESH_DEFAULT_AREA,
            flags: PolyFlags::WALK,
            bidirectional,
            user_id: 0,
        }
    }
}

/// Adds off-mesh connection polygons to the tiles holding their start points
#[derive(Debug, Clone, Copy, Default)]
pub struct OffMeshConnectionBuilder;

impl OffMeshConnectionBuilder {
    /// Adds one connection. Both end points must lie within `radius` of a
    /// ground polygon; otherwise the mesh is left untouched and
    /// [`Status::NotFound`] is returned.
    pub fn add_connection(nav_mesh: &mut NavMesh, connection: &OffMeshConnection) -> Result<PolyRef> {
        if !(connection.radius > 0.0) {
            return Err(Status::InvalidParam);
        }
        let extents = [connection.radius, connection.radius.max(1.0), connection.radius];
        let (start_ref, _) = nav_mesh
            .nearest_ground_poly(&connection.start, &extents)
            .ok_or(Status::NotFound)?;
        if nav_mesh.nearest_ground_poly(&connection.end, &extents).is_none() {
            return Err(Status::NotFound);
        }

        let link = OffMeshLink {
            start: connection.start,
            end: connection.end,
            radius: connection.radius,
            poly: 0,
            bidirectional: connection.bidirectional,
            user_id: connection.user_id,
        };
        let reference = nav_mesh.add_off_mesh_poly(start_ref.tile_index(), link, connection.area, connection.flags)?;
        log::debug!(
            "Added off-mesh connection {} from {:?} to {:?}",
            reference,
            connection.start,
            connection.end
        );
        Ok(reference)
    }

    /// Adds every connection that can be placed and returns how many were
    pub fn add_connections(nav_mesh: &mut NavMesh, connections: &[OffMeshConnection]) -> usize {
        connections
            .iter()
            .filter(|c| match Self::add_connection(nav_mesh, c) {
                Ok(_) => true,
                Err(status) => {
                    log::warn!("Skipped off-mesh connection at {:?}: {}", c.start, status);
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::strip_nav_mesh;
    use crate::{DefaultQueryFilter, NavMeshQuery, PolyType};

    #[test]
    fn test_connection_becomes_polygon() {
        let mut nav = strip_nav_mesh();
        let before = nav.get_tile(0).unwrap().poly_count();
        let con = OffMeshConnection::new([0.5, 0.0, 1.0], [5.5, 0.0, 1.0], 0.5, false);
        let r = OffMeshConnectionBuilder::add_connection(&mut nav, &con).unwrap();

        let tile = nav.get_tile(0).unwrap();
        assert_eq!(tile.poly_count(), before + 1);
        assert_eq!(tile.polys[r.poly_index()].poly_type, PolyType::OffMeshConnection);
        assert_eq!(tile.off_mesh_links.len(), 1);
        // One link per end point
        assert_eq!(tile.links_of(&tile.polys[r.poly_index()]).count(), 2);

        let query = NavMeshQuery::new(&nav);
        let h = query.get_poly_height(r, &[3.0, 0.0, 1.0]).unwrap();
        assert!(h.abs() < 1e-5);
    }

    #[test]
    fn test_path_prefers_connection_when_cheaper() {
        let mut nav = strip_nav_mesh();
        let mut con = OffMeshConnection::new([0.5, 0.0, 1.0], [5.5, 0.0, 1.0], 0.5, false);
        con.area = 1;
        let r = OffMeshConnectionBuilder::add_connection(&mut nav, &con).unwrap();

        let mut filter = DefaultQueryFilter::default();
        filter.set_area_cost(63, 10.0);
        filter.set_area_cost(1, 0.1);
        let mut query = NavMeshQuery::new(&nav);
        let (a, c) = (nav.poly_ref(0, 0), nav.poly_ref(0, 2));
        let path = query
            .find_path(a, c, &[0.5, 0.0, 1.0], &[5.5, 0.0, 1.0], &filter, 16)
            .unwrap()
            .path;
        assert_eq!(path, vec![a, r, c]);

        // Unidirectional: no way back through the connection
        let back = query
            .find_path(c, a, &[5.5, 0.0, 1.0], &[0.5, 0.0, 1.0], &filter, 16)
            .unwrap()
            .path;
        assert!(!back.contains(&r));
    }

    #[test]
    fn test_connection_off_the_mesh_is_rejected() {
        let mut nav = strip_nav_mesh();
        let con = OffMeshConnection::new([0.5, 0.0, 1.0], [30.0, 0.0, 1.0], 0.5, true);
        assert_eq!(
            OffMeshConnectionBuilder::add_connection(&mut nav, &con),
            Err(Status::NotFound)
        );
        assert_eq!(nav.get_tile(0).unwrap().poly_count(), 3);

        let ok = OffMeshConnection::new([1.0, 0.0, 1.0], [5.0, 0.0, 1.0], 0.5, true);
        assert_eq!(OffMeshConnectionBuilder::add_connections(&mut nav, &[con, ok]), 1);
    }
}
