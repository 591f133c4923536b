//! Triangle-soup input geometry

use crate::{Error, Result};
use glam::Vec3;

#[cfg(feature = "std")]
use std::fs::File;
#[cfg(feature = "std")]
use std::io::{BufRead, BufReader};
#[cfg(feature = "std")]
use std::path::Path;

/// World geometry handed to the navigation mesh builders.
///
/// Vertices are stored as a flat `[x, y, z, x, y, z, ...]` array and
/// triangles as index triples into it. The bounding box is computed once on
/// construction; the geometry is read-only afterwards.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct InputGeometry {
    vertices: Vec<f32>,
    indices: Vec<i32>,
    bmin: Vec3,
    bmax: Vec3,
}

impl InputGeometry {
    /// Creates geometry from raw vertex and index arrays.
    ///
    /// Fails when the arrays are not multiples of three or an index points
    /// past the vertex array.
    pub fn new(vertices: Vec<f32>, indices: Vec<i32>) -> Result<Self> {
        if vertices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(
                "Vertex array length must be a multiple of 3".to_string(),
            ));
        }
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(
                "Index array length must be a multiple of 3".to_string(),
            ));
        }

        let vert_count = (vertices.len() / 3) as i32;
        if let Some(bad) = indices.iter().find(|&&i| i < 0 || i >= vert_count) {
            return Err(Error::InvalidMesh(format!(
                "Triangle index {} out of range (vertex count {})",
                bad, vert_count
            )));
        }

        let (bmin, bmax) = compute_bounds(&vertices);
        Ok(Self {
            vertices,
            indices,
            bmin,
            bmax,
        })
    }

    /// Loads geometry from a Wavefront OBJ file
    #[cfg(feature = "std")]
    pub fn from_obj<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for line in reader.lines() {
            parse_obj_line(&line?, &mut vertices, &mut indices)?;
        }
        Self::new(vertices, indices)
    }

    /// Parses Wavefront OBJ content held in memory.
    ///
    /// Only `v` and `f` records are read; polygons with more than three
    /// corners are fan-triangulated.
    ///
    /// ```
    /// use navforge_common::InputGeometry;
    ///
    /// let geom = InputGeometry::from_obj_str("v 0 0 0\nv 1 0 0\nv 0 0 1\nf 1 3 2\n").unwrap();
    /// assert_eq!(geom.vertex_count(), 3);
    /// assert_eq!(geom.triangle_count(), 1);
    /// ```
    pub fn from_obj_str(content: &str) -> Result<Self> {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for line in content.lines() {
            parse_obj_line(line, &mut vertices, &mut indices)?;
        }
        Self::new(vertices, indices)
    }

    pub fn vertices(&self) -> &[f32] {
        &self.vertices
    }

    pub fn indices(&self) -> &[i32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn bmin(&self) -> Vec3 {
        self.bmin
    }

    pub fn bmax(&self) -> Vec3 {
        self.bmax
    }

    /// Returns the three corners of triangle `tri`
    pub fn triangle(&self, tri: usize) -> [Vec3; 3] {
        let corner = |k: usize| {
            let v = self.indices[tri * 3 + k] as usize * 3;
            Vec3::new(self.vertices[v], self.vertices[v + 1], self.vertices[v + 2])
        };
        [corner(0), corner(1), corner(2)]
    }

    /// Returns true when the geometry has no triangles
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn compute_bounds(vertices: &[f32]) -> (Vec3, Vec3) {
    if vertices.is_empty() {
        return (Vec3::ZERO, Vec3::ZERO);
    }
    let mut bmin = Vec3::splat(f32::MAX);
    let mut bmax = Vec3::splat(f32::MIN);
    for v in vertices.chunks_exact(3) {
        let p = Vec3::new(v[0], v[1], v[2]);
        bmin = bmin.min(p);
        bmax = bmax.max(p);
    }
    (bmin, bmax)
}

fn parse_float(token: Option<&str>, what: &str) -> Result<f32> {
    token
        .ok_or_else(|| Error::InvalidMesh(format!("Invalid vertex: missing {}", what)))?
        .parse::<f32>()
        .map_err(|_| Error::InvalidMesh(format!("Invalid vertex: {} is not a number", what)))
}

fn parse_obj_line(line: &str, vertices: &mut Vec<f32>, indices: &mut Vec<i32>) -> Result<()> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("v") => {
            let x = parse_float(tokens.next(), "x coordinate")?;
            let y = parse_float(tokens.next(), "y coordinate")?;
            let z = parse_float(tokens.next(), "z coordinate")?;
            vertices.extend_from_slice(&[x, y, z]);
        }
        Some("f") => {
            let vert_count = (vertices.len() / 3) as i32;
            let mut face = Vec::with_capacity(4);
            for token in tokens {
                let raw = token.split('/').next().unwrap_or_default();
                let index = raw.parse::<i32>().map_err(|_| {
                    Error::InvalidMesh(format!("Invalid face index '{}'", token))
                })?;
                // Negative OBJ indices count back from the last vertex
                face.push(if index < 0 { vert_count + index } else { index - 1 });
            }
            if face.len() < 3 {
                return Err(Error::InvalidMesh(
                    "Invalid face: less than 3 vertices".to_string(),
                ));
            }
            for i in 1..face.len() - 1 {
                indices.extend_from_slice(&[face[0], face[i], face[i + 1]]);
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_computed() {
        let geom = InputGeometry::new(
            vec![-1.0, 0.0, -2.0, 3.0, 1.0, 0.0, 0.0, -0.5, 4.0],
            vec![0, 1, 2],
        )
        .unwrap();
        assert_eq!(geom.bmin(), Vec3::new(-1.0, -0.5, -2.0));
        assert_eq!(geom.bmax(), Vec3::new(3.0, 1.0, 4.0));
        assert_eq!(geom.triangle_count(), 1);
    }

    #[test]
    fn test_rejects_bad_arrays() {
        assert!(InputGeometry::new(vec![0.0, 1.0], vec![]).is_err());
        assert!(InputGeometry::new(vec![0.0; 9], vec![0, 1]).is_err());
        assert!(InputGeometry::new(vec![0.0; 9], vec![0, 1, 3]).is_err());
    }

    #[test]
    fn test_obj_quad_is_fan_triangulated() {
        let obj = "# quad\nv 0 0 0\nv 1 0 0\nv 1 0 1\nv 0 0 1\nvn 0 1 0\nf 1//1 4//1 3//1 2//1\n";
        let geom = InputGeometry::from_obj_str(obj).unwrap();
        assert_eq!(geom.vertex_count(), 4);
        assert_eq!(geom.triangle_count(), 2);
        assert_eq!(geom.indices(), &[0, 3, 2, 0, 2, 1]);
    }

    #[test]
    fn test_obj_errors() {
        assert!(InputGeometry::from_obj_str("v 0 0\n").is_err());
        assert!(InputGeometry::from_obj_str("v 0 0 0\nv 1 0 0\nf 1 2\n").is_err());
        assert!(InputGeometry::from_obj_str("v 0 0 0\nf a b c\n").is_err());
    }

    #[test]
    fn test_empty_geometry() {
        let geom = InputGeometry::new(Vec::new(), Vec::new()).unwrap();
        assert!(geom.is_empty());
        assert_eq!(geom.bmin(), Vec3::ZERO);
    }
}
