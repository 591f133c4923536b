//! Small procedural scenes for tests, demos and benchmarks
//!
//! All scenes lie on the xz plane with +y up. Triangles are wound so their
//! normals point up.

use navforge_common::{InputGeometry, Result};

#[derive(Default)]
struct SceneBuilder {
    vertices: Vec<f32>,
    indices: Vec<i32>,
}

impl SceneBuilder {
    fn vertex(&mut self, x: f32, y: f32, z: f32) -> i32 {
        self.vertices.extend_from_slice(&[x, y, z]);
        (self.vertices.len() / 3 - 1) as i32
    }

    /// Quad over `x0..x1`, `z0..z1` with a height per corner:
    /// `[y(x0,z0), y(x0,z1), y(x1,z1), y(x1,z0)]`
    fn quad(&mut self, x0: f32, z0: f32, x1: f32, z1: f32, heights: [f32; 4]) {
        let a = self.vertex(x0, heights[0], z0);
        let b = self.vertex(x0, heights[1], z1);
        let c = self.vertex(x1, heights[2], z1);
        let d = self.vertex(x1, heights[3], z0);
        self.indices.extend_from_slice(&[a, b, c, a, c, d]);
    }

    fn flat(&mut self, x0: f32, z0: f32, x1: f32, z1: f32, y: f32) {
        self.quad(x0, z0, x1, z1, [y; 4]);
    }

    /// Closed box top and sides; the bottom face is never walkable
    fn solid_box(&mut self, bmin: [f32; 3], bmax: [f32; 3]) {
        self.flat(bmin[0], bmin[2], bmax[0], bmax[2], bmax[1]);

        let corners = [
            [bmin[0], bmin[2]],
            [bmin[0], bmax[2]],
            [bmax[0], bmax[2]],
            [bmax[0], bmin[2]],
        ];
        for i in 0..4 {
            let [ax, az] = corners[i];
            let [bx, bz] = corners[(i + 1) % 4];
            let a = self.vertex(ax, bmin[1], az);
            let b = self.vertex(bx, bmin[1], bz);
            let c = self.vertex(bx, bmax[1], bz);
            let d = self.vertex(ax, bmax[1], az);
            self.indices.extend_from_slice(&[a, b, c, a, c, d]);
        }
    }

    fn finish(self) -> Result<InputGeometry> {
        InputGeometry::new(self.vertices, self.indices)
    }
}

/// Square ground plane of side `size` centered on the origin
pub fn flat_plane(size: f32) -> Result<InputGeometry> {
    let h = size * 0.5;
    let mut scene = SceneBuilder::default();
    scene.flat(-h, -h, h, h, 0.0);
    scene.finish()
}

/// Ground plane with a solid box standing in its middle
pub fn plane_with_box(size: f32, box_half_size: f32, box_height: f32) -> Result<InputGeometry> {
    let h = size * 0.5;
    let mut scene = SceneBuilder::default();
    scene.flat(-h, -h, h, h, 0.0);
    scene.solid_box(
        [-box_half_size, 0.0, -box_half_size],
        [box_half_size, box_height, box_half_size],
    );
    scene.finish()
}

/// Two square platforms along x separated by `gap`. A bridge of
/// `bridge_width` joins them through the middle; zero leaves them apart.
pub fn platforms_with_gap(platform_size: f32, gap: f32, bridge_width: f32) -> Result<InputGeometry> {
    let h = platform_size * 0.5;
    let half_gap = gap * 0.5;
    let mut scene = SceneBuilder::default();
    scene.flat(-half_gap - platform_size, -h, -half_gap, h, 0.0);
    scene.flat(half_gap, -h, half_gap + platform_size, h, 0.0);
    if bridge_width > 0.0 && gap > 0.0 {
        let w = bridge_width * 0.5;
        scene.flat(-half_gap, -w, half_gap, w, 0.0);
    }
    scene.finish()
}

/// Flat landing, a slope rising by `height` over `length` along +x, and a
/// raised landing. Each landing is `length` long; everything is `width` wide.
pub fn ramp(length: f32, width: f32, height: f32) -> Result<InputGeometry> {
    let w = width * 0.5;
    let mut scene = SceneBuilder::default();
    scene.flat(-length, -w, 0.0, w, 0.0);
    scene.quad(0.0, -w, length, w, [0.0, 0.0, height, height]);
    scene.flat(length, -w, 2.0 * length, w, height);
    scene.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_plane_bounds() {
        let geom = flat_plane(10.0).unwrap();
        assert_eq!(geom.triangle_count(), 2);
        assert_eq!(geom.bmin().x, -5.0);
        assert_eq!(geom.bmax().z, 5.0);
    }

    #[test]
    fn test_triangles_face_up() {
        for geom in [
            flat_plane(4.0).unwrap(),
            platforms_with_gap(4.0, 1.0, 1.0).unwrap(),
            ramp(4.0, 2.0, 1.0).unwrap(),
        ] {
            for t in 0..geom.triangle_count() {
                let [a, b, c] = geom.triangle(t);
                assert!((b - a).cross(c - a).y > 0.0, "triangle {} faces down", t);
            }
        }
    }

    #[test]
    fn test_scene_sizes() {
        assert_eq!(plane_with_box(10.0, 1.0, 2.0).unwrap().triangle_count(), 2 + 2 + 8);
        assert_eq!(platforms_with_gap(4.0, 1.0, 0.0).unwrap().triangle_count(), 4);
        assert_eq!(platforms_with_gap(4.0, 1.0, 1.0).unwrap().triangle_count(), 6);
        assert_eq!(ramp(4.0, 2.0, 1.0).unwrap().bmax().y, 1.0);
    }
}
