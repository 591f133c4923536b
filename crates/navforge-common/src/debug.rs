//! Renderer-agnostic debug drawing primitives
//!
//! Debug draw functions elsewhere in the workspace emit flat vertex lists
//! built from these types; interpreting them as lines or triangles is up to
//! the caller.

/// RGBA color with float channels
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self::new(r, g, b, 1.0)
    }

    /// Returns the same color with a different alpha
    pub const fn with_alpha(self, a: f32) -> Self {
        Self::new(self.r, self.g, self.b, a)
    }

    /// Deterministic pseudo-random color for an integer id (regions, areas, tiles)
    pub fn from_id(id: u32) -> Self {
        let mut h = id.wrapping_mul(0x9E37_79B9) ^ 0x5bd1_e995;
        h ^= h >> 15;
        let channel = |shift: u32| 0.25 + ((h >> shift) & 0xff) as f32 / 255.0 * 0.75;
        Self::rgb(channel(0), channel(8), channel(16))
    }

    pub const WHITE: Color = Color::rgb(1.0, 1.0, 1.0);
    pub const BLACK: Color = Color::rgb(0.0, 0.0, 0.0);
    pub const RED: Color = Color::rgb(1.0, 0.0, 0.0);
    pub const GREEN: Color = Color::rgb(0.0, 1.0, 0.0);
    pub const BLUE: Color = Color::rgb(0.0, 0.0, 1.0);
    pub const YELLOW: Color = Color::rgb(1.0, 1.0, 0.0);
    pub const CYAN: Color = Color::rgb(0.0, 1.0, 1.0);
    pub const ORANGE: Color = Color::rgb(1.0, 0.5, 0.0);
    pub const GRAY: Color = Color::rgb(0.5, 0.5, 0.5);
    pub const DARK_GRAY: Color = Color::rgb(0.3, 0.3, 0.3);
}

/// Debug vertex with position and color
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugVertex {
    pub position: [f32; 3],
    pub color: Color,
}

impl DebugVertex {
    pub const fn new(position: [f32; 3], color: Color) -> Self {
        Self { position, color }
    }
}

/// Pushes a line segment (two vertices) onto a line list
pub fn push_line(out: &mut Vec<DebugVertex>, a: [f32; 3], b: [f32; 3], color: Color) {
    out.push(DebugVertex::new(a, color));
    out.push(DebugVertex::new(b, color));
}

/// Pushes a triangle (three vertices) onto a triangle list
pub fn push_triangle(
    out: &mut Vec<DebugVertex>,
    a: [f32; 3],
    b: [f32; 3],
    c: [f32; 3],
    color: Color,
) {
    out.push(DebugVertex::new(a, color));
    out.push(DebugVertex::new(b, color));
    out.push(DebugVertex::new(c, color));
}

/// Pushes a horizontal cross of half-size `size` centered on `pos` (four vertices)
pub fn push_cross(out: &mut Vec<DebugVertex>, pos: [f32; 3], size: f32, color: Color) {
    push_line(
        out,
        [pos[0] - size, pos[1], pos[2]],
        [pos[0] + size, pos[1], pos[2]],
        color,
    );
    push_line(
        out,
        [pos[0], pos[1], pos[2] - size],
        [pos[0], pos[1], pos[2] + size],
        color,
    );
}

/// Pushes a horizontal circle approximated by `segments` line segments
pub fn push_circle(
    out: &mut Vec<DebugVertex>,
    center: [f32; 3],
    radius: f32,
    segments: usize,
    color: Color,
) {
    let segments = segments.max(3);
    let point = |i: usize| {
        let a = i as f32 / segments as f32 * std::f32::consts::TAU;
        [
            center[0] + a.cos() * radius,
            center[1],
            center[2] + a.sin() * radius,
        ]
    };
    for i in 0..segments {
        push_line(out, point(i), point(i + 1), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_vertex_counts() {
        let mut out = Vec::new();
        push_line(&mut out, [0.0; 3], [1.0, 0.0, 0.0], Color::RED);
        assert_eq!(out.len(), 2);
        push_cross(&mut out, [0.0; 3], 0.5, Color::GREEN);
        assert_eq!(out.len(), 6);
        push_circle(&mut out, [0.0; 3], 1.0, 8, Color::BLUE);
        assert_eq!(out.len(), 22);
        push_triangle(&mut out, [0.0; 3], [1.0; 3], [2.0; 3], Color::WHITE);
        assert_eq!(out.len(), 25);
    }

    #[test]
    fn test_id_colors_are_stable() {
        assert_eq!(Color::from_id(7), Color::from_id(7));
        assert_ne!(Color::from_id(1), Color::from_id(2));
        let c = Color::from_id(42);
        assert!(c.r >= 0.25 && c.r <= 1.0);
    }
}
