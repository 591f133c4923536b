//! Shared building blocks for the navforge navigation crates.
//!
//! This crate holds the pieces every stage of the pipeline agrees on: the
//! error type, the triangle-soup [`InputGeometry`] fed to the builders, small
//! vector helpers over `[f32; 3]`, and renderer-agnostic debug primitives.

pub mod debug;
pub mod geometry;
pub mod math;

pub use debug::{Color, DebugVertex};
pub use geometry::InputGeometry;

/// Common 3D vector type used by the build pipeline
pub type Vec3 = glam::Vec3;

/// Errors produced while building, loading or querying navigation data
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("navigation mesh generation failed: {0}")]
    NavMeshGeneration(String),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("detour error: {0}")]
    Detour(String),

    #[cfg(feature = "std")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for navforge operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMesh("empty vertex array".to_string());
        assert_eq!(err.to_string(), "invalid input mesh: empty vertex array");

        let err = Error::Serialization("truncated header".to_string());
        assert!(err.to_string().contains("truncated header"));
    }

    #[test]
    fn test_io_error_conversion() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/a/real/navmesh.bin")?)
        }
        assert!(matches!(open_missing(), Err(Error::Io(_))));
    }
}
