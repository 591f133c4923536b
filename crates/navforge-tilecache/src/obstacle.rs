//! Temporary obstacles carved out of the navigation mesh

use navforge_recast::CarveVolume;

/// Identifier handed out by the tile cache; valid ids start at 1
pub type ObstacleId = u32;

/// Shape of an obstacle
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ObstacleKind {
    /// Upright cylinder standing on `pos`
    Cylinder { pos: [f32; 3], radius: f32, height: f32 },
    /// Axis-aligned box
    Box { bmin: [f32; 3], bmax: [f32; 3] },
}

/// Processing state of an obstacle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ObstacleState {
    /// Some of the tiles it touches have not been rebuilt yet
    #[default]
    Pending,
    /// Every tile it touches has been rebuilt with it carved out
    Baked,
}

/// Obstacle registered in a [`TileCache`](crate::TileCache)
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Obstacle {
    pub id: ObstacleId,
    pub kind: ObstacleKind,
    pub state: ObstacleState,
    /// Tile coordinates whose build is affected by the obstacle
    pub touched: Vec<(i32, i32)>,
}

impl Obstacle {
    /// Cylinder radius; `None` for boxes
    pub fn radius(&self) -> Option<f32> {
        match self.kind {
            ObstacleKind::Cylinder { radius, .. } => Some(radius),
            ObstacleKind::Box { .. } => None,
        }
    }

    pub fn is_cylinder(&self) -> bool {
        matches!(self.kind, ObstacleKind::Cylinder { .. })
    }

    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        self.volume().bounds()
    }

    pub fn volume(&self) -> CarveVolume {
        match self.kind {
            ObstacleKind::Cylinder { pos, radius, height } => CarveVolume::Cylinder { pos, radius, height },
            ObstacleKind::Box { bmin, bmax } => CarveVolume::Box { bmin, bmax },
        }
    }
}

impl ObstacleKind {
    /// Rejects shapes with non-finite coordinates or no extent
    pub(crate) fn is_valid(&self) -> bool {
        match *self {
            ObstacleKind::Cylinder { pos, radius, height } => {
                pos.iter().all(|c| c.is_finite()) && radius > 0.0 && height > 0.0 && radius.is_finite()
            }
            ObstacleKind::Box { bmin, bmax } => {
                bmin.iter().chain(bmax.iter()).all(|c| c.is_finite())
                    && (0..3).all(|i| bmax[i] > bmin[i])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cylinder_bounds() {
        let ob = Obstacle {
            id: 1,
            kind: ObstacleKind::Cylinder {
                pos: [1.0, 0.0, 2.0],
                radius: 0.5,
                height: 2.0,
            },
            state: ObstacleState::Pending,
            touched: Vec::new(),
        };
        assert_eq!(ob.radius(), Some(0.5));
        assert_eq!(ob.bounds(), ([0.5, 0.0, 1.5], [1.5, 2.0, 2.5]));
    }

    #[test]
    fn test_shape_validation() {
        assert!(!ObstacleKind::Cylinder {
            pos: [0.0; 3],
            radius: 0.0,
            height: 1.0
        }
        .is_valid());
        assert!(!ObstacleKind::Box {
            bmin: [0.0; 3],
            bmax: [1.0, 0.0, 1.0]
        }
        .is_valid());
        assert!(ObstacleKind::Box {
            bmin: [0.0; 3],
            bmax: [1.0; 3]
        }
        .is_valid());
    }
}
