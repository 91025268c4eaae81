//! World-facing value types read from the bot interface.

use serde::{Deserialize, Serialize};

/// A point in world space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Snap to a coarse grid cell. Goal keys bucket the bot position so
    /// small movements do not spawn distinct goals.
    pub fn coarse_bucket(&self, cell_size: f64) -> (i64, i64, i64) {
        let snap = |v: f64| (v / cell_size).floor() as i64;
        (snap(self.x), snap(self.y), snap(self.z))
    }
}

/// One inventory slot aggregate (name + total count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub count: u32,
}

impl InventoryItem {
    pub fn new(name: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

/// Result of a bot health probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotHealth {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Snapshot of the bot's vitals and surroundings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotState {
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub food: f64,
    #[serde(default)]
    pub health: f64,
    #[serde(default)]
    pub hostiles_nearby: u32,
    /// Aggregate threat in [0,1] computed by the interface process
    #[serde(default)]
    pub threat_level: f64,
}

/// A block observed near the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyBlock {
    pub name: String,
    pub position: Position,
    #[serde(default)]
    pub distance: f64,
}

/// Axis-aligned scan volume for `/world-scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanBounds {
    pub x1: i64,
    pub y1: i64,
    pub z1: i64,
    pub x2: i64,
    pub y2: i64,
    pub z2: i64,
}

/// Decoded occupancy grid returned by a world scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyGrid {
    pub dims: (u32, u32, u32),
    pub cells: Vec<u8>,
}

impl OccupancyGrid {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_coarse_bucket_stability() {
        let a = Position::new(10.2, 64.0, -3.9);
        let b = Position::new(11.7, 64.4, -3.1);
        // Both land in the same 8-block cell
        assert_eq!(a.coarse_bucket(8.0), b.coarse_bucket(8.0));
    }

    #[test]
    fn test_coarse_bucket_negative_floor() {
        let p = Position::new(-0.5, 0.0, -8.1);
        assert_eq!(p.coarse_bucket(8.0), (-1, 0, -2));
    }
}
