//! Inventory requirements attached to tasks.
//!
//! A requirement drives inventory-based progress computation and gates
//! final completion: a craft task is not done until the crafted output is
//! actually present.

use serde::{Deserialize, Serialize};

use super::world::InventoryItem;

/// What class of acquisition the requirement describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Collect,
    Mine,
    Craft,
    Build,
    Explore,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Mine => "mine",
            Self::Craft => "craft",
            Self::Build => "build",
            Self::Explore => "explore",
        }
    }
}

/// A typed acquisition requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub kind: RequirementKind,
    /// Substring pattern matched against inventory item names
    pub output_pattern: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Requirement {
    pub fn new(kind: RequirementKind, output_pattern: impl Into<String>, quantity: u32) -> Self {
        Self {
            kind,
            output_pattern: output_pattern.into(),
            quantity: quantity.max(1),
            context: None,
        }
    }

    /// Total matching items currently held.
    pub fn matching_count(&self, inventory: &[InventoryItem]) -> u32 {
        let pattern = self.output_pattern.to_lowercase();
        inventory
            .iter()
            .filter(|item| item.name.to_lowercase().contains(&pattern))
            .map(|item| item.count)
            .sum()
    }

    /// Progress fraction in [0,1] from an inventory snapshot.
    pub fn progress(&self, inventory: &[InventoryItem]) -> f64 {
        let have = f64::from(self.matching_count(inventory));
        (have / f64::from(self.quantity)).clamp(0.0, 1.0)
    }

    /// Whether the inventory satisfies the requirement.
    pub fn satisfied_by(&self, inventory: &[InventoryItem]) -> bool {
        self.matching_count(inventory) >= self.quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(entries: &[(&str, u32)]) -> Vec<InventoryItem> {
        entries
            .iter()
            .map(|(name, count)| InventoryItem::new(*name, *count))
            .collect()
    }

    #[test]
    fn test_pattern_matches_substring() {
        let req = Requirement::new(RequirementKind::Collect, "log", 4);
        let inventory = inv(&[("oak_log", 2), ("birch_log", 1), ("stone", 8)]);
        assert_eq!(req.matching_count(&inventory), 3);
        assert!(!req.satisfied_by(&inventory));
        assert!((req.progress(&inventory) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_clamps_at_one() {
        let req = Requirement::new(RequirementKind::Mine, "stone", 2);
        let inventory = inv(&[("cobblestone", 10)]);
        assert!((req.progress(&inventory) - 1.0).abs() < f64::EPSILON);
        assert!(req.satisfied_by(&inventory));
    }

    #[test]
    fn test_zero_quantity_coerced() {
        let req = Requirement::new(RequirementKind::Craft, "stick", 0);
        assert_eq!(req.quantity, 1);
    }
}
