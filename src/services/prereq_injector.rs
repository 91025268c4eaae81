//! Dynamic prerequisite injection for craft steps.
//!
//! When a craft is missing inputs, the injector asks the solver for the
//! recipe, picks the input with the largest deficit, and spawns a
//! subtask to acquire it. Subtasks are deduplicated by a stable key and
//! capped per parent; on injection the parent blocks on the prereq.

use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::domain::errors::DomainResult;
use crate::domain::models::task::{ItemStack, Task, TaskId, TaskKind, TaskParameters, TaskSource};
use crate::domain::models::world::InventoryItem;
use crate::domain::ports::SterlingSolver;
use crate::services::task_service::{NewTaskRequest, TaskService};

/// Maximum prereq injections per parent task.
pub const MAX_PREREQ_INJECTIONS: u32 = 3;

/// Blocked reason set on the parent while a prereq subtask runs.
pub const WAITING_ON_PREREQ: &str = "waiting_on_prereq";

/// Stable identity for an injected prerequisite.
pub fn subtask_key(kind: &str, output_pattern: &str, quantity: u32, parent: TaskId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(output_pattern.as_bytes());
    hasher.update(b"|");
    hasher.update(quantity.to_le_bytes());
    hasher.update(b"|");
    hasher.update(parent.as_bytes());
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// What the injector decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// Subtask created; parent is blocked on it.
    Injected { subtask_id: TaskId },
    /// A live subtask for the same prereq already exists.
    Duplicate { subtask_id: TaskId },
    /// The injection cap is exhausted; retry/fail policy takes over.
    CapExhausted,
    /// Inputs are all present (or the recipe is unknown).
    NotNeeded,
}

/// Base-gather fallbacks for raw materials the solver cannot craft.
fn base_gather_mapping(item: &str) -> (String, String) {
    let item_lower = item.to_lowercase();
    if item_lower.contains("log") || item_lower.contains("plank") || item_lower == "wood" {
        return (TaskKind::GATHERING.to_string(), "oak_log".to_string());
    }
    if item_lower.contains("stone") || item_lower.contains("cobble") {
        return (TaskKind::MINING.to_string(), "stone".to_string());
    }
    if item_lower.contains("iron") {
        return (TaskKind::MINING.to_string(), "iron_ore".to_string());
    }
    (TaskKind::GATHERING.to_string(), item_lower)
}

pub struct PrereqInjector {
    solver: Arc<dyn SterlingSolver>,
}

impl PrereqInjector {
    pub fn new(solver: Arc<dyn SterlingSolver>) -> Self {
        Self { solver }
    }

    /// Inject a prerequisite subtask for a craft that is missing inputs.
    pub async fn inject_for_craft(
        &self,
        service: &TaskService,
        parent: &Task,
        recipe: &str,
        inventory: &[InventoryItem],
    ) -> DomainResult<InjectionOutcome> {
        if parent.metadata.prereq_injection_count >= MAX_PREREQ_INJECTIONS {
            tracing::info!(
                parent = %parent.id,
                recipe,
                "Prereq injection cap reached; deferring to retry policy"
            );
            return Ok(InjectionOutcome::CapExhausted);
        }

        let Some(recipe_info) = self.solver.introspect_recipe(recipe).await? else {
            return Ok(InjectionOutcome::NotNeeded);
        };

        let Some(missing) = largest_deficit(&recipe_info.inputs, inventory) else {
            // Inputs satisfied; check the workstation requirement.
            if recipe_info.requires_table && !has_item(inventory, "crafting_table") {
                return self
                    .inject_subtask(
                        service,
                        parent,
                        TaskKind::PLACEMENT,
                        "crafting_table",
                        1,
                        format!("Place crafting table for {recipe}"),
                    )
                    .await;
            }
            return Ok(InjectionOutcome::NotNeeded);
        };

        // A craftable missing input becomes a craft subtask; raw
        // materials fall back to the base-gather mapping.
        let craftable = self.solver.introspect_recipe(&missing.item).await?.is_some();
        if craftable {
            self.inject_subtask(
                service,
                parent,
                TaskKind::CRAFTING,
                &missing.item,
                missing.count,
                format!("Craft {} x{}", missing.item, missing.count),
            )
            .await
        } else {
            let (kind, target) = base_gather_mapping(&missing.item);
            self.inject_subtask(
                service,
                parent,
                &kind,
                &target,
                missing.count,
                format!("Acquire {} x{}", target, missing.count),
            )
            .await
        }
    }

    /// Whether a recipe needs a crafting table. Unknown recipes do not.
    pub async fn solver_recipe_requires_table(&self, recipe: &str) -> DomainResult<bool> {
        Ok(self
            .solver
            .introspect_recipe(recipe)
            .await?
            .is_some_and(|info| info.requires_table))
    }

    /// Inject a named prerequisite subtask directly (crafting-table
    /// availability path).
    pub async fn inject_named(
        &self,
        service: &TaskService,
        parent: &Task,
        kind: &str,
        item: &str,
        count: u32,
        title: String,
    ) -> DomainResult<InjectionOutcome> {
        if parent.metadata.prereq_injection_count >= MAX_PREREQ_INJECTIONS {
            return Ok(InjectionOutcome::CapExhausted);
        }
        self.inject_subtask(service, parent, kind, item, count, title)
            .await
    }

    async fn inject_subtask(
        &self,
        service: &TaskService,
        parent: &Task,
        kind: &str,
        item: &str,
        count: u32,
        title: String,
    ) -> DomainResult<InjectionOutcome> {
        let key = subtask_key(kind, item, count, parent.id);

        if let Some(existing) = {
            let store = service.store();
            let guard = store.read().await;
            guard.find_by_subtask_key(&key).map(|t| t.id)
        } {
            tracing::debug!(parent = %parent.id, key, "Prereq subtask already live");
            return Ok(InjectionOutcome::Duplicate {
                subtask_id: existing,
            });
        }

        let mut request = NewTaskRequest::new(title, TaskKind::new(kind), TaskSource::Autonomous);
        request.description = format!("Prerequisite for '{}'", parent.title);
        request.priority = Some(json!(((parent.priority + 0.1).min(1.0))));
        request.parameters = TaskParameters {
            item: Some(item.to_string()),
            count: Some(count),
            recipe: (kind == TaskKind::CRAFTING).then(|| item.to_string()),
            ..Default::default()
        };
        request.metadata = json!({
            "subtaskKey": key,
            "taskProvenance": format!("prereq:{}", parent.kind),
            "parentTaskId": parent.id.to_string(),
        })
        .as_object()
        .cloned()
        .unwrap_or_default();

        let subtask_id = service.add_task(request).await?;

        service
            .mutate_task(parent.id, |task| {
                task.set_blocked(WAITING_ON_PREREQ);
                task.metadata.prereq_injection_count += 1;
                if !task.metadata.child_task_ids.contains(&subtask_id) {
                    task.metadata.child_task_ids.push(subtask_id);
                }
            })
            .await?;

        tracing::info!(
            parent = %parent.id,
            subtask = %subtask_id,
            item,
            count,
            "Injected prerequisite subtask"
        );
        Ok(InjectionOutcome::Injected { subtask_id })
    }
}

fn has_item(inventory: &[InventoryItem], name: &str) -> bool {
    inventory
        .iter()
        .any(|item| item.name.eq_ignore_ascii_case(name) && item.count > 0)
}

/// The required input with the largest deficit against the inventory.
fn largest_deficit(inputs: &[ItemStack], inventory: &[InventoryItem]) -> Option<ItemStack> {
    inputs
        .iter()
        .filter_map(|input| {
            let have: u32 = inventory
                .iter()
                .filter(|item| item.name.eq_ignore_ascii_case(&input.item))
                .map(|item| item.count)
                .sum();
            let deficit = input.count.saturating_sub(have);
            (deficit > 0).then(|| ItemStack::new(input.item.clone(), deficit))
        })
        .max_by_key(|stack| stack.count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtask_key_stability() {
        let parent = uuid::Uuid::new_v4();
        let a = subtask_key("gathering", "oak_log", 4, parent);
        let b = subtask_key("gathering", "oak_log", 4, parent);
        assert_eq!(a, b);
        assert_ne!(a, subtask_key("gathering", "oak_log", 5, parent));
        assert_ne!(a, subtask_key("gathering", "oak_log", 4, uuid::Uuid::new_v4()));
    }

    #[test]
    fn test_largest_deficit() {
        let inputs = vec![ItemStack::new("oak_planks", 3), ItemStack::new("stick", 2)];
        let inventory = vec![InventoryItem::new("stick", 2)];
        let missing = largest_deficit(&inputs, &inventory).unwrap();
        assert_eq!(missing.item, "oak_planks");
        assert_eq!(missing.count, 3);

        let full = vec![
            InventoryItem::new("oak_planks", 3),
            InventoryItem::new("stick", 2),
        ];
        assert!(largest_deficit(&inputs, &full).is_none());
    }

    #[test]
    fn test_base_gather_mapping() {
        assert_eq!(
            base_gather_mapping("oak_log"),
            ("gathering".to_string(), "oak_log".to_string())
        );
        assert_eq!(
            base_gather_mapping("cobblestone"),
            ("mining".to_string(), "stone".to_string())
        );
        assert_eq!(
            base_gather_mapping("iron_ingot"),
            ("mining".to_string(), "iron_ore".to_string())
        );
    }
}
