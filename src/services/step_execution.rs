//! Step-to-leaf extraction and per-leaf argument contracts.
//!
//! `step_to_leaf_execution` is the canonical extractor from step
//! metadata: explicit args pass through (with legacy shape fixups),
//! otherwise per-leaf fallbacks derive args from produces/consumes.
//! Unknown leaves on executable steps fail explicitly; the MCP fallback
//! table only serves tasks with no structured plan at all.

use serde_json::{json, Value};

use crate::domain::models::task::{Step, TaskKind, TaskParameters};

/// Leaves the executor will dispatch. Anything else is rejected before
/// reaching the bot.
pub const LEAF_ALLOWLIST: &[&str] = &[
    "move_to",
    "step_forward_safely",
    "follow_entity",
    "dig_block",
    "pickup_item",
    "collect_items",
    "craft_recipe",
    "smelt",
    "place_block",
    "place_torch_if_needed",
    "place_workstation",
    "consume_food",
    "acquire_material",
    "sense_hostiles",
    "get_light_level",
    "wait",
    "chat",
    "look_at",
    "building_step",
    "sterling_navigate",
];

pub fn is_known_leaf(leaf: &str) -> bool {
    LEAF_ALLOWLIST.contains(&leaf)
}

/// Building-domain leaves subject to the execution budget.
pub fn is_building_leaf(leaf: &str) -> bool {
    matches!(leaf, "building_step" | "place_block" | "place_workstation")
}

/// Resolved dispatchable execution.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafExecution {
    pub leaf: String,
    pub args: Value,
}

/// Why extraction failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepMappingError {
    /// Executable step names a leaf outside the allowlist.
    UnknownLeaf(String),
    /// Step metadata cannot be turned into leaf args.
    MappingFailure(String),
}

impl std::fmt::Display for StepMappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownLeaf(leaf) => write!(f, "unknown leaf: {leaf}"),
            Self::MappingFailure(detail) => write!(f, "mapping failure: {detail}"),
        }
    }
}

/// Derive the `(leaf, args)` pair for a step.
pub fn step_to_leaf_execution(step: &Step) -> Result<LeafExecution, StepMappingError> {
    let leaf = step
        .meta
        .leaf
        .clone()
        .ok_or_else(|| StepMappingError::MappingFailure("step has no leaf".to_string()))?;

    // Legacy dig_block steps are remapped to the atomic mine+collect leaf.
    if leaf == "dig_block" && step.meta.args.is_none() {
        let item = step
            .meta
            .produces
            .first()
            .map(|stack| stack.item.clone())
            .ok_or_else(|| {
                StepMappingError::MappingFailure("dig_block without produces".to_string())
            })?;
        return Ok(LeafExecution {
            leaf: "acquire_material".to_string(),
            args: json!({ "item": item, "count": 1 }),
        });
    }

    if !is_known_leaf(&leaf) {
        // Executable meta never falls through to the MCP table.
        return Err(StepMappingError::UnknownLeaf(leaf));
    }

    if let Some(args) = &step.meta.args {
        return Ok(LeafExecution {
            leaf: leaf.clone(),
            args: normalize_legacy_args(&leaf, args.clone()),
        });
    }

    // Per-leaf derivation from produces/consumes.
    let args = match leaf.as_str() {
        "craft_recipe" => {
            let output = step.meta.produces.first().ok_or_else(|| {
                StepMappingError::MappingFailure("craft_recipe without produces".to_string())
            })?;
            json!({ "recipe": output.item, "qty": output.count.max(1) })
        }
        // Smelt input comes from consumes, never produces.
        "smelt" => {
            let input = step.meta.consumes.first().ok_or_else(|| {
                StepMappingError::MappingFailure("smelt without consumes".to_string())
            })?;
            json!({ "input": input.item, "count": input.count.max(1) })
        }
        "place_block" | "place_torch_if_needed" => {
            let item = step
                .meta
                .consumes
                .first()
                .map(|stack| stack.item.clone())
                .ok_or_else(|| {
                    StepMappingError::MappingFailure("place without consumes".to_string())
                })?;
            json!({ "item": item })
        }
        "place_workstation" => {
            let item = step
                .meta
                .workstation
                .clone()
                .or_else(|| step.meta.consumes.first().map(|s| s.item.clone()))
                .ok_or_else(|| {
                    StepMappingError::MappingFailure(
                        "place_workstation without workstation".to_string(),
                    )
                })?;
            json!({ "item": item })
        }
        "building_step" => {
            let module_id = step.meta.module_id.clone().ok_or_else(|| {
                StepMappingError::MappingFailure("building_step without moduleId".to_string())
            })?;
            let (item, count) = step
                .meta
                .consumes
                .first()
                .map_or((Value::Null, 1), |s| (json!(s.item), s.count.max(1)));
            json!({ "moduleId": module_id, "item": item, "count": count })
        }
        "sterling_navigate" => {
            return Err(StepMappingError::MappingFailure(
                "sterling_navigate requires explicit args".to_string(),
            ))
        }
        "acquire_material" => {
            let output = step.meta.produces.first().ok_or_else(|| {
                StepMappingError::MappingFailure("acquire_material without produces".to_string())
            })?;
            json!({ "item": output.item, "count": output.count.max(1) })
        }
        // Observational and movement leaves run argless by default.
        _ => json!({}),
    };

    Ok(LeafExecution { leaf, args })
}

/// Rewrite legacy argument shapes in place.
fn normalize_legacy_args(leaf: &str, mut args: Value) -> Value {
    if leaf == "smelt" {
        if let Value::Object(ref mut map) = args {
            // Old planner emitted `item`; the contract wants `input`.
            if !map.contains_key("input") {
                if let Some(item) = map.remove("item") {
                    map.insert("input".to_string(), item);
                }
            }
        }
    }
    args
}

/// Validate args against the per-leaf contract table.
pub fn validate_leaf_args(leaf: &str, args: &Value) -> Result<(), String> {
    let obj = args
        .as_object()
        .ok_or_else(|| format!("{leaf}: args must be an object"))?;

    let require_string = |key: &str| -> Result<(), String> {
        match obj.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(()),
            _ => Err(format!("{leaf}: missing required string arg '{key}'")),
        }
    };
    let require_positive = |key: &str| -> Result<(), String> {
        match obj.get(key).and_then(Value::as_u64) {
            Some(n) if n >= 1 => Ok(()),
            None => Ok(()), // optional counts default to 1
            _ => Err(format!("{leaf}: arg '{key}' must be >= 1")),
        }
    };
    let require_position = |key: &str| -> Result<(), String> {
        let Some(pos) = obj.get(key) else {
            return Err(format!("{leaf}: missing required position arg '{key}'"));
        };
        for axis in ["x", "y", "z"] {
            if pos.get(axis).and_then(Value::as_f64).is_none() {
                return Err(format!("{leaf}: position arg '{key}' missing '{axis}'"));
            }
        }
        Ok(())
    };

    match leaf {
        "craft_recipe" => {
            require_string("recipe")?;
            require_positive("qty")
        }
        "smelt" => {
            require_string("input")?;
            require_positive("count")
        }
        "acquire_material" => {
            require_string("item")?;
            require_positive("count")
        }
        "place_block" | "place_workstation" => require_string("item"),
        "move_to" => require_position("pos"),
        "building_step" => require_string("moduleId"),
        "sterling_navigate" => require_position("target"),
        "follow_entity" => require_string("entity"),
        _ => Ok(()),
    }
}

/// Map a plan-less task to a leaf via the MCP fallback table. Used only
/// when the solver produced no structured steps.
pub fn mcp_fallback(kind: &TaskKind, parameters: &TaskParameters) -> Option<LeafExecution> {
    let item = parameters
        .item
        .clone()
        .or_else(|| parameters.block_type.clone());
    let count = parameters.count.or(parameters.qty).unwrap_or(1).max(1);

    match kind.as_str() {
        TaskKind::GATHERING | TaskKind::MINING => item.map(|item| LeafExecution {
            leaf: "acquire_material".to_string(),
            args: json!({ "item": item, "count": count }),
        }),
        TaskKind::CRAFTING => parameters.recipe.clone().map(|recipe| LeafExecution {
            leaf: "craft_recipe".to_string(),
            args: json!({ "recipe": recipe, "qty": count }),
        }),
        TaskKind::PLACEMENT => item.map(|item| LeafExecution {
            leaf: "place_block".to_string(),
            args: json!({ "item": item }),
        }),
        "navigation" | "exploration" => parameters.pos.map(|pos| LeafExecution {
            leaf: "move_to".to_string(),
            args: json!({ "pos": { "x": pos.x, "y": pos.y, "z": pos.z } }),
        }),
        _ => None,
    }
}
