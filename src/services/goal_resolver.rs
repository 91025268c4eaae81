//! Goal resolver: at most one live task per goal identity.
//!
//! Incoming goal signals are deduplicated on a canonical goal key
//! computed from the goal type, stable-canonicalized intent params, the
//! verifier name, and a coarse-bucketed bot position. Matching live
//! tasks continue; satisfied goals short-circuit; everything else gets a
//! skeleton task for the caller to enrich.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::goal::{GoalBinding, GoalKey};
use crate::domain::models::metadata::TaskMetadata;
use crate::domain::models::task::{Task, TaskId, TaskKind, TaskSource};
use crate::domain::models::world::Position;
use crate::domain::ports::GoalVerifier;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::task_store::TaskStore;

/// Position bucket edge length: movements inside one cell keep the same
/// goal identity.
const POSITION_BUCKET: f64 = 8.0;

/// Integers beyond this magnitude are canonicalized as strings so that
/// precision loss cannot merge distinct intents.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Request to resolve or create a goal-backed task.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub goal_type: String,
    pub intent_params: Option<serde_json::Value>,
    pub bot_position: Option<Position>,
    pub verifier: String,
    pub goal_id: Option<String>,
    pub kind: TaskKind,
    pub title: String,
}

/// Resolver outcome.
#[derive(Debug, Clone)]
pub enum ResolverDecision {
    /// A live task for this goal already exists.
    Continue { task_id: TaskId },
    /// A completed task still satisfies the goal.
    AlreadySatisfied { task_id: TaskId },
    /// A fresh skeleton for the caller to enrich and finalize.
    Skeleton { task: Box<Task> },
}

/// Canonicalization result for intent params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalParams {
    /// Stable canonical form, absent when the raw value was absent/null
    pub canonical: Option<String>,
    /// Set when raw params were present but canonicalization produced
    /// nothing; keeps the goal distinct from "no intent params"
    pub unserializable: Option<String>,
}

impl CanonicalParams {
    fn key_component(&self) -> &str {
        self.canonical
            .as_deref()
            .or(self.unserializable.as_deref())
            .unwrap_or("")
    }
}

/// Canonicalize intent params: recursive key-sorted JSON, null entries
/// omitted, oversized integers stringified. Fails closed to the
/// unserializable sentinel when the raw value is present but nothing
/// canonical survives.
pub fn canonicalize_intent_params(raw: Option<&serde_json::Value>) -> CanonicalParams {
    let Some(value) = raw else {
        return CanonicalParams {
            canonical: None,
            unserializable: None,
        };
    };
    match canonical_json(value) {
        Some(canonical) => CanonicalParams {
            canonical: Some(canonical),
            unserializable: None,
        },
        None => CanonicalParams {
            canonical: None,
            unserializable: Some(format!("__unserializable__:{}", value_type_name(value))),
        },
    }
}

fn value_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Stable stringification with recursively sorted object keys. Null
/// yields None; null object entries are dropped; an object whose every
/// entry drops yields None.
fn canonical_json(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(canonical_number(n)),
        serde_json::Value::String(s) => Some(serde_json::Value::String(s.clone()).to_string()),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| canonical_json(item).unwrap_or_else(|| "null".to_string()))
                .collect();
            Some(format!("[{}]", parts.join(",")))
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut parts = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(canonical) = canonical_json(&map[key]) {
                    parts.push(format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical
                    ));
                }
            }
            if parts.is_empty() && !map.is_empty() {
                return None;
            }
            Some(format!("{{{}}}", parts.join(",")))
        }
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(u) = n.as_u64() {
        if u > MAX_SAFE_INTEGER {
            return format!("\"{u}\"");
        }
    }
    if let Some(i) = n.as_i64() {
        if i.unsigned_abs() > MAX_SAFE_INTEGER {
            return format!("\"{i}\"");
        }
    }
    n.to_string()
}

/// Compute the canonical goal key.
pub fn compute_goal_key(
    goal_type: &str,
    params: &CanonicalParams,
    verifier: &str,
    bot_position: Option<&Position>,
) -> GoalKey {
    let bucket = bot_position
        .map(|p| {
            let (x, y, z) = p.coarse_bucket(POSITION_BUCKET);
            format!("{x},{y},{z}")
        })
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(goal_type.as_bytes());
    hasher.update(b"|");
    hasher.update(params.key_component().as_bytes());
    hasher.update(b"|");
    hasher.update(verifier.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    GoalKey::new(hex).expect("sha256 hex is never empty")
}

/// Resolver over the shared task store.
pub struct GoalResolver {
    store: Arc<RwLock<TaskStore>>,
    verifiers: RwLock<HashMap<String, Arc<dyn GoalVerifier>>>,
    bus: EventBus,
}

impl GoalResolver {
    pub fn new(store: Arc<RwLock<TaskStore>>, bus: EventBus) -> Self {
        Self {
            store,
            verifiers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Register a goal verifier under its lookup name.
    pub async fn register_verifier(&self, name: impl Into<String>, verifier: Arc<dyn GoalVerifier>) {
        self.verifiers.write().await.insert(name.into(), verifier);
    }

    /// Resolve a goal signal against the store.
    pub async fn resolve_or_create(&self, request: ResolveRequest) -> DomainResult<ResolverDecision> {
        let params = canonicalize_intent_params(request.intent_params.as_ref());
        if let Some(detail) = &params.unserializable {
            tracing::warn!(goal_type = %request.goal_type, detail, "Intent params did not canonicalize");
            self.bus.publish(EventPayload::IntentParamsUnserializable {
                goal_type: request.goal_type.clone(),
                detail: detail.clone(),
            });
        }
        let goal_key = compute_goal_key(
            &request.goal_type,
            &params,
            &request.verifier,
            request.bot_position.as_ref(),
        );

        let satisfied_candidates: Vec<Task> = {
            let store = self.store.read().await;
            if let Some(live) = store.find_goal_task(&request.goal_type, &goal_key) {
                return Ok(ResolverDecision::Continue { task_id: live.id });
            }
            store
                .completed_goal_tasks(&request.goal_type, &goal_key)
                .into_iter()
                .cloned()
                .collect()
        };

        if let Some(verifier) = self.verifiers.read().await.get(&request.verifier).cloned() {
            for candidate in &satisfied_candidates {
                if verifier.still_satisfied(candidate).await {
                    return Ok(ResolverDecision::AlreadySatisfied {
                        task_id: candidate.id,
                    });
                }
            }
        }

        Ok(ResolverDecision::Skeleton {
            task: Box::new(self.build_skeleton(&request, goal_key)),
        })
    }

    fn build_skeleton(&self, request: &ResolveRequest, goal_key: GoalKey) -> Task {
        let goal_id = request
            .goal_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let binding = GoalBinding::new(
            goal_id,
            goal_key.clone(),
            request.goal_type.clone(),
            Uuid::new_v4().to_string(),
            request.verifier.clone(),
        );

        let mut task = Task::new(request.title.clone(), request.kind.clone(), TaskSource::Goal);
        task.parameters.goal_type = Some(request.goal_type.clone());
        task.parameters.intent_params.clone_from(&request.intent_params);
        if let Some(pos) = request.bot_position {
            task.parameters.pos = Some(pos);
        }
        task.metadata.goal_binding = Some(binding);
        task.metadata.goal_key = Some(goal_key);
        task.metadata.stage = Some(TaskMetadata::STAGE_SKELETON.to_string());
        task
    }
}
