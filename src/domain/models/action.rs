//! Action dispatch wire types.
//!
//! Requests go to the game-interface `/action` endpoint; responses come
//! back normalized so the executor sees one shape regardless of transport
//! or bot-side failure mode.

use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Executor operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Observe and log intended actions without dispatching
    Shadow,
    /// Dispatch actions to the bot
    Live,
}

impl Default for ExecutorMode {
    fn default() -> Self {
        Self::Shadow
    }
}

impl ExecutorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shadow => "shadow",
            Self::Live => "live",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shadow" => Some(Self::Shadow),
            "live" => Some(Self::Live),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Machine-readable failure code returned by a leaf execution.
///
/// Codes in the deterministic set short-circuit the retry loop: the task
/// fails immediately with no backoff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureCode(String);

impl FailureCode {
    pub const MAPPING_FAILURE: &'static str = "MAPPING_FAILURE";
    pub const CONTRACT_VIOLATION: &'static str = "CONTRACT_VIOLATION";
    pub const UNKNOWN_LEAF: &'static str = "UNKNOWN_LEAF";
    pub const BOT_UNAVAILABLE: &'static str = "BOT_UNAVAILABLE";
    pub const TIMEOUT: &'static str = "TIMEOUT";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this code maps to a deterministic failure (retrying the
    /// same step can never succeed).
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::MAPPING_FAILURE | Self::CONTRACT_VIOLATION | Self::UNKNOWN_LEAF
        )
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request dispatched to the game interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type")]
    pub action_type: String,
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ActionRequest {
    pub fn new(action_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            action_type: action_type.into(),
            parameters,
            timeout: None,
        }
    }

    /// Stamp the navigation lease scope so concurrent tasks cannot steal
    /// each other's path locks.
    pub fn with_nav_scope(mut self, task_id: TaskId) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.parameters {
            map.insert(
                "__nav".to_string(),
                serde_json::json!({ "scope": task_id.to_string() }),
            );
        }
        self
    }
}

/// Raw action outcome reported by the game interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Executed,
    Shadow,
    Error,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Shadow => "shadow",
            Self::Error => "error",
        }
    }
}

/// Normalized action response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub ok: bool,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<FailureCode>,
    /// The interface refused a live dispatch because it is shadow-pinned
    #[serde(default)]
    pub shadow_blocked: bool,
}

impl ActionResponse {
    pub fn executed() -> Self {
        Self {
            ok: true,
            outcome: ActionOutcome::Executed,
            data: None,
            error: None,
            failure_code: None,
            shadow_blocked: false,
        }
    }

    pub fn shadow() -> Self {
        Self {
            ok: true,
            outcome: ActionOutcome::Shadow,
            data: None,
            error: None,
            failure_code: None,
            shadow_blocked: true,
        }
    }

    pub fn failed(error: impl Into<String>, code: Option<FailureCode>) -> Self {
        Self {
            ok: false,
            outcome: ActionOutcome::Executed,
            data: None,
            error: Some(error.into()),
            failure_code: code,
            shadow_blocked: false,
        }
    }

    pub fn infra_error(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            outcome: ActionOutcome::Error,
            data: None,
            error: Some(error.into()),
            failure_code: Some(FailureCode::new(FailureCode::BOT_UNAVAILABLE)),
            shadow_blocked: false,
        }
    }

    /// Infra failures are transport/5xx-class outcomes, not leaf results.
    pub fn is_infra_failure(&self) -> bool {
        self.outcome == ActionOutcome::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deterministic_codes() {
        assert!(FailureCode::new(FailureCode::CONTRACT_VIOLATION).is_deterministic());
        assert!(FailureCode::new(FailureCode::MAPPING_FAILURE).is_deterministic());
        assert!(FailureCode::new(FailureCode::UNKNOWN_LEAF).is_deterministic());
        assert!(!FailureCode::new(FailureCode::TIMEOUT).is_deterministic());
        assert!(!FailureCode::new("SOMETHING_ELSE").is_deterministic());
    }

    #[test]
    fn test_nav_scope_stamp() {
        let task_id = uuid::Uuid::new_v4();
        let request =
            ActionRequest::new("move_to", json!({"pos": {"x": 1, "y": 64, "z": 1}})).with_nav_scope(task_id);
        assert_eq!(
            request.parameters["__nav"]["scope"],
            json!(task_id.to_string())
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(ExecutorMode::from_str("LIVE"), Some(ExecutorMode::Live));
        assert_eq!(ExecutorMode::from_str("shadow"), Some(ExecutorMode::Shadow));
        assert_eq!(ExecutorMode::from_str("observe"), None);
    }
}
