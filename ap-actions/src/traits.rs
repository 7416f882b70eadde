use crate::error::{ActionError, Result};
use ap_core::{DecisionAction, GuardState};
use async_trait::async_trait;

pub struct ActionSpec {
    pub name: String,
    pub description: String,
    /// Writes to the task's target; the executor snapshots it first.
    pub mutates_target: bool,
}

pub struct ActionContext<'a> {
    pub task_id: &'a str,
    pub target_id: Option<&'a str>,
    pub guard: &'a GuardState,
}

impl ActionContext<'_> {
    pub fn require_target(&self) -> Result<&str> {
        self.target_id
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ActionError::InvalidArguments("task has no target_id".to_string()))
    }
}

#[async_trait]
pub trait Action: Send + Sync {
    fn spec(&self) -> ActionSpec;
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

pub(crate) fn parse_action(payload: serde_json::Value) -> Result<DecisionAction> {
    let action: DecisionAction = serde_json::from_value(payload)
        .map_err(|e| ActionError::InvalidArguments(format!("payload is not a decision action: {e}")))?;
    action
        .validate()
        .map_err(|e| ActionError::InvalidArguments(e.to_string()))?;
    Ok(action)
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ActionError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn wrong_variant(expected: &str, got: &DecisionAction) -> ActionError {
    ActionError::InvalidArguments(format!(
        "expected {expected} payload, got {}",
        got.decision_type().as_str()
    ))
}
