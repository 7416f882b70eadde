//! Explicit fan-out of lifecycle events to subscribed listeners.

use crate::decision::Decision;
use crate::error::Result;
use crate::guard::GuardState;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AutopilotEvent {
    DecisionProduced {
        decision: Decision,
        guard: GuardState,
    },
    DecisionRejected {
        decision_hash: String,
        actor: String,
        reason: String,
    },
    TaskApproved {
        decision_hash: String,
        actor: String,
    },
    TaskApplied {
        task_id: String,
        decision_hash: Option<String>,
        snapshot_id: Option<String>,
    },
    TaskDead {
        task_id: String,
        decision_hash: Option<String>,
        error: String,
    },
    RolledBack {
        snapshot_id: String,
        target_id: String,
    },
    Paused {
        reason: String,
        meta: serde_json::Value,
    },
    Resumed {
        reason: String,
    },
}

impl AutopilotEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DecisionProduced { .. } => "decision_produced",
            Self::DecisionRejected { .. } => "decision_rejected",
            Self::TaskApproved { .. } => "task_approved",
            Self::TaskApplied { .. } => "task_applied",
            Self::TaskDead { .. } => "task_dead",
            Self::RolledBack { .. } => "rollback",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
        }
    }

    /// Key the event is about, for audit rows.
    pub fn subject(&self) -> String {
        match self {
            Self::DecisionProduced { decision, .. } => decision.hash.clone(),
            Self::DecisionRejected { decision_hash, .. }
            | Self::TaskApproved { decision_hash, .. } => decision_hash.clone(),
            Self::TaskApplied { task_id, .. } | Self::TaskDead { task_id, .. } => task_id.clone(),
            Self::RolledBack { snapshot_id, .. } => snapshot_id.clone(),
            Self::Paused { .. } | Self::Resumed { .. } => "reliability".to_string(),
        }
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;
    async fn on_event(&self, event: &AutopilotEvent) -> Result<()>;
}

/// Publisher with an explicit subscriber list.
///
/// A failing listener is logged and skipped; it never affects the
/// publisher or other listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub async fn publish(&self, event: AutopilotEvent) {
        let listeners: Vec<Arc<dyn EventListener>> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        tracing::debug!(event = event.name(), listeners = listeners.len(), "publishing event");
        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                tracing::warn!(
                    listener = listener.name(),
                    event = event.name(),
                    error = %e,
                    "event listener failed"
                );
            }
        }
    }
}
