use crate::error::Result;
use crate::events::{AutopilotEvent, EventListener};
use crate::store::{AuditEntry, AuditRepository};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Persists every published event.
pub struct AuditLog {
    repo: Arc<dyn AuditRepository>,
}

impl AuditLog {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.repo.recent(limit)
    }
}

#[async_trait]
impl EventListener for AuditLog {
    fn name(&self) -> &str {
        "audit_log"
    }

    async fn on_event(&self, event: &AutopilotEvent) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        self.repo
            .append(event.name(), &event.subject(), &payload, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn records_events_newest_first() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let audit = Arc::new(AuditLog::new(Arc::new(store)));
        let bus = EventBus::new();
        bus.subscribe(audit.clone());

        bus.publish(AutopilotEvent::Paused {
            reason: "auto:fail_rate".to_string(),
            meta: serde_json::json!({ "sample": 10 }),
        })
        .await;
        bus.publish(AutopilotEvent::RolledBack {
            snapshot_id: "01SNAP".to_string(),
            target_id: "home".to_string(),
        })
        .await;

        let entries = audit.recent(10).expect("recent");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "rollback");
        assert_eq!(entries[0].subject, "01SNAP");
        assert_eq!(entries[1].payload["meta"]["sample"], 10);
    }
}
