use crate::analysis::Analysis;
use crate::decision::Decision;
use crate::error::Result;
use crate::events::{AutopilotEvent, EventBus};
use crate::generator::DecisionGenerator;
use crate::guard::GuardState;
use crate::store::DecisionRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Generator plus hashing, persistence and the single event fan-out point.
///
/// The pipeline does not know who consumes `DecisionProduced`; the queue
/// enqueuer, the audit log and notifiers all subscribe to the bus.
pub struct DecisionPipeline {
    generator: DecisionGenerator,
    repo: Arc<dyn DecisionRepository>,
    events: Arc<EventBus>,
}

impl DecisionPipeline {
    pub fn new(
        generator: DecisionGenerator,
        repo: Arc<dyn DecisionRepository>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            generator,
            repo,
            events,
        }
    }

    /// Hashed `planned` decisions for `analysis`, without persisting.
    pub fn generate(&self, analysis: &Analysis, now: DateTime<Utc>) -> Vec<Decision> {
        self.generator
            .generate(analysis)
            .into_iter()
            .filter_map(|p| match Decision::planned(p, now) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping decision that failed to hash");
                    None
                }
            })
            .collect()
    }

    /// Persist each generated decision keyed by hash and announce the new
    /// ones. Re-running identical input returns the stored records and
    /// emits nothing. Under emergency stop nothing is generated at all.
    #[tracing::instrument(level = "info", skip_all, fields(target_id = %analysis.target_id))]
    pub async fn run(&self, analysis: &Analysis, guard: &GuardState) -> Result<Vec<Decision>> {
        if guard.emergency_stop {
            tracing::warn!("emergency stop active; skipping decision generation");
            return Ok(Vec::new());
        }

        let generated = self.generate(analysis, Utc::now());
        let mut out = Vec::with_capacity(generated.len());
        let mut created = 0usize;
        for decision in generated {
            let (stored, inserted) = self.repo.insert_if_absent(&decision)?;
            if inserted {
                created += 1;
                tracing::info!(
                    hash = %stored.hash,
                    decision_type = stored.decision_type.as_str(),
                    priority = stored.priority.as_str(),
                    auto = stored.auto,
                    "decision planned"
                );
                self.events
                    .publish(AutopilotEvent::DecisionProduced {
                        decision: stored.clone(),
                        guard: guard.clone(),
                    })
                    .await;
            }
            out.push(stored);
        }
        tracing::info!(total = out.len(), created, "pipeline run complete");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SectionSuggestion;
    use crate::decision::DecisionStatus;
    use crate::events::EventListener;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventListener for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        async fn on_event(&self, _event: &AutopilotEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (DecisionPipeline, Arc<Counter>, SqliteStore) {
        let store = SqliteStore::open_in_memory().expect("open store");
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(Counter::default());
        bus.subscribe(counter.clone());
        let pipeline =
            DecisionPipeline::new(DecisionGenerator::default(), Arc::new(store.clone()), bus);
        (pipeline, counter, store)
    }

    fn analysis() -> Analysis {
        let mut a = Analysis::new("docs/setup");
        a.recommendations.sections = vec![SectionSuggestion {
            heading: "Install".to_string(),
            level: 2,
            body: String::new(),
        }];
        a.recommendations.schema_types = vec!["FAQPage".to_string()];
        a
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_or_re_emit() {
        let (pipeline, counter, store) = setup();
        let guard = GuardState::running();
        let first = pipeline.run(&analysis(), &guard).await.expect("first run");
        let second = pipeline.run(&analysis(), &guard).await.expect("second run");

        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|d| d.status == DecisionStatus::Planned));
        let hashes = |v: &[Decision]| v.iter().map(|d| d.hash.clone()).collect::<Vec<_>>();
        assert_eq!(hashes(&first), hashes(&second));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(
            DecisionRepository::list(&store, None, 10).expect("list").len(),
            2
        );
    }

    #[tokio::test]
    async fn emergency_stop_short_circuits() {
        let (pipeline, counter, store) = setup();
        let guard = GuardState::running().with_emergency_stop(true);
        let out = pipeline.run(&analysis(), &guard).await.expect("run");
        assert!(out.is_empty());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert!(DecisionRepository::list(&store, None, 10).expect("list").is_empty());
    }
}
