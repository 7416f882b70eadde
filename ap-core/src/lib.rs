//! Autopilot engine core.
//!
//! Turns analysis output into hashed decision records, gates outbound AI
//! calls behind credit and rate admission, runs side-effecting work through a
//! retrying task queue, and pauses itself when the failure rate spikes.
//! Every mutation is preceded by a snapshot so it can be rolled back.

pub mod analysis;
pub mod approval;
pub mod audit;
pub mod autopilot;
pub mod breaker;
pub mod credits;
pub mod decision;
pub mod error;
pub mod events;
pub mod executor;
pub mod generator;
pub mod guard;
pub mod knowledge;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod snapshot;
pub mod store;
pub mod target;

pub use analysis::{Analysis, ExistingContent, Heading, Recommendations, SectionSuggestion};
pub use approval::{Actor, ApprovalController, ReviewPolicy, TransitionOutcome};
pub use audit::AuditLog;
pub use autopilot::AutopilotListener;
pub use breaker::{
    Breaker, ConfidenceVerdict, Health, OutcomeKind, PauseState, ReliabilityState, Thresholds,
    debias_confidence,
};
pub use credits::{CreditLedger, CreditScope};
pub use decision::{
    Decision, DecisionAction, DecisionStatus, DecisionType, LinkSuggestion, Priority,
    ProposedDecision, decision_hash,
};
pub use error::{AutopilotError, Result};
pub use events::{AutopilotEvent, EventBus, EventListener};
pub use executor::{ActionDispatch, DispatchError, ExecutionReport, TaskExecutor};
pub use generator::DecisionGenerator;
pub use guard::GuardState;
pub use knowledge::{KnowledgeSource, NoKnowledge};
pub use pipeline::DecisionPipeline;
pub use providers::{
    AiProvider, AnalysisContext, GeminiProvider, OpenAiProvider, ProviderManager, ProviderResult,
};
pub use queue::{FailOutcome, NewTask, RetryPolicy, Task, TaskQueue, TaskStatus};
pub use rate_limit::RateLimiter;
pub use snapshot::{Snapshot, SnapshotService};
pub use store::SqliteStore;
pub use target::{FsTargetStore, MemoryTargetStore, Page, PageSection, TargetEdit, TargetStore};
