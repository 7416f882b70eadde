//! Side-effecting actions the task queue dispatches.
//!
//! Each action is registered by name; the registry is the executor's
//! `ActionDispatch`. Page edits are idempotent so at-least-once delivery is
//! harmless.

mod analyze;
mod cleanup;
mod error;
mod links;
mod meta;
mod page;
mod registry;
mod schema;
mod section;
mod traits;

pub use analyze::AnalyzeTargetAction;
pub use cleanup::CleanupSnapshotsAction;
pub use error::{ActionError, Result};
pub use links::InternalLinksAction;
pub use meta::UpdateMetaAction;
pub use registry::ActionRegistry;
pub use schema::AddSchemaAction;
pub use section::AddSectionAction;
pub use traits::{Action, ActionContext, ActionSpec};
