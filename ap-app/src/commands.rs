//! Operator subcommands. Each prints its result as pretty JSON on stdout.

use crate::runtime::Autopilot;
use anyhow::Result;
use ap_core::{
    Actor, Analysis, CreditScope, DecisionStatus, NewTask, TransitionOutcome,
};
use serde::Serialize;
use serde_json::json;
use std::path::Path;

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn scope_for(actor: Option<&str>) -> CreditScope {
    match actor.map(str::trim).filter(|a| !a.is_empty()) {
        Some(actor) => CreditScope::actor(actor),
        None => CreditScope::Global,
    }
}

fn outcome_json(outcome: &TransitionOutcome) -> serde_json::Value {
    match outcome {
        TransitionOutcome::Changed(d) => json!({ "outcome": "changed", "decision": d }),
        TransitionOutcome::Unchanged(d) => json!({ "outcome": "unchanged", "decision": d }),
        TransitionOutcome::Enqueued { decision, task_id } => {
            json!({ "outcome": "enqueued", "decision": decision, "task_id": task_id })
        }
    }
}

pub fn doctor(app: &Autopilot, config_path: &Path) -> Result<()> {
    let guard = app.guard()?;
    print_json(&json!({
        "config_path": config_path.display().to_string(),
        "data_dir": app.cfg.data_dir_path().display().to_string(),
        "schema_version": app.store.schema_version()?,
        "providers": app.providers.provider_names(),
        "providers_available": app.providers.available(&guard),
        "global_credits": app.ledger.balance(&CreditScope::Global)?,
        "guard": guard,
        "reliability": app.breaker.state()?,
    }))
}

/// Feed a stored analysis document through the pipeline.
pub async fn ingest(app: &Autopilot, path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("read analysis {}: {e}", path.display()))?;
    let analysis: Analysis = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parse analysis {}: {e}", path.display()))?;
    let decisions = app.pipeline.run(&analysis, &app.guard()?).await?;
    print_json(&decisions)
}

/// Queue an `analyze_target` task; a serving worker picks it up.
pub fn analyze(
    app: &Autopilot,
    target_id: &str,
    instructions: Option<&str>,
    actor: Option<&str>,
) -> Result<()> {
    if let Some(actor) = actor {
        app.ensure_actor_grant(actor)?;
    }
    let payload = json!({ "instructions": instructions, "actor": actor });
    let task_id = app
        .queue
        .enqueue(NewTask::new("analyze_target", payload).for_target(target_id))?;
    print_json(&json!({ "task_id": task_id, "target_id": target_id }))
}

pub fn decisions(app: &Autopilot, status: Option<&str>, limit: usize) -> Result<()> {
    let status = status.map(str::parse::<DecisionStatus>).transpose()?;
    print_json(&app.approvals.list(status, limit)?)
}

pub async fn approve(app: &Autopilot, hash: &str, actor: &str) -> Result<()> {
    let outcome = app.approvals.approve(hash, &Actor::operator(actor)).await?;
    print_json(&outcome_json(&outcome))
}

pub async fn reject(app: &Autopilot, hash: &str, actor: &str, reason: &str) -> Result<()> {
    let outcome = app
        .approvals
        .reject(hash, &Actor::operator(actor), reason)
        .await?;
    print_json(&outcome_json(&outcome))
}

pub async fn apply(app: &Autopilot, hash: &str, actor: &str) -> Result<()> {
    let outcome = app
        .approvals
        .apply(hash, &Actor::operator(actor), &app.guard()?)
        .await?;
    print_json(&outcome_json(&outcome))
}

pub fn health(app: &Autopilot, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(app.cfg.reliability.window_days);
    print_json(&json!({
        "window_days": days,
        "health": app.breaker.health(days)?,
        "state": app.breaker.state()?,
    }))
}

pub async fn pause(app: &Autopilot, reason: &str) -> Result<()> {
    let state = app
        .breaker
        .pause(reason, json!({ "source": "operator" }))
        .await?;
    print_json(&state)
}

pub async fn resume(app: &Autopilot, reason: &str) -> Result<()> {
    print_json(&app.breaker.resume(reason).await?)
}

pub fn retry(app: &Autopilot, task_id: &str) -> Result<()> {
    print_json(&app.queue.retry_now(task_id)?)
}

pub fn dead_letters(app: &Autopilot, limit: usize) -> Result<()> {
    print_json(&app.queue.dead_letters(limit)?)
}

pub async fn rollback(app: &Autopilot, snapshot_id: &str) -> Result<()> {
    print_json(&app.snapshots.rollback(snapshot_id).await?)
}

pub async fn rollback_task(app: &Autopilot, task_id: &str) -> Result<()> {
    print_json(&app.snapshots.rollback_task(task_id).await?)
}

pub fn credits_grant(app: &Autopilot, amount: i64, actor: Option<&str>) -> Result<()> {
    if amount <= 0 {
        return Err(anyhow::anyhow!("grant amount must be positive"));
    }
    let scope = scope_for(actor);
    app.ledger.add(amount, &scope)?;
    credits_show(app, actor)
}

pub fn credits_show(app: &Autopilot, actor: Option<&str>) -> Result<()> {
    let scope = scope_for(actor);
    print_json(&json!({ "scope": scope.key(), "balance": app.ledger.balance(&scope)? }))
}

pub fn audit(app: &Autopilot, limit: usize) -> Result<()> {
    print_json(&app.audit.recent(limit)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_actor_bills_global_scope() {
        assert_eq!(scope_for(None), CreditScope::Global);
        assert_eq!(scope_for(Some("  ")), CreditScope::Global);
        assert_eq!(scope_for(Some("bob")), CreditScope::actor("bob"));
    }
}
