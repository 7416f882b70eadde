use super::schema::MIGRATIONS;
use super::{
    AuditEntry, AuditRepository, CreditRepository, DecisionRepository, OutcomeCounts,
    ReliabilityRepository, SnapshotRepository, TaskRepository,
};
use crate::breaker::{OutcomeKind, PauseState};
use crate::decision::{Decision, DecisionStatus};
use crate::error::{AutopilotError, Result};
use crate::queue::{FailOutcome, RetryPolicy, Task, TaskStatus};
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

const DECISION_COLUMNS: &str = "hash, decision_type, target_id, action, priority, auto, \
     confidence, source, status, reason, created_at, decided_at, decided_by";

const TASK_COLUMNS: &str = "id, action_name, payload, status, attempts, max_attempts, \
     available_at, last_error, idempotency_key, decision_hash, target_id, snapshot_id, \
     created_at, updated_at";

const SNAPSHOT_COLUMNS: &str = "id, target_id, captured_content, reason, created_at";

/// SQLite-backed implementation of every repository trait.
///
/// One connection behind a mutex; multi-row read-modify-write paths run in
/// `BEGIN IMMEDIATE` transactions so they also hold across processes that
/// share the database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |r| r.get(0),
            )?)
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| AutopilotError::Storage("sqlite connection mutex poisoned".to_string()))?;
        f(&mut guard)
    }

    fn immediate<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )?;
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, ms(Utc::now())],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_default()
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = AutopilotError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    Ok(Decision {
        hash: row.get(0)?,
        decision_type: parse_col(row, 1)?,
        target_id: row.get(2)?,
        action: json_col(row, 3)?,
        priority: parse_col(row, 4)?,
        auto: row.get(5)?,
        confidence: row.get(6)?,
        source: row.get(7)?,
        status: parse_col(row, 8)?,
        reason: row.get(9)?,
        created_at: from_ms(row.get(10)?),
        decided_at: row.get::<_, Option<i64>>(11)?.map(from_ms),
        decided_by: row.get(12)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        action_name: row.get(1)?,
        payload: json_col(row, 2)?,
        status: parse_col(row, 3)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        available_at: from_ms(row.get(6)?),
        last_error: row.get(7)?,
        idempotency_key: row.get(8)?,
        decision_hash: row.get(9)?,
        target_id: row.get(10)?,
        snapshot_id: row.get(11)?,
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get(0)?,
        target_id: row.get(1)?,
        captured_content: row.get(2)?,
        reason: row.get(3)?,
        created_at: from_ms(row.get(4)?),
    })
}

fn get_decision(conn: &Connection, hash: &str) -> Result<Option<Decision>> {
    Ok(conn
        .query_row(
            &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE hash = ?1"),
            [hash],
            decision_from_row,
        )
        .optional()?)
}

fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            task_from_row,
        )
        .optional()?)
}

fn require_task(conn: &Connection, id: &str) -> Result<Task> {
    get_task(conn, id)?.ok_or_else(|| AutopilotError::NotFound(format!("task {id}")))
}

fn require_running(task: &Task, to: &str) -> Result<()> {
    if task.status == TaskStatus::Running {
        return Ok(());
    }
    Err(AutopilotError::InvalidTransition {
        subject: format!("task {}", task.id),
        from: task.status.to_string(),
        to: to.to_string(),
    })
}

impl CreditRepository for SqliteStore {
    fn balance(&self, scope: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT balance FROM credits WHERE scope = ?1",
                    [scope],
                    |r| r.get(0),
                )
                .optional()?
                .unwrap_or(0))
        })
    }

    fn try_consume(&self, scope: &str, amount: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE credits SET balance = balance - ?2, updated_at = ?3
                 WHERE scope = ?1 AND balance >= ?2",
                params![scope, amount, ms(Utc::now())],
            )?;
            Ok(changed == 1)
        })
    }

    fn credit(&self, scope: &str, amount: i64) -> Result<i64> {
        self.immediate(|tx| {
            tx.execute(
                "INSERT INTO credits (scope, balance, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(scope) DO UPDATE SET
                    balance = balance + excluded.balance,
                    updated_at = excluded.updated_at",
                params![scope, amount, ms(Utc::now())],
            )?;
            Ok(tx.query_row(
                "SELECT balance FROM credits WHERE scope = ?1",
                [scope],
                |r| r.get(0),
            )?)
        })
    }

    fn seed(&self, scope: &str, amount: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO credits (scope, balance, updated_at) VALUES (?1, ?2, ?3)",
                params![scope, amount, ms(Utc::now())],
            )?;
            Ok(changed == 1)
        })
    }
}

impl DecisionRepository for SqliteStore {
    fn insert_if_absent(&self, d: &Decision) -> Result<(Decision, bool)> {
        let action = serde_json::to_string(&d.action)?;
        self.immediate(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO decisions (
                    hash, decision_type, target_id, action, priority, auto, confidence,
                    source, status, reason, created_at, decided_at, decided_by
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    d.hash,
                    d.decision_type.as_str(),
                    d.target_id,
                    action,
                    d.priority.as_str(),
                    d.auto,
                    d.confidence,
                    d.source,
                    d.status.as_str(),
                    d.reason,
                    ms(d.created_at),
                    d.decided_at.map(ms),
                    d.decided_by,
                ],
            )? == 1;
            let stored = get_decision(tx, &d.hash)?
                .ok_or_else(|| AutopilotError::Storage(format!("decision {} vanished", d.hash)))?;
            Ok((stored, inserted))
        })
    }

    fn get(&self, hash: &str) -> Result<Option<Decision>> {
        self.with_conn(|conn| get_decision(conn, hash))
    }

    fn transition(
        &self,
        hash: &str,
        from: &[DecisionStatus],
        to: DecisionStatus,
        actor: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Decision>> {
        self.immediate(|tx| {
            let Some(current) = get_decision(tx, hash)? else {
                return Ok(None);
            };
            if !from.contains(&current.status) {
                return Ok(None);
            }
            tx.execute(
                "UPDATE decisions SET
                    status = ?2,
                    decided_at = ?3,
                    decided_by = COALESCE(?4, decided_by),
                    reason = COALESCE(?5, reason)
                 WHERE hash = ?1",
                params![hash, to.as_str(), ms(at), actor, reason],
            )?;
            get_decision(tx, hash)
        })
    }

    fn list(&self, status: Option<DecisionStatus>, limit: usize) -> Result<Vec<Decision>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLUMNS} FROM decisions
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(
                    params![status.map(|s| s.as_str()), limit as i64],
                    decision_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

impl TaskRepository for SqliteStore {
    fn insert_or_get(&self, t: &Task) -> Result<(String, bool)> {
        let payload = serde_json::to_string(&t.payload)?;
        self.immediate(|tx| {
            if let Some(key) = t.idempotency_key.as_deref() {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM tasks
                         WHERE idempotency_key = ?1 AND status IN ('pending', 'running')
                         ORDER BY created_at LIMIT 1",
                        [key],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    return Ok((id, false));
                }
            }
            tx.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    t.id,
                    t.action_name,
                    payload,
                    t.status.as_str(),
                    t.attempts,
                    t.max_attempts,
                    ms(t.available_at),
                    t.last_error,
                    t.idempotency_key,
                    t.decision_hash,
                    t.target_id,
                    t.snapshot_id,
                    ms(t.created_at),
                    ms(t.updated_at),
                ],
            )?;
            Ok((t.id.clone(), true))
        })
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task(conn, id))
    }

    fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.immediate(|tx| {
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM tasks
                     WHERE status = 'pending' AND available_at <= ?1
                     ORDER BY available_at, created_at, rowid
                     LIMIT ?2",
                )?;
                stmt.query_map(params![ms(now), limit as i64], |r| r.get(0))?
                    .collect::<rusqlite::Result<_>>()?
            };
            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                let changed = tx.execute(
                    "UPDATE tasks SET status = 'running', updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, ms(now)],
                )?;
                if changed == 1 {
                    claimed.push(require_task(tx, &id)?);
                }
            }
            Ok(claimed)
        })
    }

    fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.immediate(|tx| {
            let task = require_task(tx, id)?;
            require_running(&task, TaskStatus::Executed.as_str())?;
            tx.execute(
                "UPDATE tasks SET status = 'executed', updated_at = ?2 WHERE id = ?1",
                params![id, ms(now)],
            )?;
            require_task(tx, id)
        })
    }

    fn fail(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
        permanent: bool,
    ) -> Result<FailOutcome> {
        self.immediate(|tx| {
            let task = require_task(tx, id)?;
            require_running(&task, "failed")?;
            let attempts = task.attempts.saturating_add(1);
            if permanent || attempts >= task.max_attempts {
                tx.execute(
                    "UPDATE tasks SET status = 'dead', attempts = ?2, last_error = ?3,
                        updated_at = ?4
                     WHERE id = ?1",
                    params![id, attempts, error, ms(now)],
                )?;
                return Ok(FailOutcome::Dead { attempts });
            }
            let available_at = now + policy.backoff(attempts);
            tx.execute(
                "UPDATE tasks SET status = 'pending', attempts = ?2, last_error = ?3,
                    available_at = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id, attempts, error, ms(available_at), ms(now)],
            )?;
            Ok(FailOutcome::Retrying {
                attempts,
                available_at,
            })
        })
    }

    fn reschedule_now(&self, id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.immediate(|tx| {
            let task = require_task(tx, id)?;
            if task.status.is_terminal() {
                return Err(AutopilotError::InvalidTransition {
                    subject: format!("task {id}"),
                    from: task.status.to_string(),
                    to: "pending".to_string(),
                });
            }
            tx.execute(
                "UPDATE tasks SET available_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, ms(now)],
            )?;
            require_task(tx, id)
        })
    }

    fn set_snapshot(&self, id: &str, snapshot_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET snapshot_id = ?2 WHERE id = ?1",
                params![id, snapshot_id],
            )?;
            if changed == 0 {
                return Err(AutopilotError::NotFound(format!("task {id}")));
            }
            Ok(())
        })
    }

    fn stale_running(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'running' AND updated_at < ?1
                 ORDER BY updated_at"
            ))?;
            let rows = stmt
                .query_map([ms(older_than)], task_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY updated_at DESC, rowid DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str()), limit as i64], task_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

impl SnapshotRepository for SqliteStore {
    fn insert(&self, s: &Snapshot) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO snapshots ({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    s.id,
                    s.target_id,
                    s.captured_content,
                    s.reason,
                    ms(s.created_at)
                ],
            )?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = ?1"),
                    [id],
                    snapshot_from_row,
                )
                .optional()?)
        })
    }

    fn latest_before(&self, target_id: &str, at: DateTime<Utc>) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                         WHERE target_id = ?1 AND created_at <= ?2
                         ORDER BY created_at DESC, rowid DESC
                         LIMIT 1"
                    ),
                    params![target_id, ms(at)],
                    snapshot_from_row,
                )
                .optional()?)
        })
    }

    fn list_for_target(&self, target_id: &str) -> Result<Vec<Snapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                 WHERE target_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt
                .query_map([target_id], snapshot_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn delete(&self, ids: &[String]) -> Result<usize> {
        self.immediate(|tx| {
            let mut deleted = 0;
            for id in ids {
                deleted += tx.execute("DELETE FROM snapshots WHERE id = ?1", [id])?;
            }
            Ok(deleted)
        })
    }

    fn distinct_targets(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT target_id FROM snapshots ORDER BY target_id")?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    fn record_rollback(&self, snapshot_id: &str, target_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rollbacks (snapshot_id, target_id, created_at) VALUES (?1, ?2, ?3)",
                params![snapshot_id, target_id, ms(at)],
            )?;
            Ok(())
        })
    }
}

impl ReliabilityRepository for SqliteStore {
    fn record_outcome(&self, kind: OutcomeKind, subject: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_outcomes (kind, subject, created_at) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), subject, ms(at)],
            )?;
            Ok(())
        })
    }

    fn count_outcomes(&self, since: DateTime<Utc>) -> Result<OutcomeCounts> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, COUNT(*) FROM task_outcomes
                 WHERE created_at >= ?1
                 GROUP BY kind",
            )?;
            let rows = stmt
                .query_map([ms(since)], |r| {
                    Ok((parse_col::<OutcomeKind>(r, 0)?, r.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut counts = OutcomeCounts::default();
            for (kind, n) in rows {
                let n = n.max(0) as u64;
                match kind {
                    OutcomeKind::Applied => counts.applied = n,
                    OutcomeKind::Failed => counts.failed = n,
                    OutcomeKind::Rejected => counts.rejected = n,
                }
            }
            Ok(counts)
        })
    }

    fn load_pause(&self) -> Result<Option<PauseState>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT state FROM reliability_state WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()?;
            raw.map(|s| serde_json::from_str(&s).map_err(AutopilotError::from))
                .transpose()
        })
    }

    fn save_pause(&self, state: &PauseState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reliability_state (id, state, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![raw, ms(Utc::now())],
            )?;
            Ok(())
        })
    }
}

impl AuditRepository for SqliteStore {
    fn append(
        &self,
        event: &str,
        subject: &str,
        payload: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (event, subject, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event, subject, payload, ms(at)],
            )?;
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event, subject, payload, created_at FROM audit_log
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], |r| {
                    Ok(AuditEntry {
                        id: r.get(0)?,
                        event: r.get(1)?,
                        subject: r.get(2)?,
                        payload: json_col(r, 3)?,
                        created_at: from_ms(r.get(4)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionAction, Priority, ProposedDecision};
    use serde_json::json;

    fn planned(schema_type: &str) -> Decision {
        Decision::planned(
            ProposedDecision {
                target_id: "home".to_string(),
                action: DecisionAction::AddSchema {
                    schema_type: schema_type.to_string(),
                },
                priority: Priority::Medium,
                auto: true,
                source: "ai:schema_gap".to_string(),
                confidence: Some(0.8),
            },
            Utc::now(),
        )
        .expect("valid decision")
    }

    #[test]
    fn migrations_run_once_per_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("autopilot.db");
        let first = SqliteStore::open(&path).expect("open");
        assert_eq!(first.schema_version().expect("version"), MIGRATIONS.len() as i64);
        first.seed("global", 5).expect("seed");
        drop(first);

        let second = SqliteStore::open(&path).expect("reopen");
        assert_eq!(second.schema_version().expect("version"), MIGRATIONS.len() as i64);
        assert_eq!(second.balance("global").expect("balance"), 5);
    }

    #[test]
    fn decision_upsert_keeps_first_record() {
        let store = SqliteStore::open_in_memory().expect("open");
        let d = planned("FAQPage");
        let (stored, inserted) = store.insert_if_absent(&d).expect("insert");
        assert!(inserted);
        assert_eq!(stored.action, d.action);
        assert_eq!(stored.confidence, Some(0.8));

        let (again, inserted) = store.insert_if_absent(&d).expect("insert again");
        assert!(!inserted);
        assert_eq!(again.hash, d.hash);
        assert_eq!(DecisionRepository::list(&store, None, 10).expect("list").len(), 1);
    }

    #[test]
    fn transition_is_guarded_by_current_status() {
        let store = SqliteStore::open_in_memory().expect("open");
        let d = planned("Article");
        store.insert_if_absent(&d).expect("insert");
        let now = Utc::now();

        let moved = store
            .transition(
                &d.hash,
                &[DecisionStatus::Planned],
                DecisionStatus::Rejected,
                Some("alice"),
                Some("off-brand"),
                now,
            )
            .expect("reject")
            .expect("was planned");
        assert_eq!(moved.status, DecisionStatus::Rejected);
        assert_eq!(moved.decided_by.as_deref(), Some("alice"));
        assert_eq!(moved.reason.as_deref(), Some("off-brand"));

        let blocked = store
            .transition(
                &d.hash,
                &[DecisionStatus::Planned],
                DecisionStatus::Approved,
                Some("bob"),
                None,
                now,
            )
            .expect("approve");
        assert!(blocked.is_none());
        assert_eq!(
            DecisionRepository::list(&store, Some(DecisionStatus::Rejected), 10)
                .expect("list")
                .len(),
            1
        );
    }

    #[test]
    fn pause_state_and_audit_round_trip() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(store.load_pause().expect("load").is_none());
        let state = PauseState {
            paused: true,
            reason: Some("auto:fail_rate".to_string()),
            since: Some(from_ms(ms(Utc::now()))),
            meta: json!({ "fail_rate": 0.8 }),
            resumed_at: None,
        };
        store.save_pause(&state).expect("save");
        assert_eq!(store.load_pause().expect("load"), Some(state));

        store
            .append("paused", "reliability", &json!({ "x": 1 }), Utc::now())
            .expect("append");
        store
            .append("resumed", "reliability", &json!({}), Utc::now())
            .expect("append");
        let recent = store.recent(10).expect("recent");
        assert_eq!(recent[0].event, "resumed");
        assert_eq!(recent[1].payload["x"], 1);
    }

    #[test]
    fn credit_upsert_returns_new_balance() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert_eq!(store.credit("actor:a", 3).expect("credit"), 3);
        assert_eq!(store.credit("actor:a", 2).expect("credit"), 5);
        assert!(!store.seed("actor:a", 100).expect("seed existing"));
        assert!(store.try_consume("actor:a", 5).expect("consume"));
        assert!(!store.try_consume("actor:a", 1).expect("empty"));
    }
}
