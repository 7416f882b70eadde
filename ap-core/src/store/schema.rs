/// Ordered migrations; index + 1 is the schema version.
pub(super) const MIGRATIONS: &[&str] = &[V1];

const V1: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    hash          TEXT PRIMARY KEY,
    decision_type TEXT NOT NULL,
    target_id     TEXT NOT NULL,
    action        TEXT NOT NULL,
    priority      TEXT NOT NULL,
    auto          INTEGER NOT NULL,
    confidence    REAL,
    source        TEXT NOT NULL,
    status        TEXT NOT NULL,
    reason        TEXT,
    created_at    INTEGER NOT NULL,
    decided_at    INTEGER,
    decided_by    TEXT
);
CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status, created_at);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    action_name     TEXT NOT NULL,
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL,
    available_at    INTEGER NOT NULL,
    last_error      TEXT,
    idempotency_key TEXT,
    decision_hash   TEXT,
    target_id       TEXT,
    snapshot_id     TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, available_at);
CREATE INDEX IF NOT EXISTS idx_tasks_idempotency ON tasks(idempotency_key);

CREATE TABLE IF NOT EXISTS snapshots (
    id               TEXT PRIMARY KEY,
    target_id        TEXT NOT NULL,
    captured_content TEXT NOT NULL,
    reason           TEXT NOT NULL,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_target ON snapshots(target_id, created_at);

CREATE TABLE IF NOT EXISTS rollbacks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_outcomes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind       TEXT NOT NULL,
    subject    TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_outcomes_time ON task_outcomes(created_at);

CREATE TABLE IF NOT EXISTS reliability_state (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    state      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credits (
    scope      TEXT PRIMARY KEY,
    balance    INTEGER NOT NULL CHECK (balance >= 0),
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    event      TEXT NOT NULL,
    subject    TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(created_at);
"#;
