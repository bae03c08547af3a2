//! Database schema constants for the SQLite task store.

/// SQL schema for the task table.
///
/// `seq` doubles as creation order. The CHECK constraint mirrors the
/// invariant that a result reference exists exactly when a task is trained.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS recon_tasks (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT    NOT NULL UNIQUE,
    artifact_ref    TEXT    NOT NULL,
    input_path      TEXT    NOT NULL,
    working_dir     TEXT    NOT NULL UNIQUE,
    variant         TEXT    NOT NULL,
    status          TEXT    NOT NULL,
    result_ref      TEXT,
    failure         TEXT,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL,
    CHECK ((status = 'trained') = (result_ref IS NOT NULL))
)
"#;

/// Index for idempotent submission lookups.
pub const CREATE_ARTIFACT_VARIANT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_recon_tasks_artifact_variant
ON recon_tasks(artifact_ref, variant)
"#;

/// Index for admission scans by status.
pub const CREATE_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_recon_tasks_status ON recon_tasks(status, seq)
"#;

/// Single-row table holding the orchestrator instance lease.
///
/// `heartbeat_ms` is Unix milliseconds so expiry is an integer comparison.
pub const CREATE_LEASE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS recon_lease (
    name            TEXT    PRIMARY KEY,
    owner           TEXT    NOT NULL,
    pid             INTEGER NOT NULL,
    heartbeat_ms    INTEGER NOT NULL
)
"#;

/// Columns selected when loading a task.
pub const TASK_COLUMNS: &str = "seq, id, artifact_ref, input_path, working_dir, variant, \
     status, result_ref, failure, created_at, updated_at";

/// Returns all schema statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TASKS_TABLE,
        CREATE_ARTIFACT_VARIANT_INDEX,
        CREATE_STATUS_INDEX,
        CREATE_LEASE_TABLE,
    ]
}
