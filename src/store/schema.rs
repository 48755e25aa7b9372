//! SQLite schema constants.
//!
//! All tables are created with `IF NOT EXISTS` so the statements can be
//! replayed idempotently by the migration runner. `commit` is a SQL keyword
//! and is double-quoted wherever it appears.

/// Repositories known to the engine. Owned by the surrounding system; the
/// engine only flips `active` when a pipeline configuration is persisted.
pub const CREATE_REPOSITORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY,
    owner TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    full_name TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    clone_url TEXT NOT NULL DEFAULT '',
    branch TEXT NOT NULL DEFAULT 'main',
    active INTEGER NOT NULL DEFAULT 0
)
"#;

/// Per-repository pipeline configuration.
pub const CREATE_REPO_PIPELINE_CONFIGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repo_pipeline_configs (
    repo_id INTEGER PRIMARY KEY,
    content TEXT NOT NULL DEFAULT '',
    dockerfile TEXT NOT NULL DEFAULT '',
    cleanup_enabled INTEGER NOT NULL DEFAULT 1,
    retention_days INTEGER NOT NULL DEFAULT 0,
    max_records INTEGER NOT NULL DEFAULT 0,
    disallow_parallel INTEGER NOT NULL DEFAULT 0,
    cron_schedules TEXT NOT NULL DEFAULT '[]',
    cron_enabled INTEGER NOT NULL DEFAULT 0,
    cron_spec TEXT NOT NULL DEFAULT '',
    legacy_certificates TEXT NOT NULL DEFAULT '[]',
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
)
"#;

/// Pipeline runs; `number` is monotonically increasing per repository.
pub const CREATE_PIPELINES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    author TEXT NOT NULL DEFAULT '',
    event TEXT NOT NULL DEFAULT 'manual',
    status TEXT NOT NULL DEFAULT 'pending',
    branch TEXT NOT NULL DEFAULT '',
    "ref" TEXT NOT NULL DEFAULT '',
    "commit" TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    created INTEGER NOT NULL DEFAULT 0,
    started INTEGER NOT NULL DEFAULT 0,
    finished INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    additional_variables TEXT NOT NULL DEFAULT '{}',
    UNIQUE(repo_id, number)
)
"#;

/// Grouping node; exactly one per pipeline in this design.
pub const CREATE_WORKFLOWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'pending',
    started INTEGER NOT NULL DEFAULT 0,
    finished INTEGER NOT NULL DEFAULT 0
)
"#;

/// Sequential steps of the workflow; approval metadata is stored as JSON.
pub const CREATE_STEPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    ppid INTEGER NOT NULL DEFAULT 1,
    uuid TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    type TEXT NOT NULL DEFAULT 'commands',
    state TEXT NOT NULL DEFAULT 'pending',
    started INTEGER NOT NULL DEFAULT 0,
    finished INTEGER NOT NULL DEFAULT 0,
    exit_code INTEGER NOT NULL DEFAULT 0,
    failure TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL DEFAULT '',
    approval TEXT
)
"#;

/// Schedulable units; exactly one row per non-terminal pipeline.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    pipeline_id INTEGER NOT NULL,
    repo_id INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    data BLOB NOT NULL DEFAULT x'',
    labels TEXT NOT NULL DEFAULT '{}',
    run_on TEXT NOT NULL DEFAULT '[]',
    dependencies TEXT NOT NULL DEFAULT '[]',
    dep_status TEXT NOT NULL DEFAULT '{}'
)
"#;

/// Persisted log lines, append-only per step.
pub const CREATE_LOG_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    step_id INTEGER NOT NULL,
    time INTEGER NOT NULL DEFAULT 0,
    line INTEGER NOT NULL,
    type TEXT NOT NULL DEFAULT 'output',
    data BLOB NOT NULL DEFAULT x'',
    created INTEGER NOT NULL DEFAULT 0,
    UNIQUE(step_id, line)
)
"#;

/// Secondary indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipelines_repo_created ON pipelines(repo_id, created);
CREATE INDEX IF NOT EXISTS idx_pipelines_repo_status ON pipelines(repo_id, status);
CREATE INDEX IF NOT EXISTS idx_workflows_pipeline ON workflows(pipeline_id);
CREATE INDEX IF NOT EXISTS idx_steps_pipeline ON steps(pipeline_id, pid);
CREATE INDEX IF NOT EXISTS idx_tasks_pipeline ON tasks(pipeline_id);
CREATE INDEX IF NOT EXISTS idx_log_entries_step_line ON log_entries(step_id, line)
"#;

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_REPOSITORIES_TABLE,
        CREATE_REPO_PIPELINE_CONFIGS_TABLE,
        CREATE_PIPELINES_TABLE,
        CREATE_WORKFLOWS_TABLE,
        CREATE_STEPS_TABLE,
        CREATE_TASKS_TABLE,
        CREATE_LOG_ENTRIES_TABLE,
        CREATE_INDEXES,
    ]
}
