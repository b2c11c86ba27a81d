//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so it is safe to
//! re-run on every startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS execution (
    id              TEXT PRIMARY KEY NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed','cancelled','partial')),
    mode            TEXT NOT NULL CHECK(mode IN ('manual','scheduled','testing','resume')),
    config          TEXT NOT NULL,
    schedule_id     TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    updated_at      TEXT NOT NULL,
    issues          TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS execution_counter (
    execution_id    TEXT NOT NULL,
    name            TEXT NOT NULL,
    value           INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (execution_id, name)
);

CREATE TABLE IF NOT EXISTS phase_status (
    execution_id    TEXT NOT NULL,
    phase           TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed','blocked')),
    started_at      TEXT,
    completed_at    TEXT,
    updated_at      TEXT NOT NULL,
    error_message   TEXT,
    result_data     TEXT,
    PRIMARY KEY (execution_id, phase)
);

CREATE TABLE IF NOT EXISTS keyword_metrics (
    execution_id    TEXT NOT NULL,
    keyword         TEXT NOT NULL,
    region          TEXT NOT NULL,
    search_volume   INTEGER,
    difficulty      REAL,
    fetched_at      TEXT NOT NULL,
    PRIMARY KEY (execution_id, keyword, region)
);

CREATE TABLE IF NOT EXISTS search_result (
    execution_id    TEXT NOT NULL,
    keyword         TEXT NOT NULL,
    region          TEXT NOT NULL,
    content_type    TEXT NOT NULL,
    url             TEXT NOT NULL,
    domain          TEXT NOT NULL,
    position        INTEGER NOT NULL,
    title           TEXT,
    collected_at    TEXT NOT NULL,
    PRIMARY KEY (execution_id, keyword, region, content_type, url)
);

CREATE TABLE IF NOT EXISTS enrichment (
    execution_id    TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK(kind IN ('company','video')),
    target          TEXT NOT NULL,
    profile         TEXT,
    enriched_at     TEXT NOT NULL,
    PRIMARY KEY (execution_id, kind, target)
);

CREATE TABLE IF NOT EXISTS content (
    execution_id    TEXT NOT NULL,
    url             TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('fetched','failed')),
    body            TEXT,
    content_length  INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    fetched_at      TEXT NOT NULL,
    PRIMARY KEY (execution_id, url)
);

CREATE TABLE IF NOT EXISTS content_analysis (
    execution_id      TEXT NOT NULL,
    url               TEXT NOT NULL,
    scores            TEXT NOT NULL,
    primary_dimension TEXT,
    analyzed_at       TEXT NOT NULL,
    PRIMARY KEY (execution_id, url)
);

CREATE TABLE IF NOT EXISTS score (
    execution_id    TEXT PRIMARY KEY NOT NULL,
    value           REAL NOT NULL,
    components      TEXT NOT NULL,
    computed_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS health_alert (
    id              TEXT PRIMARY KEY NOT NULL,
    execution_id    TEXT NOT NULL,
    message         TEXT NOT NULL,
    runtime_minutes INTEGER NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('active','resolved')),
    created_at      TEXT NOT NULL,
    resolved_at     TEXT
);

CREATE TABLE IF NOT EXISTS schedule_config (
    id                        TEXT PRIMARY KEY NOT NULL,
    name                      TEXT NOT NULL,
    active                    INTEGER NOT NULL DEFAULT 1,
    content_schedules         TEXT NOT NULL,
    keywords                  TEXT NOT NULL,
    regions                   TEXT NOT NULL,
    max_concurrent_executions INTEGER NOT NULL,
    template                  TEXT NOT NULL,
    next_execution_at         TEXT,
    last_executed_at          TEXT,
    created_at                TEXT NOT NULL,
    updated_at                TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule_execution (
    id              TEXT PRIMARY KEY NOT NULL,
    schedule_id     TEXT NOT NULL,
    execution_id    TEXT NOT NULL,
    content_types   TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('started','completed','partial','failed','cancelled','timed_out')),
    started_at      TEXT NOT NULL,
    finished_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_execution_status ON execution(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_phase_status ON phase_status(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_result_url ON search_result(execution_id, url);
CREATE INDEX IF NOT EXISTS idx_content_ready ON content(execution_id, status, url);
CREATE INDEX IF NOT EXISTS idx_alert_execution ON health_alert(execution_id);
CREATE INDEX IF NOT EXISTS idx_schedule_run ON schedule_execution(schedule_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
