//! SQLite-backed document storage for identities and services.
//!
//! One short-lived connection per operation; connections are never held
//! across an await point. All service mutations are single-statement
//! UPDATEs keyed by id.

use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub mod identities;
pub mod services;

pub use identities::IdentityRecord;
pub use services::{ServiceRecord, ServiceStatus};

pub(crate) fn with_documents<T>(
    config: &Config,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let db_path = config.state_dir().join("documents.db");
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }

    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open document DB: {}", db_path.display()))?;

    // journal_mode returns the new mode as a row, so query_row it is
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
        .context("Failed to enable WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("Failed to set busy timeout")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS identities (
            id           TEXT PRIMARY KEY,
            owner        TEXT NOT NULL,
            type_tag     TEXT NOT NULL,
            params_enc   TEXT NOT NULL,
            token_enc    TEXT,
            alias        TEXT,
            uuid         TEXT,
            created_at   TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_owner_type_uuid
            ON identities(owner, type_tag, uuid) WHERE uuid IS NOT NULL;
        CREATE TABLE IF NOT EXISTS services (
            id             TEXT PRIMARY KEY,
            owner          TEXT NOT NULL,
            type_tag       TEXT NOT NULL,
            identity_id    TEXT NOT NULL,
            configuration  TEXT NOT NULL,
            status         TEXT NOT NULL DEFAULT 'up',
            failure_reason TEXT,
            runtime        TEXT,
            interval_ms    INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL,
            last_updated   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_services_owner ON services(owner);
        CREATE INDEX IF NOT EXISTS idx_services_status ON services(status);",
    )
    .context("Failed to initialize document schema")?;

    f(&conn)
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in document DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}
