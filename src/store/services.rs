use super::{parse_rfc3339, with_documents};
use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use uuid::Uuid;

/// One recurring integration instance attached by a user.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub id: String,
    pub owner: String,
    pub type_tag: String,
    pub identity_id: String,
    pub configuration: Value,
    pub status: ServiceStatus,
    pub failure_reason: Option<String>,
    /// Driver-private cache; opaque to everything but the owning driver.
    pub runtime: Option<Value>,
    /// Refresh period in milliseconds; 0 means "never scheduled".
    pub interval_ms: i64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Up,
    Failed,
    Disabled,
}

impl ServiceStatus {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    pub(crate) fn from_db(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "failed" => Self::Failed,
            "disabled" => Self::Disabled,
            _ => Self::Up,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Up => "UP",
            Self::Failed => "FAILED",
            Self::Disabled => "DISABLED",
        };
        write!(f, "{label}")
    }
}

const COLUMNS: &str = "id, owner, type_tag, identity_id, configuration, status, \
                       failure_reason, runtime, interval_ms, created_at, last_updated";

type RawServiceRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
    String,
);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawServiceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn finish_record(raw: RawServiceRow) -> Result<ServiceRecord> {
    let (
        id,
        owner,
        type_tag,
        identity_id,
        configuration_raw,
        status_raw,
        failure_reason,
        runtime_raw,
        interval_ms,
        created_raw,
        updated_raw,
    ) = raw;

    Ok(ServiceRecord {
        id,
        owner,
        type_tag,
        identity_id,
        configuration: serde_json::from_str(&configuration_raw)
            .context("Invalid configuration JSON in service row")?,
        status: ServiceStatus::from_db(&status_raw),
        failure_reason,
        runtime: match runtime_raw {
            Some(raw) => Some(
                serde_json::from_str(&raw).context("Invalid runtime JSON in service row")?,
            ),
            None => None,
        },
        interval_ms,
        created_at: parse_rfc3339(&created_raw)?,
        last_updated: parse_rfc3339(&updated_raw)?,
    })
}

pub struct NewService {
    pub owner: String,
    pub type_tag: String,
    pub identity_id: String,
    pub configuration: Value,
    pub interval_ms: i64,
}

pub fn insert_service(config: &Config, service: NewService) -> Result<ServiceRecord> {
    let now = Utc::now();
    let id = Uuid::new_v4().to_string();
    let configuration_raw =
        serde_json::to_string(&service.configuration).context("Failed to encode configuration")?;

    with_documents(config, |conn| {
        conn.execute(
            "INSERT INTO services (
                id, owner, type_tag, identity_id, configuration, status,
                failure_reason, runtime, interval_ms, created_at, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'up', NULL, NULL, ?6, ?7, ?8)",
            params![
                id,
                service.owner,
                service.type_tag,
                service.identity_id,
                configuration_raw,
                service.interval_ms,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to insert service")?;
        Ok(())
    })?;

    Ok(ServiceRecord {
        id,
        owner: service.owner,
        type_tag: service.type_tag,
        identity_id: service.identity_id,
        configuration: service.configuration,
        status: ServiceStatus::Up,
        failure_reason: None,
        runtime: None,
        interval_ms: service.interval_ms,
        created_at: now,
        last_updated: now,
    })
}

pub fn find_service(config: &Config, id: &str) -> Result<Option<ServiceRecord>> {
    with_documents(config, |conn| {
        let parts = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM services WHERE id = ?1"),
                params![id],
                raw_row,
            )
            .optional()
            .context("Failed to query service")?;
        parts.map(finish_record).transpose()
    })
}

pub fn list_services(config: &Config, owner: &str) -> Result<Vec<ServiceRecord>> {
    with_documents(config, |conn| {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM services WHERE owner = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![owner], raw_row)?;

        let mut services = Vec::new();
        for row in rows {
            services.push(finish_record(row?)?);
        }
        Ok(services)
    })
}

pub fn list_all_services(config: &Config) -> Result<Vec<ServiceRecord>> {
    with_documents(config, |conn| {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM services ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], raw_row)?;

        let mut services = Vec::new();
        for row in rows {
            services.push(finish_record(row?)?);
        }
        Ok(services)
    })
}

pub fn services_with_status(config: &Config, status: ServiceStatus) -> Result<Vec<ServiceRecord>> {
    with_documents(config, |conn| {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM services WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_db()], raw_row)?;

        let mut services = Vec::new();
        for row in rows {
            services.push(finish_record(row?)?);
        }
        Ok(services)
    })
}

pub fn services_for_identity(config: &Config, identity_id: &str) -> Result<Vec<ServiceRecord>> {
    with_documents(config, |conn| {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM services WHERE identity_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![identity_id], raw_row)?;

        let mut services = Vec::new();
        for row in rows {
            services.push(finish_record(row?)?);
        }
        Ok(services)
    })
}

/// Duplicate-binding lookup: one service per (owner, type, identity).
pub fn find_duplicate(
    config: &Config,
    owner: &str,
    type_tag: &str,
    identity_id: &str,
) -> Result<Option<ServiceRecord>> {
    with_documents(config, |conn| {
        let parts = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM services
                     WHERE owner = ?1 AND type_tag = ?2 AND identity_id = ?3"
                ),
                params![owner, type_tag, identity_id],
                raw_row,
            )
            .optional()
            .context("Failed to query service duplicate")?;
        parts.map(finish_record).transpose()
    })
}

/// Stamp a successful refresh. A vanished service makes this a no-op.
pub fn touch_last_updated(config: &Config, id: &str) -> Result<()> {
    with_documents(config, |conn| {
        conn.execute(
            "UPDATE services SET last_updated = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )
        .context("Failed to stamp service update")?;
        Ok(())
    })
}

pub fn set_status(config: &Config, id: &str, status: ServiceStatus) -> Result<()> {
    let changed = with_documents(config, |conn| {
        conn.execute(
            "UPDATE services
             SET status = ?1, failure_reason = NULL, last_updated = ?2
             WHERE id = ?3",
            params![status.as_db(), Utc::now().to_rfc3339(), id],
        )
        .context("Failed to update service status")
    })?;

    if changed == 0 {
        anyhow::bail!("Service '{id}' not found");
    }
    Ok(())
}

pub fn mark_failed(config: &Config, id: &str, reason: &str) -> Result<()> {
    with_documents(config, |conn| {
        conn.execute(
            "UPDATE services
             SET status = 'failed', failure_reason = ?1, last_updated = ?2
             WHERE id = ?3",
            params![reason, Utc::now().to_rfc3339(), id],
        )
        .context("Failed to mark service failed")?;
        Ok(())
    })
}

pub fn set_runtime(config: &Config, id: &str, runtime: &Value) -> Result<()> {
    let raw = serde_json::to_string(runtime).context("Failed to encode runtime blob")?;
    with_documents(config, |conn| {
        conn.execute(
            "UPDATE services SET runtime = ?1 WHERE id = ?2",
            params![raw, id],
        )
        .context("Failed to update service runtime")?;
        Ok(())
    })
}

pub fn delete_service(config: &Config, id: &str) -> Result<bool> {
    let changed = with_documents(config, |conn| {
        conn.execute("DELETE FROM services WHERE id = ?1", params![id])
            .context("Failed to delete service")
    })?;
    Ok(changed > 0)
}
