use super::{parse_rfc3339, with_documents};
use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

/// One external credential binding.
///
/// `params_enc` and `token_enc` hold ciphertext; the credential store is the
/// only reader and writer of their plaintext.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: String,
    pub owner: String,
    pub type_tag: String,
    pub params_enc: String,
    pub token_enc: Option<String>,
    pub alias: Option<String>,
    pub uuid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

const COLUMNS: &str =
    "id, owner, type_tag, params_enc, token_enc, alias, uuid, created_at, last_updated";

type RawIdentityRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawIdentityRow> {
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
    ))
}

fn finish_record(raw: RawIdentityRow) -> Result<IdentityRecord> {
    let (id, owner, type_tag, params_enc, token_enc, alias, uuid, created_raw, updated_raw) = raw;
    Ok(IdentityRecord {
        id,
        owner,
        type_tag,
        params_enc,
        token_enc,
        alias,
        uuid,
        created_at: parse_rfc3339(&created_raw)?,
        last_updated: parse_rfc3339(&updated_raw)?,
    })
}

pub struct NewIdentity {
    pub owner: String,
    pub type_tag: String,
    pub params_enc: String,
    pub token_enc: Option<String>,
    pub alias: Option<String>,
    pub uuid: Option<String>,
}

pub fn insert_identity(config: &Config, identity: NewIdentity) -> Result<IdentityRecord> {
    let now = Utc::now();
    let id = Uuid::new_v4().to_string();

    with_documents(config, |conn| {
        conn.execute(
            "INSERT INTO identities (
                id, owner, type_tag, params_enc, token_enc, alias, uuid, created_at, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                identity.owner,
                identity.type_tag,
                identity.params_enc,
                identity.token_enc,
                identity.alias,
                identity.uuid,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to insert identity")?;
        Ok(())
    })?;

    Ok(IdentityRecord {
        id,
        owner: identity.owner,
        type_tag: identity.type_tag,
        params_enc: identity.params_enc,
        token_enc: identity.token_enc,
        alias: identity.alias,
        uuid: identity.uuid,
        created_at: now,
        last_updated: now,
    })
}

pub fn find_identity(config: &Config, id: &str) -> Result<Option<IdentityRecord>> {
    with_documents(config, |conn| {
        let parts = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM identities WHERE id = ?1"),
                params![id],
                raw_row,
            )
            .optional()
            .context("Failed to query identity")?;
        parts.map(finish_record).transpose()
    })
}

pub fn list_identities(config: &Config, owner: &str) -> Result<Vec<IdentityRecord>> {
    with_documents(config, |conn| {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM identities WHERE owner = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![owner], raw_row)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(finish_record(row?)?);
        }
        Ok(identities)
    })
}

/// Dedup lookup backing the one-binding-per-external-account invariant.
pub fn find_by_owner_type_uuid(
    config: &Config,
    owner: &str,
    type_tag: &str,
    uuid: &str,
) -> Result<Option<IdentityRecord>> {
    with_documents(config, |conn| {
        let parts = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM identities
                     WHERE owner = ?1 AND type_tag = ?2 AND uuid = ?3"
                ),
                params![owner, type_tag, uuid],
                raw_row,
            )
            .optional()
            .context("Failed to query identity by uuid")?;
        parts.map(finish_record).transpose()
    })
}

pub fn update_token_enc(config: &Config, id: &str, token_enc: Option<&str>) -> Result<()> {
    let changed = with_documents(config, |conn| {
        conn.execute(
            "UPDATE identities SET token_enc = ?1, last_updated = ?2 WHERE id = ?3",
            params![token_enc, Utc::now().to_rfc3339(), id],
        )
        .context("Failed to update identity token")
    })?;

    if changed == 0 {
        anyhow::bail!("Identity '{id}' not found");
    }
    Ok(())
}

pub fn update_params_enc(config: &Config, id: &str, params_enc: &str) -> Result<()> {
    let changed = with_documents(config, |conn| {
        conn.execute(
            "UPDATE identities SET params_enc = ?1, last_updated = ?2 WHERE id = ?3",
            params![params_enc, Utc::now().to_rfc3339(), id],
        )
        .context("Failed to update identity login parameters")
    })?;

    if changed == 0 {
        anyhow::bail!("Identity '{id}' not found");
    }
    Ok(())
}

pub fn delete_identity(config: &Config, id: &str) -> Result<bool> {
    let changed = with_documents(config, |conn| {
        conn.execute("DELETE FROM identities WHERE id = ?1", params![id])
            .context("Failed to delete identity")
    })?;
    Ok(changed > 0)
}
