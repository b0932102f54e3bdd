use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

/// A durable, delayed unit of scheduled work. Payload is the service id.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub service_id: String,
    pub due_at: DateTime<Utc>,
    /// Executions consumed so far, including the one currently running.
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Failed,
}

impl JobState {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_db(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// What `retry` decided for a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Re-queued with backoff; next execution at `due_at`.
    Retried { due_at: DateTime<Utc> },
    /// Attempt budget exhausted; the row is parked in the failed state.
    Exhausted,
    /// The row was replaced by a newer schedule call while this execution
    /// was in flight; nothing to account for.
    Superseded,
}

const COLUMNS: &str =
    "id, service_id, due_at, attempts, max_attempts, state, last_error, created_at";

type RawJobRow = (
    String,
    String,
    String,
    i64,
    i64,
    String,
    Option<String>,
    String,
);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawJobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_job(raw: RawJobRow) -> Result<ScheduledJob> {
    let (id, service_id, due_raw, attempts, max_attempts, state_raw, last_error, created_raw) = raw;
    Ok(ScheduledJob {
        id,
        service_id,
        due_at: parse_rfc3339(&due_raw)?,
        attempts: saturating_u32(attempts),
        max_attempts: saturating_u32(max_attempts).max(1),
        state: JobState::from_db(&state_raw),
        last_error,
        created_at: parse_rfc3339(&created_raw)?,
    })
}

/// Schedule a refresh for `service_id` after `delay`.
///
/// Replace semantics: any existing pending or running row for the service is
/// removed in the same transaction as the insert, so exactly one outstanding
/// job exists per service afterwards. Deleting running rows also collects
/// rows orphaned by a crash mid-execution.
pub fn schedule(config: &Config, service_id: &str, delay: Duration) -> Result<ScheduledJob> {
    let now = Utc::now();
    let due_at = now + delay;
    let id = Uuid::new_v4().to_string();
    let max_attempts = config.scheduler.max_attempts.max(1);

    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM service_jobs
             WHERE service_id = ?1 AND state IN ('pending', 'running')",
            params![service_id],
        )
        .context("Failed to replace prior job")?;
        tx.execute(
            "INSERT INTO service_jobs (
                id, service_id, due_at, attempts, max_attempts, state, created_at
             ) VALUES (?1, ?2, ?3, 0, ?4, 'pending', ?5)",
            params![
                id,
                service_id,
                due_at.to_rfc3339(),
                max_attempts,
                now.to_rfc3339()
            ],
        )
        .context("Failed to insert job")?;
        tx.commit().context("Failed to commit schedule")?;
        Ok(())
    })?;

    tracing::info!(service_id, job_id = %id, due_at = %due_at.to_rfc3339(), "scheduled service refresh");

    Ok(ScheduledJob {
        id,
        service_id: service_id.to_string(),
        due_at,
        attempts: 0,
        max_attempts,
        state: JobState::Pending,
        last_error: None,
        created_at: now,
    })
}

/// Remove all pending/running jobs for `service_id`. No-op when none exist.
/// Terminal failed rows are left for operational visibility.
pub fn cancel(config: &Config, service_id: &str) -> Result<usize> {
    let removed = with_connection(config, |conn| {
        conn.execute(
            "DELETE FROM service_jobs
             WHERE service_id = ?1 AND state IN ('pending', 'running')",
            params![service_id],
        )
        .context("Failed to cancel jobs")
    })?;

    if removed > 0 {
        tracing::info!(service_id, removed, "cancelled scheduled jobs");
    }
    Ok(removed)
}

pub fn list_pending(config: &Config) -> Result<Vec<ScheduledJob>> {
    list_in_state(config, JobState::Pending)
}

pub fn list_failed(config: &Config) -> Result<Vec<ScheduledJob>> {
    list_in_state(config, JobState::Failed)
}

fn list_in_state(config: &Config, state: JobState) -> Result<Vec<ScheduledJob>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM service_jobs WHERE state = ?1 ORDER BY due_at ASC"
        ))?;
        let rows = stmt.query_map(params![state.as_db()], raw_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(finish_job(row?)?);
        }
        Ok(jobs)
    })
}

pub fn has_pending(config: &Config, service_id: &str) -> Result<bool> {
    with_connection(config, |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM service_jobs WHERE service_id = ?1 AND state = 'pending'",
            params![service_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    })
}

/// Claim one due job for exclusive processing.
///
/// The pending→running transition is a conditional UPDATE; the rows-changed
/// check guarantees no two workers receive the same job. The attempt counter
/// is consumed at claim time.
pub fn claim_due(config: &Config, now: DateTime<Utc>) -> Result<Option<ScheduledJob>> {
    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;

        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM service_jobs
                     WHERE state = 'pending' AND due_at <= ?1
                     ORDER BY due_at ASC LIMIT 1"
                ),
                params![now.to_rfc3339()],
                raw_row,
            )
            .optional()
            .context("Failed to query due jobs")?;

        let Some(raw) = candidate else {
            return Ok(None);
        };
        let mut job = finish_job(raw)?;

        let claimed = tx
            .execute(
                "UPDATE service_jobs
                 SET state = 'running', attempts = attempts + 1
                 WHERE id = ?1 AND state = 'pending'",
                params![job.id],
            )
            .context("Failed to claim job")?;
        tx.commit().context("Failed to commit claim")?;

        if claimed == 0 {
            // Another worker won the row between select and update.
            return Ok(None);
        }

        job.state = JobState::Running;
        job.attempts += 1;
        Ok(Some(job))
    })
}

/// Delete a job after a successful (or no-op) execution.
pub fn complete(config: &Config, job: &ScheduledJob) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute("DELETE FROM service_jobs WHERE id = ?1", params![job.id])
            .context("Failed to complete job")?;
        Ok(())
    })
}

/// Account for a failed execution.
///
/// Below the attempt budget the job returns to pending with exponential
/// backoff (base × 2^attempt, zero-based); at the budget it is parked in the
/// terminal failed state and never retried automatically.
pub fn retry(config: &Config, job: &ScheduledJob, error: &str) -> Result<JobOutcome> {
    if job.attempts >= job.max_attempts {
        let changed = with_connection(config, |conn| {
            conn.execute(
                "UPDATE service_jobs SET state = 'failed', last_error = ?1
                 WHERE id = ?2 AND state = 'running'",
                params![error, job.id],
            )
            .context("Failed to park exhausted job")
        })?;
        return Ok(if changed == 0 {
            JobOutcome::Superseded
        } else {
            JobOutcome::Exhausted
        });
    }

    let exponent = job.attempts.saturating_sub(1).min(16);
    let backoff_ms = config.scheduler.backoff_base_ms.saturating_mul(1 << exponent);
    let due_at = Utc::now() + Duration::milliseconds(i64::try_from(backoff_ms).unwrap_or(i64::MAX));

    let changed = with_connection(config, |conn| {
        conn.execute(
            "UPDATE service_jobs SET state = 'pending', due_at = ?1, last_error = ?2
             WHERE id = ?3 AND state = 'running'",
            params![due_at.to_rfc3339(), error, job.id],
        )
        .context("Failed to re-queue job")
    })?;

    Ok(if changed == 0 {
        JobOutcome::Superseded
    } else {
        JobOutcome::Retried { due_at }
    })
}

fn saturating_u32(raw: i64) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in queue DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn with_connection<T>(config: &Config, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let db_path = config.queue_dir().join("jobs.db");
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create scheduler directory: {}", parent.display())
        })?;
    }

    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open queue DB: {}", db_path.display()))?;

    // journal_mode returns the new mode as a row, so query_row it is
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
        .context("Failed to enable WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("Failed to set busy timeout")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS service_jobs (
            id           TEXT PRIMARY KEY,
            service_id   TEXT NOT NULL,
            due_at       TEXT NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            state        TEXT NOT NULL DEFAULT 'pending',
            last_error   TEXT,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_service_jobs_due ON service_jobs(state, due_at);
        CREATE INDEX IF NOT EXISTS idx_service_jobs_service ON service_jobs(service_id);",
    )
    .context("Failed to initialize queue schema")?;

    f(&conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            workspace_dir: tmp.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn schedule_twice_leaves_exactly_one_job() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::milliseconds(1000)).unwrap();
        let second = schedule(&config, "svc-1", Duration::milliseconds(2000)).unwrap();

        let pending = list_pending(&config).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
        assert_eq!(pending[0].due_at, second.due_at);
    }

    #[test]
    fn schedule_does_not_disturb_other_services() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::milliseconds(1000)).unwrap();
        schedule(&config, "svc-2", Duration::milliseconds(1000)).unwrap();

        assert_eq!(list_pending(&config).unwrap().len(), 2);
    }

    #[test]
    fn cancel_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::milliseconds(10)).unwrap();
        assert_eq!(cancel(&config, "svc-1").unwrap(), 1);
        assert!(list_pending(&config).unwrap().is_empty());
        assert_eq!(cancel(&config, "svc-1").unwrap(), 0);
    }

    #[test]
    fn claim_due_skips_future_jobs() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::minutes(5)).unwrap();
        assert!(claim_due(&config, Utc::now()).unwrap().is_none());

        let later = Utc::now() + Duration::minutes(10);
        let claimed = claim_due(&config, later).unwrap().unwrap();
        assert_eq!(claimed.service_id, "svc-1");
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempts, 1);
    }

    #[test]
    fn claimed_job_cannot_be_claimed_again() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::zero()).unwrap();
        let later = Utc::now() + Duration::seconds(1);

        assert!(claim_due(&config, later).unwrap().is_some());
        assert!(claim_due(&config, later).unwrap().is_none());
    }

    #[test]
    fn retry_backs_off_exponentially() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::zero()).unwrap();
        let later = Utc::now() + Duration::seconds(1);

        let first = claim_due(&config, later).unwrap().unwrap();
        let before = Utc::now();
        let outcome = retry(&config, &first, "transient").unwrap();

        let JobOutcome::Retried { due_at } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        // first retry: base delay (5s), no doubling yet
        assert!(due_at >= before + Duration::milliseconds(4900));
        assert!(due_at <= before + Duration::milliseconds(6000));

        let pending = list_pending(&config).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("transient"));
    }

    #[test]
    fn retry_parks_job_after_max_attempts() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::zero()).unwrap();

        let mut outcome = None;
        for _ in 0..config.scheduler.max_attempts {
            let due = Utc::now() + Duration::days(365);
            let job = claim_due(&config, due).unwrap().expect("job should requeue");
            outcome = Some(retry(&config, &job, "still broken").unwrap());
        }

        assert_eq!(outcome, Some(JobOutcome::Exhausted));
        assert!(list_pending(&config).unwrap().is_empty());

        let failed = list_failed(&config).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, config.scheduler.max_attempts);
        assert_eq!(failed[0].last_error.as_deref(), Some("still broken"));

        // no sixth attempt: nothing claimable even far in the future
        let far = Utc::now() + Duration::days(999);
        assert!(claim_due(&config, far).unwrap().is_none());
    }

    #[test]
    fn replaced_running_job_reports_superseded() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::zero()).unwrap();
        let later = Utc::now() + Duration::seconds(1);
        let claimed = claim_due(&config, later).unwrap().unwrap();

        // a manual refresh re-arms the service while the job is in flight
        schedule(&config, "svc-1", Duration::minutes(1)).unwrap();

        let outcome = retry(&config, &claimed, "lost the race").unwrap();
        assert_eq!(outcome, JobOutcome::Superseded);
        assert_eq!(list_pending(&config).unwrap().len(), 1);
    }

    #[test]
    fn complete_removes_the_row() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        schedule(&config, "svc-1", Duration::zero()).unwrap();
        let later = Utc::now() + Duration::seconds(1);
        let claimed = claim_due(&config, later).unwrap().unwrap();
        complete(&config, &claimed).unwrap();

        assert!(list_pending(&config).unwrap().is_empty());
        assert!(!has_pending(&config, "svc-1").unwrap());
    }
}
