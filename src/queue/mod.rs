//! Durable delayed-job queue keyed by service id.
//!
//! At-least-once delivery on SQLite: delayed visibility (`due_at`), an
//! atomic pending→running claim standing in for a lease, and
//! replace-on-schedule so a service can never accumulate more than one
//! outstanding job.

mod repository;

pub use repository::{
    JobOutcome, JobState, ScheduledJob, cancel, claim_due, complete, has_pending, list_failed,
    list_pending, retry, schedule,
};
