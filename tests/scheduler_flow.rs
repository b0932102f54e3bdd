//! End-to-end scheduler lifecycle: attach → first job → execute → re-arm →
//! disable → empty queue, plus the bounded-retry failure path.

use anyhow::Result;
use async_trait::async_trait;
use campanile::config::Config;
use campanile::identity::{CredentialStore, IdentityRegistry, TokenAuthority};
use campanile::scheduler::Scheduler;
use campanile::security::SecretCipher;
use campanile::service::{DriverContext, ServiceDriver, ServiceManager, ServiceRegistry};
use campanile::store::identities::{self, NewIdentity};
use campanile::store::services::{self, ServiceStatus};
use campanile::queue;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::time::{Duration, sleep};

const TEST_INTERVAL_MS: i64 = 50;

#[derive(Default)]
struct PulseState {
    update_calls: AtomicUsize,
    failing: AtomicBool,
}

/// Minimal driver with a controllable update: counts invocations and fails
/// on demand.
struct PulseDriver {
    state: Arc<PulseState>,
}

#[async_trait]
impl ServiceDriver for PulseDriver {
    fn type_tag(&self) -> &str {
        "pulse"
    }

    fn name(&self) -> &str {
        "Pulse"
    }

    fn description(&self) -> &str {
        "Test driver with scriptable updates"
    }

    fn category(&self) -> &str {
        "test"
    }

    fn identity_types(&self) -> Vec<&str> {
        vec!["test_sso"]
    }

    fn interval_ms(&self) -> i64 {
        TEST_INTERVAL_MS
    }

    async fn update(&self, _ctx: &DriverContext) -> Result<()> {
        self.state.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated upstream outage");
        }
        Ok(())
    }

    async fn prompt(&self, _ctx: &DriverContext, _question: &str) -> Result<String> {
        Ok("pulse".into())
    }
}

struct Harness {
    _tmp: TempDir,
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    manager: ServiceManager,
    state: Arc<PulseState>,
    identity_id: String,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = Config {
        workspace_dir: tmp.path().to_path_buf(),
        ..Config::default()
    };
    config.secrets.secret = Some("test-secret".into());
    // fast retries so the exhaustion path completes quickly, but slow
    // enough that one drain_due pass never swallows two attempts
    config.scheduler.backoff_base_ms = 100;
    let config = Arc::new(config);

    let state = Arc::new(PulseState::default());
    let mut drivers = ServiceRegistry::new();
    {
        let state = Arc::clone(&state);
        drivers.register(move || {
            Box::new(PulseDriver {
                state: Arc::clone(&state),
            })
        });
    }

    let cipher = Arc::new(SecretCipher::from_config(&config).unwrap());
    let credentials = CredentialStore::new(Arc::clone(&config), cipher);
    let authority = Arc::new(TokenAuthority::new(
        Arc::clone(&config),
        credentials,
        Arc::new(IdentityRegistry::new()),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&config),
        Arc::new(drivers),
        authority,
    ));
    let manager = ServiceManager::new(Arc::clone(&config), Arc::clone(&scheduler));

    let identity_id = identities::insert_identity(
        &config,
        NewIdentity {
            owner: "user-1".into(),
            type_tag: "test_sso".into(),
            params_enc: "{}".into(),
            token_enc: None,
            alias: None,
            uuid: Some("u-1".into()),
        },
    )
    .unwrap()
    .id;

    Harness {
        _tmp: tmp,
        config,
        scheduler,
        manager,
        state,
        identity_id,
    }
}

#[tokio::test]
async fn lifecycle_attach_execute_rearm_disable() {
    let h = harness();

    let service = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();

    // attach ran the first update inline and armed exactly one job
    assert_eq!(h.state.update_calls.load(Ordering::SeqCst), 1);
    let pending = queue::list_pending(&h.config).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].service_id, service.id);

    let before_run = services::find_service(&h.config, &service.id)
        .unwrap()
        .unwrap()
        .last_updated;

    // let the job come due, then pump the worker once
    sleep(Duration::from_millis(2 * TEST_INTERVAL_MS as u64)).await;
    let handled = h.scheduler.drain_due().await.unwrap();
    assert_eq!(handled, 1);
    assert_eq!(h.state.update_calls.load(Ordering::SeqCst), 2);

    // status unchanged, exactly one follow-up job, lastUpdated advanced
    let current = services::find_service(&h.config, &service.id)
        .unwrap()
        .unwrap();
    assert_eq!(current.status, ServiceStatus::Up);
    assert!(current.last_updated > before_run);

    let pending = queue::list_pending(&h.config).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].due_at > chrono::Utc::now() - chrono::Duration::seconds(1));

    // disable cancels the pending job
    h.manager
        .set_enabled("user-1", &service.id, false)
        .unwrap();
    assert!(queue::list_pending(&h.config).unwrap().is_empty());
    assert_eq!(
        services::find_service(&h.config, &service.id)
            .unwrap()
            .unwrap()
            .status,
        ServiceStatus::Disabled
    );

    // re-enable arms a fresh job immediately, without waiting for a sweep
    h.manager.set_enabled("user-1", &service.id, true).unwrap();
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);

    // removal cancels as well
    h.manager.remove("user-1", &service.id).unwrap();
    assert!(queue::list_pending(&h.config).unwrap().is_empty());
    assert!(
        services::find_service(&h.config, &service.id)
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn exhausted_retries_park_service_as_failed() {
    let h = harness();

    let service = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();
    let calls_after_attach = h.state.update_calls.load(Ordering::SeqCst);

    h.state.failing.store(true, Ordering::SeqCst);

    // drive the job through all five attempts (backoff base is 1ms)
    let max_attempts = h.config.scheduler.max_attempts as usize;
    let mut executed = 0;
    for _ in 0..200 {
        sleep(Duration::from_millis(60)).await;
        executed += h.scheduler.drain_due().await.unwrap();
        if executed >= max_attempts {
            break;
        }
    }
    assert_eq!(executed, max_attempts);
    assert_eq!(
        h.state.update_calls.load(Ordering::SeqCst),
        calls_after_attach + max_attempts
    );

    let current = services::find_service(&h.config, &service.id)
        .unwrap()
        .unwrap();
    assert_eq!(current.status, ServiceStatus::Failed);
    let reason = current.failure_reason.unwrap();
    assert!(reason.contains("simulated upstream outage"));

    // the job is parked, not deleted, and never retried again
    assert!(queue::list_pending(&h.config).unwrap().is_empty());
    assert_eq!(queue::list_failed(&h.config).unwrap().len(), 1);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(h.scheduler.drain_due().await.unwrap(), 0);

    // an explicit re-enable brings it back
    h.state.failing.store(false, Ordering::SeqCst);
    h.manager.set_enabled("user-1", &service.id, true).unwrap();
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);
    assert_eq!(
        services::find_service(&h.config, &service.id)
            .unwrap()
            .unwrap()
            .status,
        ServiceStatus::Up
    );
}

#[tokio::test]
async fn transient_failure_recovers_without_status_change() {
    let h = harness();

    let service = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();

    // first scheduled attempt fails, the retry succeeds
    h.state.failing.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(2 * TEST_INTERVAL_MS as u64)).await;
    assert_eq!(h.scheduler.drain_due().await.unwrap(), 1);

    h.state.failing.store(false, Ordering::SeqCst);
    let mut recovered = 0;
    for _ in 0..50 {
        sleep(Duration::from_millis(20)).await;
        recovered += h.scheduler.drain_due().await.unwrap();
        if recovered > 0 {
            break;
        }
    }
    assert_eq!(recovered, 1);

    // the service never left UP, and exactly one follow-up job is armed
    let current = services::find_service(&h.config, &service.id)
        .unwrap()
        .unwrap();
    assert_eq!(current.status, ServiceStatus::Up);
    assert!(current.failure_reason.is_none());
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);
    assert!(queue::list_failed(&h.config).unwrap().is_empty());
}

#[tokio::test]
async fn reconciliation_rearms_lost_jobs_idempotently() {
    let h = harness();

    let service = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();

    // simulate a crash that lost the queue contents
    queue::cancel(&h.config, &service.id).unwrap();
    assert!(queue::list_pending(&h.config).unwrap().is_empty());

    assert_eq!(h.scheduler.reconcile_now().unwrap(), 1);
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);

    // running the sweep again changes nothing
    assert_eq!(h.scheduler.reconcile_now().unwrap(), 0);
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);
}

#[tokio::test]
async fn job_for_deleted_service_is_dropped_silently() {
    let h = harness();

    let service = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();

    // delete the row out from under the queue, keeping the job
    services::delete_service(&h.config, &service.id).unwrap();
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);

    sleep(Duration::from_millis(2 * TEST_INTERVAL_MS as u64)).await;
    let handled = h.scheduler.drain_due().await.unwrap();
    assert_eq!(handled, 1);

    // the orphaned job is consumed without retries or failures
    assert!(queue::list_pending(&h.config).unwrap().is_empty());
    assert!(queue::list_failed(&h.config).unwrap().is_empty());
}

#[tokio::test]
async fn attach_fails_fast_on_bad_requests() {
    let h = harness();

    // unknown driver type
    let err = h
        .manager
        .attach("user-1", "cafeteria", &h.identity_id, json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cafeteria"));

    // unknown identity
    let err = h
        .manager
        .attach("user-1", "pulse", "ghost", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    // incompatible identity type
    let other = identities::insert_identity(
        &h.config,
        NewIdentity {
            owner: "user-1".into(),
            type_tag: "other_sso".into(),
            params_enc: "{}".into(),
            token_enc: None,
            alias: None,
            uuid: Some("u-2".into()),
        },
    )
    .unwrap();
    let err = h
        .manager
        .attach("user-1", "pulse", &other.id, json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot back"));

    // duplicate binding
    h.manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();
    let err = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));

    // nothing bad entered the queue
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);
}

#[tokio::test]
async fn manual_refresh_races_benignly_with_scheduled_job() {
    let h = harness();

    let service = h
        .manager
        .attach("user-1", "pulse", &h.identity_id, json!({}))
        .await
        .unwrap();

    // manual refresh while an automatic job is pending: both complete, and
    // replace semantics keep the queue at exactly one outstanding job
    h.manager.refresh("user-1", &service.id).await.unwrap();
    assert_eq!(h.state.update_calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue::list_pending(&h.config).unwrap().len(), 1);

    let current = services::find_service(&h.config, &service.id)
        .unwrap()
        .unwrap();
    assert_eq!(current.status, ServiceStatus::Up);
}
