//! Driver tests against fake cloud and SSH

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use optimizerd::errors::OrchestratorError;
use optimizerd::filesys::file::File;
use optimizerd::jobs::dependencies::DependencyProbe;
use optimizerd::jobs::driver::{self, STAGE_PREPARING, STAGE_UPLOAD_ARCHIVE};
use optimizerd::jobs::fsm::JobEvent;
use optimizerd::jobs::model::{JobStatus, RemoteJob};
use optimizerd::jobs::reconcile::Reconciler;
use optimizerd::jobs::store::JobStore;
use optimizerd::storage::kv::{SSH_PRIVATE_KEY, SSH_PUBLIC_KEY};

use crate::fakes::{booting, running, FailingHandoffWrite, FakeCloud, FakeConnector, Harness};

/// Records the status a job had when the driver asked about dependencies
#[derive(Default)]
struct RecordingProbe {
    seen: Mutex<Vec<JobStatus>>,
}

#[async_trait]
impl DependencyProbe for RecordingProbe {
    async fn pending(&self, job: &RemoteJob) -> Result<usize, OrchestratorError> {
        self.seen.lock().unwrap().push(job.status);
        Ok(0)
    }
}

/// Stops the job from the outside while the driver waits on dependencies
struct StoppingProbe {
    store: Mutex<Option<Arc<JobStore>>>,
}

#[async_trait]
impl DependencyProbe for StoppingProbe {
    async fn pending(&self, job: &RemoteJob) -> Result<usize, OrchestratorError> {
        if let Some(store) = self.store.lock().unwrap().as_ref() {
            store.update(&job.id, |job| {
                job.apply(JobEvent::fail("stopped", "stopped by operator"), Utc::now())
            })?;
        }
        Ok(0)
    }
}

fn queue(harness: &Harness) -> String {
    let job = RemoteJob::new("momentum-v3", "Momentum v3", "ops@example.com", Utc::now());
    let id = job.id.clone();
    harness.store.insert(job);
    id
}

async fn assert_temp_files_gone(harness: &Harness, id: &str) {
    assert!(!File::new(harness.ctx.archive_path(id)).exists().await);
    assert!(!File::new(harness.ctx.script_path(id)).exists().await);
}

#[tokio::test]
async fn test_scenario_handoff_after_slow_boot() {
    let probe = Arc::new(RecordingProbe::default());
    let harness = Harness::with_probe(
        FakeCloud::new(42).script(vec![
            booting(42),
            booting(42),
            running(42, "203.0.113.5"),
        ]),
        FakeConnector::ready_after(2),
        probe.clone(),
    )
    .await;
    let id = queue(&harness);
    assert_eq!(harness.store.require(&id).unwrap().status, JobStatus::Queued);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(probe.seen.lock().unwrap().as_slice(), &[JobStatus::Running]);
    assert_eq!(job.status, JobStatus::Handoff);
    assert_eq!(job.remote_server_ip.as_deref(), Some("203.0.113.5"));
    assert_eq!(job.hetzner_server_id, Some(42));
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_none());

    assert_eq!(harness.connector.attempts(), 3);
    assert!(harness.cloud.deleted().is_empty());
    assert_eq!(harness.cloud.created_count(), 1);
    assert!(harness.mailer.sent().is_empty());

    let log = harness.connector.log.lock().unwrap();
    let remote = &harness.ctx.settings.remote;
    assert!(log.uploaded(&remote.archive_path(&id)));
    assert!(log.uploaded(&remote.snapshot_path()));
    assert!(log.uploaded(&remote.launcher_path()));
    assert_eq!(
        log.labels(),
        [
            "prepare workspace",
            "extract archive",
            "prepare data directory",
            "chmod launcher",
        ]
    );
    assert_eq!(log.launches.len(), 1);
    assert!(log.launches[0].contains("nohup setsid bash"));
    assert_eq!(log.closed, 1);
    drop(log);

    assert_temp_files_gone(&harness, &id).await;

    // durable record survives a reload
    let reloaded = JobStore::load(harness.jobs_file()).await.unwrap();
    let persisted = reloaded.require(&id).unwrap();
    assert_eq!(persisted.status, JobStatus::Handoff);
    assert_eq!(persisted.remote_server_ip.as_deref(), Some("203.0.113.5"));
}

#[tokio::test]
async fn test_server_request_is_labelled_and_named() {
    let harness = Harness::new(
        FakeCloud::new(42).fallback(Some(running(42, "203.0.113.5"))),
        FakeConnector::ready_after(0),
    )
    .await;
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let created = harness.cloud.created.lock().unwrap();
    let request = &created[0];
    assert!(request.name.starts_with("opt-momentum-v3-"));
    assert!(request.name.len() <= 63);
    assert_eq!(request.labels.get("managed-by").map(String::as_str), Some("optimizerd"));
    assert_eq!(request.labels.get("job").map(String::as_str), Some(id.as_str()));
    assert!(request.user_data.starts_with("#cloud-config"));
    assert!(request.user_data.contains("ssh-ed25519 "));
}

#[tokio::test]
async fn test_failed_extraction_cleans_up_and_notifies() {
    let harness = Harness::new(
        FakeCloud::new(42).fallback(Some(running(42, "203.0.113.5"))),
        FakeConnector::ready_after(0).failing_at("extract archive"),
    )
    .await;
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some(STAGE_UPLOAD_ARCHIVE));
    let details = job.failure_details.unwrap_or_default();
    assert!(details.contains("extract archive failed"));
    assert!(details.contains("tar: unexpected end of file"));

    assert_eq!(harness.cloud.deleted(), vec![42]);
    assert_eq!(job.hetzner_server_id, None);
    assert_eq!(job.remote_server_ip, None);
    assert_temp_files_gone(&harness, &id).await;

    let sent = harness.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ops@example.com");
    assert!(sent[0].subject.contains("[uploading-archive]"));
    assert!(harness.connector.log.lock().unwrap().launches.is_empty());
}

#[tokio::test]
async fn test_missing_snapshot_fails_before_provisioning() {
    let harness = Harness::new(FakeCloud::new(42), FakeConnector::ready_after(0)).await;
    std::fs::remove_file(&harness.ctx.settings.engine.data_file).unwrap();
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some(STAGE_PREPARING));
    assert!(job
        .failure_details
        .unwrap_or_default()
        .contains("market data snapshot"));
    assert_eq!(harness.cloud.created_count(), 0);
    assert!(harness.cloud.deleted().is_empty());
    assert_temp_files_gone(&harness, &id).await;
}

#[tokio::test]
async fn test_unacknowledged_launch_deletes_server() {
    let mut connector = FakeConnector::ready_after(0);
    connector.withhold_ack = true;
    let harness = Harness::new(
        FakeCloud::new(7).fallback(Some(running(7, "198.51.100.9"))),
        connector,
    )
    .await;
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some("launching"));
    assert_eq!(harness.cloud.deleted(), vec![7]);
    assert_temp_files_gone(&harness, &id).await;
}

#[tokio::test]
async fn test_server_vanishing_while_booting_fails() {
    let harness = Harness::new(
        FakeCloud::new(42).script(vec![booting(42)]).fallback(Some(
            optimizerd::cloud::models::ServerLookup::Missing,
        )),
        FakeConnector::ready_after(0),
    )
    .await;
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some("waiting-for-ip"));
    assert_eq!(harness.connector.attempts(), 0);
}

#[tokio::test]
async fn test_stop_while_driving_is_not_overwritten() {
    let probe = Arc::new(StoppingProbe {
        store: Mutex::new(None),
    });
    let harness = Harness::with_probe(
        FakeCloud::new(42),
        FakeConnector::ready_after(0),
        probe.clone(),
    )
    .await;
    *probe.store.lock().unwrap() = Some(harness.store.clone());
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some("stopped"));
    assert_eq!(harness.cloud.created_count(), 0);
    assert!(harness.mailer.sent().is_empty());
    assert!(!harness.store.is_driving(&id));
    assert_temp_files_gone(&harness, &id).await;
}

#[tokio::test]
async fn test_lost_handoff_write_keeps_the_run() {
    let harness = Harness::new(
        FakeCloud::new(42).fallback(Some(running(42, "203.0.113.5"))),
        FakeConnector::ready_after(0),
    )
    .await;
    let flaky = Arc::new(FailingHandoffWrite::new(harness.store.clone()));
    let harness = harness.with_flush(flaky.clone());
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    assert!(flaky.has_failed());
    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Handoff);
    assert_eq!(job.failure_stage, None);
    assert_eq!(job.hetzner_server_id, Some(42));
    assert!(harness.cloud.deleted().is_empty());
    assert!(harness.mailer.sent().is_empty());

    // the rescheduled write lands after the debounce delay
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let reloaded = JobStore::load(harness.jobs_file()).await.unwrap();
    assert_eq!(reloaded.require(&id).unwrap().status, JobStatus::Handoff);

    let report = Reconciler::new(harness.ctx.clone()).sweep().await;
    assert_eq!(report.released, 0);
    assert_eq!(report.failed, 0);
    assert!(harness.cloud.deleted().is_empty());
}

#[tokio::test]
async fn test_refused_cleanup_delete_leaves_server_for_sweep() {
    let harness = Harness::new(
        FakeCloud::new(42)
            .fallback(Some(running(42, "203.0.113.5")))
            .refusing_deletes(),
        FakeConnector::ready_after(0).failing_at("extract archive"),
    )
    .await;
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some(STAGE_UPLOAD_ARCHIVE));
    assert_eq!(job.hetzner_server_id, Some(42));
    assert_eq!(harness.cloud.delete_attempts(), 1);
    assert!(harness.cloud.deleted().is_empty());
    assert_eq!(harness.mailer.sent().len(), 1);
    assert_temp_files_gone(&harness, &id).await;

    harness.cloud.allow_deletes();
    let report = Reconciler::new(harness.ctx.clone()).sweep().await;

    assert_eq!(report.released, 1);
    assert_eq!(harness.cloud.deleted(), vec![42]);
    assert_eq!(harness.store.require(&id).unwrap().hetzner_server_id, None);
}

#[tokio::test]
async fn test_driver_never_generates_keys() {
    let harness = Harness::new(
        FakeCloud::new(42).fallback(Some(running(42, "203.0.113.5"))),
        FakeConnector::ready_after(0),
    )
    .await;
    harness.ctx.kv.set(SSH_PRIVATE_KEY, "").await.unwrap();
    harness.ctx.kv.set(SSH_PUBLIC_KEY, "").await.unwrap();
    let id = queue(&harness);

    driver::drive(harness.ctx.clone(), id.clone()).await;

    assert_eq!(harness.ctx.kv.get(SSH_PRIVATE_KEY).await.unwrap(), None);
    assert_eq!(harness.ctx.kv.get(SSH_PUBLIC_KEY).await.unwrap(), None);

    let created = harness.cloud.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert!(!created[0].user_data.contains("ssh-ed25519"));

    let job = harness.store.require(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_stage.as_deref(), Some("waiting-for-ssh"));
    assert_eq!(harness.connector.attempts(), 0);
    assert_eq!(harness.cloud.deleted(), vec![42]);
}
