//! Job manager and HTTP surface tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

use optimizerd::errors::OrchestratorError;
use optimizerd::jobs::manager::{JobManager, STOP_STAGE};
use optimizerd::jobs::model::{JobStatus, RemoteJob};
use optimizerd::jobs::reconcile::Reconciler;
use optimizerd::server::handlers::ErrorResponse;
use optimizerd::server::serve::router;
use optimizerd::server::state::ServerState;

use crate::fakes::{running, FakeCloud, FakeConnector, Harness};

fn manager(harness: &Harness) -> Arc<JobManager> {
    let reconciler = Arc::new(Reconciler::new(harness.ctx.clone()));
    Arc::new(JobManager::new(harness.ctx.clone(), reconciler))
}

fn handed_off(harness: &Harness) -> String {
    let mut job = RemoteJob::new("momentum-v3", "Momentum v3", "ops@example.com", Utc::now());
    job.status = JobStatus::Handoff;
    job.started_at = Some(job.created_at);
    job.hetzner_server_id = Some(42);
    job.remote_server_ip = Some("203.0.113.5".to_string());
    let id = job.id.clone();
    harness.store.insert(job);
    id
}

async fn wait_for(harness: &Harness, id: &str, status: JobStatus) {
    for _ in 0..200 {
        let job = harness.store.require(id).unwrap();
        if job.status == status && !harness.store.is_driving(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} never reached {}", id, status);
}

#[tokio::test]
async fn test_trigger_runs_to_handoff() {
    let harness = Harness::new(
        FakeCloud::new(42).fallback(Some(running(42, "203.0.113.5"))),
        FakeConnector::ready_after(0),
    )
    .await;
    let manager = manager(&harness);

    let queued = manager
        .trigger_optimization("momentum-v3", "Momentum v3", "ops@example.com")
        .await
        .unwrap();
    assert_eq!(queued.job.status, JobStatus::Queued);

    wait_for(&harness, &queued.job.id, JobStatus::Handoff).await;
    let snapshot = manager.get_job(&queued.job.id).unwrap();
    assert_eq!(snapshot.job.hetzner_server_id, Some(42));
    assert!(snapshot.log_tail.iter().any(|line| line.contains("launch")));
}

#[tokio::test]
async fn test_blank_template_rejected() {
    let harness = Harness::new(FakeCloud::new(0), FakeConnector::ready_after(0)).await;
    let manager = manager(&harness);

    assert!(matches!(
        manager.trigger_optimization("  ", "", "ops").await,
        Err(OrchestratorError::InvalidState(_))
    ));
    assert!(harness.store.list().is_empty());
}

#[tokio::test]
async fn test_stop_deletes_server_once() {
    let harness = Harness::new(FakeCloud::new(0), FakeConnector::ready_after(0)).await;
    let manager = manager(&harness);
    let id = handed_off(&harness);

    let stopped = manager.stop_optimization(&id).await.unwrap();
    assert!(stopped.server_deleted);
    assert_eq!(stopped.job.job.status, JobStatus::Failed);
    assert_eq!(stopped.job.job.failure_stage.as_deref(), Some(STOP_STAGE));
    assert_eq!(stopped.job.job.hetzner_server_id, None);
    assert_eq!(harness.cloud.deleted(), vec![42]);
    // a manual stop is not a failure worth an email
    assert!(harness.mailer.sent().is_empty());

    assert!(matches!(
        manager.stop_optimization(&id).await,
        Err(OrchestratorError::InvalidState(_))
    ));
    assert_eq!(harness.cloud.deleted(), vec![42]);
}

#[tokio::test]
async fn test_remote_log_tail() {
    let harness = Harness::new(
        FakeCloud::new(0),
        FakeConnector::ready_after(0).with_remote_log("one\ntwo\nthree\nfour\n"),
    )
    .await;
    let manager = manager(&harness);
    let id = handed_off(&harness);

    let log = manager.get_remote_log(&id, Some(2)).await.unwrap();
    assert_eq!(log.log_text, "three\nfour");
    assert_eq!(log.tail_line_count, 2);
    assert_eq!(log.job.job.id, id);
    assert_eq!(harness.connector.log.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn test_remote_log_needs_an_active_server() {
    let harness = Harness::new(FakeCloud::new(0), FakeConnector::ready_after(0)).await;
    let manager = manager(&harness);
    let job = RemoteJob::new("momentum-v3", "Momentum v3", "ops", Utc::now());
    let id = job.id.clone();
    harness.store.insert(job);

    assert!(matches!(
        manager.get_remote_log(&id, None).await,
        Err(OrchestratorError::InvalidState(_))
    ));
    assert!(matches!(
        manager.get_remote_log("nope", None).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert_eq!(harness.connector.attempts(), 0);
}

// ================================= HTTP ===================================== //

async fn call(manager: Arc<JobManager>, request: Request<Body>) -> (StatusCode, Value) {
    let app = router(Arc::new(ServerState::new(manager)));
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_http_unknown_job_is_404() {
    let harness = Harness::new(FakeCloud::new(0), FakeConnector::ready_after(0)).await;

    let (status, body) = call(
        manager(&harness),
        Request::get("/jobs/does-not-exist").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert!(error.error.contains("does-not-exist"));
}

#[tokio::test]
async fn test_http_create_is_accepted() {
    let harness = Harness::new(
        FakeCloud::new(42).fallback(Some(running(42, "203.0.113.5"))),
        FakeConnector::ready_after(0),
    )
    .await;

    let (status, body) = call(
        manager(&harness),
        Request::post("/jobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"template_id":"momentum-v3","triggered_by":"ops"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["template_name"], "momentum-v3");
    let id = body["id"].as_str().unwrap().to_string();
    wait_for(&harness, &id, JobStatus::Handoff).await;
}

#[tokio::test]
async fn test_http_stop_on_finished_job_conflicts() {
    let harness = Harness::new(FakeCloud::new(0), FakeConnector::ready_after(0)).await;
    let mut job = RemoteJob::new("momentum-v3", "Momentum v3", "ops", Utc::now());
    job.status = JobStatus::Succeeded;
    let id = job.id.clone();
    harness.store.insert(job);

    let (status, body) = call(
        manager(&harness),
        Request::post(format!("/jobs/{}/stop", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("succeeded"));
}

#[tokio::test]
async fn test_http_health() {
    let harness = Harness::new(FakeCloud::new(0), FakeConnector::ready_after(0)).await;

    let (status, body) = call(
        manager(&harness),
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "optimizerd");
}

#[tokio::test]
async fn test_stop_with_refused_delete_still_fails_job() {
    let harness = Harness::new(
        FakeCloud::new(0).refusing_deletes(),
        FakeConnector::ready_after(0),
    )
    .await;
    let manager = manager(&harness);
    let id = handed_off(&harness);

    let stopped = manager.stop_optimization(&id).await.unwrap();

    assert!(!stopped.server_deleted);
    assert_eq!(stopped.job.job.status, JobStatus::Failed);
    assert_eq!(stopped.job.job.failure_stage.as_deref(), Some(STOP_STAGE));
    assert_eq!(stopped.job.job.hetzner_server_id, Some(42));
    assert_eq!(harness.cloud.delete_attempts(), 1);
    assert!(harness.cloud.deleted().is_empty());
}
