//! Mail API client tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Form, Router};
use tokio::net::TcpListener;

use optimizerd::errors::OrchestratorError;
use optimizerd::notify::mailgun::MailgunMailer;
use optimizerd::notify::{DeliveryOutcome, EmailMessage, Mailer};
use optimizerd::storage::kv::{KeyValueStore, MemoryKvStore, MAIL_API_KEY, MAIL_FROM};

#[derive(Debug, Clone)]
struct Delivery {
    domain: String,
    authorization: String,
    form: HashMap<String, String>,
}

type Inbox = Arc<Mutex<Vec<Delivery>>>;

async fn messages(
    State(inbox): State<Inbox>,
    Path(domain): Path<String>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if domain == "broken.example.com" {
        return StatusCode::BAD_REQUEST;
    }
    inbox.lock().unwrap().push(Delivery {
        domain,
        authorization,
        form,
    });
    StatusCode::OK
}

async fn spawn_mail_api() -> (String, Inbox) {
    let inbox = Inbox::default();
    let app = Router::new()
        .route("/v3/{domain}/messages", post(messages))
        .with_state(inbox.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/v3", addr), inbox)
}

fn message() -> EmailMessage {
    EmailMessage {
        to: "ops@example.com".to_string(),
        subject: "[optimizerd] job failed [launching]".to_string(),
        text: "remote launch was not acknowledged".to_string(),
    }
}

fn mailer(base: &str, from: &str) -> MailgunMailer {
    let kv: Arc<dyn KeyValueStore> = Arc::new(
        MemoryKvStore::new()
            .with(MAIL_API_KEY, "key-123")
            .with(MAIL_FROM, from),
    );
    MailgunMailer::new(base, kv).unwrap()
}

#[tokio::test]
async fn test_sends_form_with_basic_auth() {
    let (base, inbox) = spawn_mail_api().await;
    let mailer = mailer(&base, "Optimizer <bot@mail.example.com>");

    let outcome = mailer.send(&message()).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Sent);

    let inbox = inbox.lock().unwrap();
    assert_eq!(inbox.len(), 1);
    let delivery = &inbox[0];
    assert_eq!(delivery.domain, "mail.example.com");
    // base64("api:key-123")
    assert_eq!(delivery.authorization, "Basic YXBpOmtleS0xMjM=");
    assert_eq!(delivery.form["to"], "ops@example.com");
    assert_eq!(delivery.form["from"], "Optimizer <bot@mail.example.com>");
    assert!(delivery.form["subject"].contains("[launching]"));
    assert_eq!(delivery.form["text"], "remote launch was not acknowledged");
}

#[tokio::test]
async fn test_rejected_send_is_an_error() {
    let (base, inbox) = spawn_mail_api().await;
    let mailer = mailer(&base, "bot@broken.example.com");

    assert!(matches!(
        mailer.send(&message()).await,
        Err(OrchestratorError::Notification(_))
    ));
    assert!(inbox.lock().unwrap().is_empty());
}
