//! Fakes for the orchestrator's trait seams

use std::collections::VecDeque;
use std::path::Path;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tempfile::TempDir;

use optimizerd::cloud::models::{
    CreateServerRequest, DeleteOutcome, ServerId, ServerInfo, ServerLookup, ServerStatus,
};
use optimizerd::cloud::CloudProvider;
use optimizerd::errors::OrchestratorError;
use optimizerd::filesys::file::File;
use optimizerd::jobs::context::JobContext;
use optimizerd::jobs::dependencies::{DependencyProbe, NoDependencies};
use optimizerd::jobs::persist::DebouncedPersister;
use optimizerd::jobs::store::{Flush, JobStore};
use optimizerd::keys::provider;
use optimizerd::notify::{DeliveryOutcome, EmailMessage, Mailer};
use optimizerd::remote::exec::CommandOutput;
use optimizerd::jobs::model::JobStatus;
use optimizerd::remote::tail::read_tail_from;
use optimizerd::remote::{RemoteConnector, RemoteSession, SshTarget};
use optimizerd::storage::kv::{MemoryKvStore, CLOUD_API_TOKEN, NOTIFICATION_EMAIL};
use optimizerd::storage::settings::Settings;

pub fn booting(id: ServerId) -> ServerLookup {
    ServerLookup::Found(ServerInfo {
        id,
        status: ServerStatus::Initializing,
        public_ipv4: None,
    })
}

pub fn running(id: ServerId, ip: &str) -> ServerLookup {
    ServerLookup::Found(ServerInfo {
        id,
        status: ServerStatus::Running,
        public_ipv4: Some(ip.to_string()),
    })
}

// ================================= CLOUD ===================================== //

/// Scripted control plane. Lookups come from the queue first, then the
/// fallback; no fallback means the API is down.
pub struct FakeCloud {
    next_id: ServerId,
    lookups: Mutex<VecDeque<ServerLookup>>,
    fallback: Mutex<Option<ServerLookup>>,
    pub created: Mutex<Vec<CreateServerRequest>>,
    pub deleted: Mutex<Vec<ServerId>>,
    pub get_calls: AtomicUsize,
    /// Deletes answer 500 while set
    refuse_deletes: AtomicBool,
    pub delete_attempts: AtomicUsize,
}

impl FakeCloud {
    pub fn new(next_id: ServerId) -> Self {
        Self {
            next_id,
            lookups: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            get_calls: AtomicUsize::new(0),
            refuse_deletes: AtomicBool::new(false),
            delete_attempts: AtomicUsize::new(0),
        }
    }

    pub fn refusing_deletes(self) -> Self {
        self.refuse_deletes.store(true, Ordering::SeqCst);
        self
    }

    pub fn allow_deletes(&self) {
        self.refuse_deletes.store(false, Ordering::SeqCst);
    }

    pub fn delete_attempts(&self) -> usize {
        self.delete_attempts.load(Ordering::SeqCst)
    }

    pub fn script(self, lookups: Vec<ServerLookup>) -> Self {
        *self.lookups.lock().unwrap() = lookups.into();
        self
    }

    pub fn fallback(self, lookup: Option<ServerLookup>) -> Self {
        *self.fallback.lock().unwrap() = lookup;
        self
    }

    pub fn deleted(&self) -> Vec<ServerId> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(
        &self,
        request: &CreateServerRequest,
    ) -> Result<ServerInfo, OrchestratorError> {
        self.created.lock().unwrap().push(request.clone());
        Ok(ServerInfo {
            id: self.next_id,
            status: ServerStatus::Initializing,
            public_ipv4: None,
        })
    }

    async fn get_server(&self, _id: ServerId) -> Result<ServerLookup, OrchestratorError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(lookup) = self.lookups.lock().unwrap().pop_front() {
            return Ok(lookup);
        }
        match self.fallback.lock().unwrap().clone() {
            Some(lookup) => Ok(lookup),
            None => Err(OrchestratorError::Provisioning {
                status: 503,
                body: "service unavailable".to_string(),
            }),
        }
    }

    async fn delete_server(&self, id: ServerId) -> Result<DeleteOutcome, OrchestratorError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_deletes.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Provisioning {
                status: 500,
                body: "internal server error".to_string(),
            });
        }
        let mut deleted = self.deleted.lock().unwrap();
        let outcome = if deleted.contains(&id) {
            DeleteOutcome::Missing
        } else {
            DeleteOutcome::Deleted
        };
        deleted.push(id);
        Ok(outcome)
    }
}

// ================================= REMOTE ===================================== //

/// Everything the sessions were asked to do
#[derive(Debug, Default)]
pub struct SessionLog {
    pub commands: Vec<(String, String)>,
    pub uploads: Vec<(String, u64)>,
    pub launches: Vec<String>,
    pub closed: usize,
}

impl SessionLog {
    pub fn labels(&self) -> Vec<String> {
        self.commands.iter().map(|(label, _)| label.clone()).collect()
    }

    pub fn uploaded(&self, remote_path: &str) -> bool {
        self.uploads.iter().any(|(path, _)| path == remote_path)
    }
}

pub struct FakeConnector {
    failures_left: AtomicUsize,
    pub attempts: AtomicUsize,
    pub log: Arc<Mutex<SessionLog>>,
    /// Synchronous command label that exits non-zero
    pub fail_label: Option<String>,
    /// Never acknowledge detached launches
    pub withhold_ack: bool,
    pub remote_log: Vec<u8>,
}

impl FakeConnector {
    /// Ready after `failures` refused attempts
    pub fn ready_after(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            log: Arc::new(Mutex::new(SessionLog::default())),
            fail_label: None,
            withhold_ack: false,
            remote_log: Vec::new(),
        }
    }

    pub fn failing_at(mut self, label: &str) -> Self {
        self.fail_label = Some(label.to_string());
        self
    }

    pub fn with_remote_log(mut self, contents: &str) -> Self {
        self.remote_log = contents.as_bytes().to_vec();
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        _private_key: &SecretString,
    ) -> Result<Box<dyn RemoteSession>, OrchestratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(OrchestratorError::Connectivity(format!(
                "connection to {} refused",
                target
            )));
        }
        Ok(Box::new(FakeSession {
            log: self.log.clone(),
            fail_label: self.fail_label.clone(),
            withhold_ack: self.withhold_ack,
            remote_log: self.remote_log.clone(),
        }))
    }
}

struct FakeSession {
    log: Arc<Mutex<SessionLog>>,
    fail_label: Option<String>,
    withhold_ack: bool,
    remote_log: Vec<u8>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, label: &str, script: &str) -> Result<CommandOutput, OrchestratorError> {
        self.log
            .lock()
            .unwrap()
            .commands
            .push((label.to_string(), script.to_string()));
        if self.fail_label.as_deref() == Some(label) {
            return Err(OrchestratorError::RemoteCommand {
                message: format!("{} failed with exit status 2", label),
                stdout: String::new(),
                stderr: "tar: unexpected end of file".to_string(),
            });
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn exec_detached(
        &self,
        _label: &str,
        launch: &str,
        ack_timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        self.log.lock().unwrap().launches.push(launch.to_string());
        if self.withhold_ack {
            return Err(OrchestratorError::AckTimeout {
                timeout_secs: ack_timeout.as_secs(),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<u64, OrchestratorError> {
        let size = std::fs::metadata(local)
            .map_err(|e| OrchestratorError::LocalIo(format!("{}: {}", local.display(), e)))?
            .len();
        self.log
            .lock()
            .unwrap()
            .uploads
            .push((remote_path.to_string(), size));
        Ok(size)
    }

    async fn upload_bytes(&self, contents: &[u8], remote_path: &str) -> Result<(), OrchestratorError> {
        self.log
            .lock()
            .unwrap()
            .uploads
            .push((remote_path.to_string(), contents.len() as u64));
        Ok(())
    }

    async fn read_tail(
        &self,
        _remote_path: &str,
        max_bytes: u64,
    ) -> Result<(Vec<u8>, bool), OrchestratorError> {
        let mut file = Cursor::new(self.remote_log.clone());
        let size = self.remote_log.len() as u64;
        Ok(read_tail_from(&mut file, size, max_bytes).await?)
    }

    async fn close(&self) {
        self.log.lock().unwrap().closed += 1;
    }
}

// ================================= MAIL ===================================== //

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<DeliveryOutcome, OrchestratorError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryOutcome::Sent)
    }
}

// ================================= HARNESS ===================================== //

pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<JobContext>,
    pub store: Arc<JobStore>,
    pub cloud: Arc<FakeCloud>,
    pub connector: Arc<FakeConnector>,
    pub mailer: Arc<RecordingMailer>,
}

pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.engine.source_dir = dir.join("engine");
    settings.engine.data_file = dir.join("market.snapshot");
    settings.timeouts.ip_wait_secs = 5;
    settings.timeouts.ip_poll_secs = 0;
    settings.timeouts.ssh_wait_secs = 5;
    settings.timeouts.ssh_poll_secs = 0;
    settings.timeouts.dependency_wait_secs = 5;
    settings.timeouts.dependency_poll_secs = 0;
    settings.persist_debounce_ms = 10;
    settings
}

impl Harness {
    pub async fn new(cloud: FakeCloud, connector: FakeConnector) -> Self {
        Self::with_probe(cloud, connector, Arc::new(NoDependencies)).await
    }

    pub async fn with_probe(
        cloud: FakeCloud,
        connector: FakeConnector,
        dependencies: Arc<dyn DependencyProbe>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());

        std::fs::create_dir_all(dir.path().join("engine/src")).unwrap();
        std::fs::write(dir.path().join("engine/run-optimization.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("engine/src/strategy.py"), "print('hi')\n").unwrap();
        std::fs::write(dir.path().join("market.snapshot"), vec![7u8; 4096]).unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();

        let store = Arc::new(
            JobStore::load(File::new(dir.path().join("jobs.json")))
                .await
                .unwrap(),
        );
        let flush: Arc<dyn Flush> = store.clone();
        let persister = Arc::new(DebouncedPersister::new(flush, settings.persist_debounce()));

        let kv = Arc::new(
            MemoryKvStore::new()
                .with(CLOUD_API_TOKEN, "test-token")
                .with(NOTIFICATION_EMAIL, "desk@example.com"),
        );
        provider::ensure_key_pair(kv.as_ref()).await.unwrap();
        let cloud = Arc::new(cloud);
        let connector = Arc::new(connector);
        let mailer = Arc::new(RecordingMailer::default());

        let ctx = Arc::new(JobContext {
            settings: Arc::new(settings),
            store: store.clone(),
            persister,
            cloud: cloud.clone(),
            connector: connector.clone(),
            kv,
            mailer: mailer.clone(),
            dependencies,
            temp_dir: dir.path().join("tmp"),
        });

        Self {
            dir,
            ctx,
            store,
            cloud,
            connector,
            mailer,
        }
    }

    pub fn jobs_file(&self) -> File {
        File::new(self.dir.path().join("jobs.json"))
    }

    /// Route every job write through `flush` instead of the store
    pub fn with_flush(mut self, flush: Arc<dyn Flush>) -> Self {
        let ctx = &self.ctx;
        let persister = Arc::new(DebouncedPersister::new(flush, ctx.settings.persist_debounce()));
        let ctx = Arc::new(JobContext {
            settings: ctx.settings.clone(),
            store: ctx.store.clone(),
            persister,
            cloud: ctx.cloud.clone(),
            connector: ctx.connector.clone(),
            kv: ctx.kv.clone(),
            mailer: ctx.mailer.clone(),
            dependencies: ctx.dependencies.clone(),
            temp_dir: ctx.temp_dir.clone(),
        });
        self.ctx = ctx;
        self
    }
}

// ================================= STORAGE ===================================== //

/// Fails the first write made once any job has reached hand-off
pub struct FailingHandoffWrite {
    store: Arc<JobStore>,
    failed: AtomicBool,
}

impl FailingHandoffWrite {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            failed: AtomicBool::new(false),
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Flush for FailingHandoffWrite {
    async fn flush(&self) -> Result<(), OrchestratorError> {
        let handed_off = self
            .store
            .list()
            .iter()
            .any(|job| job.status == JobStatus::Handoff);
        if handed_off && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::Storage("disk full".to_string()));
        }
        self.store.flush().await
    }
}
