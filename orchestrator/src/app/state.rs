//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cloud::hetzner::HetznerClient;
use crate::errors::OrchestratorError;
use crate::jobs::context::JobContext;
use crate::jobs::dependencies::NoDependencies;
use crate::jobs::manager::JobManager;
use crate::jobs::persist::DebouncedPersister;
use crate::jobs::reconcile::Reconciler;
use crate::jobs::store::{Flush, JobStore};
use crate::keys::provider;
use crate::notify::mailgun::MailgunMailer;
use crate::remote::session::SshConnector;
use crate::storage::kv::{JsonKvStore, KeyValueStore};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application state
pub struct AppState {
    pub settings: Arc<Settings>,

    /// Shared collaborators of drivers, the reconciler and the manager
    pub context: Arc<JobContext>,

    pub reconciler: Arc<Reconciler>,

    pub manager: Arc<JobManager>,
}

impl AppState {
    /// Open the stores and build the production clients
    pub async fn init(settings: Settings, layout: &StorageLayout) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");
        layout.setup().await?;

        let settings = Arc::new(settings);
        let kv: Arc<dyn KeyValueStore> = Arc::new(JsonKvStore::open(layout.kv_file()).await?);

        let store = Arc::new(JobStore::load(layout.jobs_file()).await?);
        let flush: Arc<dyn Flush> = store.clone();
        let persister = Arc::new(DebouncedPersister::new(flush, settings.persist_debounce()));

        match provider::ensure_key_pair(kv.as_ref()).await {
            Ok(status) if status.is_usable() => info!("SSH key pair: {:?}", status),
            Ok(status) => warn!("No usable SSH key pair ({:?}); jobs will fail at waiting-for-ssh", status),
            Err(e) => warn!("Could not ensure SSH key pair: {}", e),
        }

        let context = Arc::new(JobContext {
            settings: settings.clone(),
            store,
            persister,
            cloud: Arc::new(HetznerClient::new(&settings.cloud.api_base_url, kv.clone())?),
            connector: Arc::new(SshConnector::new(Duration::from_secs(
                settings.timeouts.ssh_handshake_secs,
            ))),
            kv: kv.clone(),
            mailer: Arc::new(MailgunMailer::new(&settings.mail.api_base_url, kv)?),
            dependencies: Arc::new(NoDependencies),
            temp_dir: layout.temp_dir().path().to_path_buf(),
        });

        Ok(Self::from_context(context))
    }

    /// Wire the reconciler and manager around an existing context
    pub fn from_context(context: Arc<JobContext>) -> Self {
        let reconciler = Arc::new(Reconciler::new(context.clone()));
        let manager = Arc::new(JobManager::new(context.clone(), reconciler.clone()));
        Self {
            settings: context.settings.clone(),
            context,
            reconciler,
            manager,
        }
    }

    /// Write out everything still waiting in the debounce window
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!(
            "Shutting down application state, {} job writes pending",
            self.context.persister.pending_count()
        );
        self.context.persister.flush_all().await
    }
}
