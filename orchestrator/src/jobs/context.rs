//! Collaborators shared by drivers, the reconciler and the manager

use std::path::PathBuf;
use std::sync::Arc;

use crate::cloud::CloudProvider;
use crate::jobs::dependencies::DependencyProbe;
use crate::jobs::persist::DebouncedPersister;
use crate::jobs::store::JobStore;
use crate::notify::Mailer;
use crate::remote::RemoteConnector;
use crate::storage::kv::KeyValueStore;
use crate::storage::settings::Settings;

pub struct JobContext {
    pub settings: Arc<Settings>,
    pub store: Arc<JobStore>,
    pub persister: Arc<DebouncedPersister>,
    pub cloud: Arc<dyn CloudProvider>,
    pub connector: Arc<dyn RemoteConnector>,
    pub kv: Arc<dyn KeyValueStore>,
    pub mailer: Arc<dyn Mailer>,
    pub dependencies: Arc<dyn DependencyProbe>,
    /// Per-job archives and launcher scripts
    pub temp_dir: PathBuf,
}

impl JobContext {
    pub fn archive_path(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(format!("job-{}.tar.gz", job_id))
    }

    pub fn script_path(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(format!("job-{}-launch.sh", job_id))
    }
}
