//! Service configuration file (`config.json`)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::logs::LogLevel;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for rotated log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Cloud vendor control plane
    #[serde(default)]
    pub cloud: CloudSettings,

    /// Local engine sources and market data
    #[serde(default)]
    pub engine: EngineSettings,

    /// Remote filesystem layout on the rented VM
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Client certificate bundle for certificate-locked platforms
    #[serde(default)]
    pub mtls: MtlsSettings,

    /// Stale-job sweep
    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    /// Driver polling ceilings and timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Outbound notification mail
    #[serde(default)]
    pub mail: MailSettings,

    /// Coalescing window for job-store writes, in milliseconds
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_persist_debounce_ms() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            server: ServerSettings::default(),
            cloud: CloudSettings::default(),
            engine: EngineSettings::default(),
            remote: RemoteSettings::default(),
            mtls: MtlsSettings::default(),
            reconciler: ReconcilerSettings::default(),
            timeouts: TimeoutSettings::default(),
            mail: MailSettings::default(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl Settings {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Reject settings that would only fail later, deep inside a job run
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        url::Url::parse(&self.cloud.api_base_url).map_err(|e| {
            OrchestratorError::Config(format!(
                "invalid cloud.api_base_url '{}': {}",
                self.cloud.api_base_url, e
            ))
        })?;
        url::Url::parse(&self.mail.api_base_url).map_err(|e| {
            OrchestratorError::Config(format!(
                "invalid mail.api_base_url '{}': {}",
                self.mail.api_base_url, e
            ))
        })?;
        if !self.remote.workspace_dir.starts_with('/') {
            return Err(OrchestratorError::Config(
                "remote.workspace_dir must be absolute".to_string(),
            ));
        }
        if self.mtls.enabled && (self.mtls.cert_path.is_none() || self.mtls.key_path.is_none()) {
            return Err(OrchestratorError::Config(
                "mtls.enabled requires cert_path and key_path".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8787
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Cloud control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    #[serde(default = "default_cloud_url")]
    pub api_base_url: String,

    #[serde(default = "default_server_type")]
    pub server_type: String,

    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default = "default_image")]
    pub image: String,

    /// SSH keys already registered with the vendor, attached in addition to cloud-init
    #[serde(default)]
    pub ssh_key_names: Vec<String>,

    /// Value of the `managed-by` label put on every VM
    #[serde(default = "default_label")]
    pub managed_by_label: String,
}

fn default_cloud_url() -> String {
    "https://api.hetzner.cloud/v1".to_string()
}

fn default_server_type() -> String {
    "cpx41".to_string()
}

fn default_location() -> String {
    "fsn1".to_string()
}

fn default_image() -> String {
    "ubuntu-24.04".to_string()
}

fn default_label() -> String {
    "optimizerd".to_string()
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_cloud_url(),
            server_type: default_server_type(),
            location: default_location(),
            image: default_image(),
            ssh_key_names: Vec::new(),
            managed_by_label: default_label(),
        }
    }
}

/// Local engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Directory holding the optimization program
    #[serde(default = "default_engine_dir")]
    pub source_dir: PathBuf,

    /// Binary market-data snapshot shipped to the VM
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,

    /// Command run inside the remote program directory; the template id is appended
    #[serde(default = "default_entry_command")]
    pub entry_command: String,

    /// Extra path components skipped while archiving
    #[serde(default)]
    pub archive_excludes: Vec<String>,
}

fn default_engine_dir() -> PathBuf {
    PathBuf::from("./engine")
}

fn default_data_file() -> PathBuf {
    PathBuf::from("./data/market.snapshot")
}

fn default_entry_command() -> String {
    "./run-optimization.sh".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            source_dir: default_engine_dir(),
            data_file: default_data_file(),
            entry_command: default_entry_command(),
            archive_excludes: Vec::new(),
        }
    }
}

/// Remote filesystem contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default = "default_workspace")]
    pub workspace_dir: String,

    #[serde(default = "default_program_subdir")]
    pub program_subdir: String,

    #[serde(default = "default_data_subdir")]
    pub data_subdir: String,

    #[serde(default = "default_snapshot_name")]
    pub snapshot_file_name: String,

    #[serde(default = "default_log_path")]
    pub log_path: String,

    #[serde(default = "default_status_path")]
    pub status_path: String,

    #[serde(default = "default_pid_path")]
    pub pid_path: String,

    #[serde(default = "default_mtls_dir")]
    pub mtls_dir: String,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Hard ceiling on the remote engine run, in seconds
    #[serde(default = "default_max_runtime")]
    pub max_runtime_secs: u64,
}

fn default_workspace() -> String {
    "/opt/optimizer".to_string()
}

fn default_program_subdir() -> String {
    "engine".to_string()
}

fn default_data_subdir() -> String {
    "data".to_string()
}

fn default_snapshot_name() -> String {
    "market.snapshot".to_string()
}

fn default_log_path() -> String {
    "/var/log/optimizer/run.log".to_string()
}

fn default_status_path() -> String {
    "/opt/optimizer/status".to_string()
}

fn default_pid_path() -> String {
    "/opt/optimizer/run.pid".to_string()
}

fn default_mtls_dir() -> String {
    "/opt/optimizer/mtls".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_max_runtime() -> u64 {
    6 * 3600
}

impl RemoteSettings {
    pub fn program_dir(&self) -> String {
        format!(
            "{}/{}",
            self.workspace_dir.trim_end_matches('/'),
            self.program_subdir
        )
    }

    pub fn data_dir(&self) -> String {
        format!("{}/{}", self.program_dir(), self.data_subdir)
    }

    pub fn snapshot_path(&self) -> String {
        format!("{}/{}", self.data_dir(), self.snapshot_file_name)
    }

    pub fn launcher_path(&self) -> String {
        format!("{}/launch.sh", self.workspace_dir.trim_end_matches('/'))
    }

    pub fn archive_path(&self, job_id: &str) -> String {
        format!("/tmp/optimizer-{}.tar.gz", job_id)
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace(),
            program_subdir: default_program_subdir(),
            data_subdir: default_data_subdir(),
            snapshot_file_name: default_snapshot_name(),
            log_path: default_log_path(),
            status_path: default_status_path(),
            pid_path: default_pid_path(),
            mtls_dir: default_mtls_dir(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            max_runtime_secs: default_max_runtime(),
        }
    }
}

/// Client certificate bundle settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtlsSettings {
    /// Platform is certificate-locked; the remote process needs the bundle to call back
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// Platform API the remote process reports to
    #[serde(default)]
    pub platform_api_url: Option<String>,
}

/// Reconciliation sweep settings, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_min_spacing")]
    pub min_spacing_secs: u64,

    #[serde(default = "default_queued_timeout")]
    pub queued_timeout_secs: u64,

    #[serde(default = "default_running_timeout")]
    pub running_timeout_secs: u64,

    #[serde(default = "default_provisioning_grace")]
    pub provisioning_grace_secs: u64,

    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_min_spacing() -> u64 {
    10
}

fn default_queued_timeout() -> u64 {
    5 * 60
}

fn default_running_timeout() -> u64 {
    15 * 60
}

fn default_provisioning_grace() -> u64 {
    10 * 60
}

fn default_handoff_timeout() -> u64 {
    12 * 3600
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            min_spacing_secs: default_min_spacing(),
            queued_timeout_secs: default_queued_timeout(),
            running_timeout_secs: default_running_timeout(),
            provisioning_grace_secs: default_provisioning_grace(),
            handoff_timeout_secs: default_handoff_timeout(),
        }
    }
}

/// Driver timeouts, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_ip_wait")]
    pub ip_wait_secs: u64,

    #[serde(default = "default_ip_poll")]
    pub ip_poll_secs: u64,

    #[serde(default = "default_ssh_wait")]
    pub ssh_wait_secs: u64,

    #[serde(default = "default_ssh_poll")]
    pub ssh_poll_secs: u64,

    #[serde(default = "default_handshake")]
    pub ssh_handshake_secs: u64,

    #[serde(default = "default_ack")]
    pub ack_secs: u64,

    #[serde(default = "default_dependency_wait")]
    pub dependency_wait_secs: u64,

    #[serde(default = "default_dependency_poll")]
    pub dependency_poll_secs: u64,
}

fn default_ip_wait() -> u64 {
    10 * 60
}

fn default_ip_poll() -> u64 {
    5
}

fn default_ssh_wait() -> u64 {
    5 * 60
}

fn default_ssh_poll() -> u64 {
    8
}

fn default_handshake() -> u64 {
    60
}

fn default_ack() -> u64 {
    60
}

fn default_dependency_wait() -> u64 {
    30 * 60
}

fn default_dependency_poll() -> u64 {
    5
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ip_wait_secs: default_ip_wait(),
            ip_poll_secs: default_ip_poll(),
            ssh_wait_secs: default_ssh_wait(),
            ssh_poll_secs: default_ssh_poll(),
            ssh_handshake_secs: default_handshake(),
            ack_secs: default_ack(),
            dependency_wait_secs: default_dependency_wait(),
            dependency_poll_secs: default_dependency_poll(),
        }
    }
}

/// Outbound mail API settings. Credentials live in the key/value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default = "default_mail_url")]
    pub api_base_url: String,
}

fn default_mail_url() -> String {
    "https://api.mailgun.net/v3".to_string()
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_mail_url(),
        }
    }
}
