//! Background driver for one job
//!
//! Runs the stages strictly in order. Any failure is recorded on the job
//! first, then the cleanup block runs (local temp files always, the VM only
//! when hand-off never completed), then the failure email goes out.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bootstrap::mtls::{MtlsBundle, RemoteMtlsPaths};
use crate::cloud::cloud_init;
use crate::cloud::models::{CreateServerRequest, ServerId, ServerLookup};
use crate::cloud::naming;
use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::jobs::archive;
use crate::jobs::context::JobContext;
use crate::jobs::fsm::JobEvent;
use crate::jobs::script::{self, LauncherParams};
use crate::keys::provider;
use crate::notify::{self, EMAIL_LOG_LINES};
use crate::remote::exec::sh_quote;
use crate::remote::{RemoteSession, SshTarget};
use crate::storage::kv::CLOUD_API_TOKEN;

pub const STAGE_STARTING: &str = "starting";
pub const STAGE_DEPENDENCIES: &str = "waiting-for-dependencies";
pub const STAGE_PREPARING: &str = "preparing-archive";
pub const STAGE_PROVISIONING: &str = "provisioning";
pub const STAGE_WAIT_IP: &str = "waiting-for-ip";
pub const STAGE_WAIT_SSH: &str = "waiting-for-ssh";
pub const STAGE_UPLOAD_ARCHIVE: &str = "uploading-archive";
pub const STAGE_UPLOAD_DATA: &str = "uploading-data";
pub const STAGE_UPLOAD_MTLS: &str = "uploading-mtls";
pub const STAGE_UPLOAD_LAUNCHER: &str = "uploading-launcher";
pub const STAGE_LAUNCHING: &str = "launching";
pub const STAGE_HANDOFF: &str = "handoff";
pub const STAGE_CANCELLED: &str = "cancelled";

/// Why a run stopped early
#[derive(Debug)]
pub struct StageFailure {
    pub stage: &'static str,
    pub error: OrchestratorError,
}

impl StageFailure {
    fn new(stage: &'static str, error: OrchestratorError) -> Self {
        Self { stage, error }
    }

    /// Error text with any captured remote output appended
    pub fn details(&self) -> String {
        match self.error.remote_output() {
            Some((stdout, stderr)) => format!(
                "{}\n--- stdout ---\n{}\n--- stderr ---\n{}",
                self.error,
                stdout.trim_end(),
                stderr.trim_end()
            ),
            None => self.error.to_string(),
        }
    }
}

/// Drive `job_id` until hand-off or failure
pub async fn drive(ctx: Arc<JobContext>, job_id: String) {
    Driver {
        ctx: &ctx,
        id: &job_id,
    }
    .run()
    .await
}

struct Prepared {
    mtls: Option<MtlsBundle>,
}

struct Driver<'a> {
    ctx: &'a JobContext,
    id: &'a str,
}

impl Driver<'_> {
    async fn run(&self) {
        info!("Driving job {}", self.id);
        let outcome = self.stages().await;

        let recorded = match &outcome {
            Ok(()) => false,
            Err(failure) => self.record_failure(failure).await,
        };

        self.cleanup().await;

        match outcome {
            Ok(()) => info!("Job {} handed off to the remote launcher", self.id),
            Err(failure) if recorded => {
                self.notify().await;
                error!("Job {} failed at {}", self.id, failure.stage);
            }
            Err(failure) => info!(
                "Job {} stopped driving at {}: {}",
                self.id, failure.stage, failure.error
            ),
        }
        self.ctx.store.end_run(self.id);
    }

    fn log(&self, line: &str) {
        info!("[job {}] {}", self.id, line);
        self.ctx.store.log(self.id, line);
    }

    /// Enter `stage` unless the job was finished elsewhere
    fn enter(&self, stage: &'static str) -> Result<(), StageFailure> {
        let job = self
            .ctx
            .store
            .require(self.id)
            .map_err(|e| StageFailure::new(stage, e))?;
        if job.status.is_terminal() {
            return Err(StageFailure::new(
                STAGE_CANCELLED,
                OrchestratorError::InvalidState(format!("job is already {}", job.status)),
            ));
        }
        self.ctx.store.set_stage(self.id, stage);
        info!("Job {} entering stage {}", self.id, stage);
        self.ctx.persister.schedule(self.id);
        Ok(())
    }

    async fn stage<T, F>(&self, stage: &'static str, work: F) -> Result<T, StageFailure>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        self.enter(stage)?;
        work.await.map_err(|e| StageFailure::new(stage, e))
    }

    async fn stages(&self) -> Result<(), StageFailure> {
        self.stage(STAGE_STARTING, self.start()).await?;
        self.stage(STAGE_DEPENDENCIES, self.wait_for_dependencies())
            .await?;
        let prepared = self.stage(STAGE_PREPARING, self.prepare()).await?;
        let server_id = self.stage(STAGE_PROVISIONING, self.provision()).await?;
        let ip = self
            .stage(STAGE_WAIT_IP, self.wait_for_ip(server_id))
            .await?;
        let session = self.stage(STAGE_WAIT_SSH, self.wait_for_ssh(&ip)).await?;

        let result = self
            .remote_stages(session.as_ref(), server_id, &prepared)
            .await;
        session.close().await;
        result?;

        self.enter(STAGE_HANDOFF)?;
        self.ctx
            .store
            .with_runtime(self.id, |runtime| runtime.handoff_complete = true);
        self.ctx
            .store
            .update(self.id, |job| job.apply(JobEvent::HandOff, Utc::now()))
            .map_err(|e| StageFailure::new(STAGE_HANDOFF, e))?;
        // the engine is running; a lost write must not fail the job
        if let Err(e) = self.ctx.persister.flush_now(self.id).await {
            warn!(
                "Could not persist hand-off of job {}, retrying shortly: {}",
                self.id, e
            );
            self.ctx.persister.schedule(self.id);
        }
        self.log("remote launcher acknowledged, hand-off complete");
        Ok(())
    }

    async fn remote_stages(
        &self,
        session: &dyn RemoteSession,
        server_id: ServerId,
        prepared: &Prepared,
    ) -> Result<(), StageFailure> {
        self.stage(STAGE_UPLOAD_ARCHIVE, self.upload_archive(session))
            .await?;
        self.stage(STAGE_UPLOAD_DATA, self.upload_data(session))
            .await?;
        let mtls = match &prepared.mtls {
            Some(bundle) => Some(
                self.stage(STAGE_UPLOAD_MTLS, self.upload_mtls(session, bundle))
                    .await?,
            ),
            None => None,
        };
        self.stage(
            STAGE_UPLOAD_LAUNCHER,
            self.upload_launcher(session, server_id, mtls),
        )
        .await?;
        self.stage(STAGE_LAUNCHING, self.launch(session)).await
    }

    async fn transition(&self, event: JobEvent) -> Result<(), OrchestratorError> {
        self.ctx
            .store
            .update(self.id, |job| job.apply(event, Utc::now()))?;
        self.ctx.persister.flush_now(self.id).await
    }

    async fn start(&self) -> Result<(), OrchestratorError> {
        self.transition(JobEvent::Start).await
    }

    async fn wait_for_dependencies(&self) -> Result<(), OrchestratorError> {
        let timeouts = &self.ctx.settings.timeouts;
        let deadline = Instant::now() + Duration::from_secs(timeouts.dependency_wait_secs);
        let job = self.ctx.store.require(self.id)?;

        loop {
            match self.ctx.dependencies.pending(&job).await {
                Ok(0) => return Ok(()),
                Ok(pending) => self.log(&format!("waiting for {} dependent jobs", pending)),
                Err(e) => warn!("Dependency check for job {} failed: {}", self.id, e),
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(format!(
                    "dependent jobs still pending after {}s",
                    timeouts.dependency_wait_secs
                )));
            }
            tokio::time::sleep(Duration::from_secs(timeouts.dependency_poll_secs)).await;
        }
    }

    async fn prepare(&self) -> Result<Prepared, OrchestratorError> {
        let engine = &self.ctx.settings.engine;
        if !tokio::fs::try_exists(&engine.data_file).await.unwrap_or(false) {
            return Err(OrchestratorError::LocalIo(format!(
                "market data snapshot {} does not exist",
                engine.data_file.display()
            )));
        }

        let archive_path = self.ctx.archive_path(self.id);
        let size =
            archive::build_archive(&engine.source_dir, &archive_path, &engine.archive_excludes)
                .await?;
        self.log(&format!("packed engine sources ({} bytes)", size));

        let mtls = MtlsBundle::load(&self.ctx.settings.mtls).await?;
        Ok(Prepared { mtls })
    }

    async fn provision(&self) -> Result<ServerId, OrchestratorError> {
        // the pair is provisioned once at startup, never per job
        let public_key = provider::load_public_key(self.ctx.kv.as_ref()).await?;
        if public_key.is_none() {
            warn!("Job {} continues without an SSH public key", self.id);
        }

        let job = self.ctx.store.require(self.id)?;
        let cloud = &self.ctx.settings.cloud;
        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), naming::sanitize(&cloud.managed_by_label));
        labels.insert("job".to_string(), naming::sanitize(&job.id));
        labels.insert("template".to_string(), naming::sanitize(&job.template_id));

        let request = CreateServerRequest {
            name: naming::server_name(&job.template_id, job.created_at),
            server_type: cloud.server_type.clone(),
            location: cloud.location.clone(),
            image: cloud.image.clone(),
            user_data: cloud_init::user_data(public_key.as_deref()),
            ssh_keys: cloud.ssh_key_names.clone(),
            labels,
            start_after_create: true,
        };
        let server = self.ctx.cloud.create_server(&request).await?;

        // recorded even when the job was stopped meanwhile, so cleanup finds it
        self.ctx.store.update(self.id, |job| {
            job.hetzner_server_id = Some(server.id);
            Ok(())
        })?;
        self.ctx.persister.flush_now(self.id).await?;
        self.log(&format!("created server {} ({})", server.id, request.name));
        Ok(server.id)
    }

    async fn wait_for_ip(&self, server_id: ServerId) -> Result<String, OrchestratorError> {
        let timeouts = &self.ctx.settings.timeouts;
        let deadline = Instant::now() + Duration::from_secs(timeouts.ip_wait_secs);

        loop {
            match self.ctx.cloud.get_server(server_id).await {
                Ok(ServerLookup::Found(info)) if info.is_healthy() => {
                    let ip = info.public_ipv4.unwrap_or_default();
                    self.ctx.store.update(self.id, |job| {
                        job.remote_server_ip = Some(ip.clone());
                        Ok(())
                    })?;
                    self.ctx.persister.flush_now(self.id).await?;
                    self.log(&format!("server {} is running at {}", server_id, ip));
                    return Ok(ip);
                }
                Ok(ServerLookup::Found(info)) => {
                    self.log(&format!("server {} is {:?}, no address yet", server_id, info.status));
                }
                Ok(ServerLookup::Missing) => {
                    return Err(OrchestratorError::Provisioning {
                        status: 404,
                        body: format!("server {} disappeared while booting", server_id),
                    });
                }
                Err(e) => warn!("Polling server {} failed: {}", server_id, e),
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(format!(
                    "server {} had no public address after {}s",
                    server_id, timeouts.ip_wait_secs
                )));
            }
            tokio::time::sleep(Duration::from_secs(timeouts.ip_poll_secs)).await;
        }
    }

    async fn wait_for_ssh(&self, ip: &str) -> Result<Box<dyn RemoteSession>, OrchestratorError> {
        let settings = &self.ctx.settings;
        let private_key = provider::load_private_key(self.ctx.kv.as_ref()).await?;
        let target = SshTarget::new(ip, settings.remote.ssh_port, settings.remote.ssh_user.as_str());
        let deadline = Instant::now() + Duration::from_secs(settings.timeouts.ssh_wait_secs);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.ctx.connector.connect(&target, &private_key).await {
                Ok(session) => {
                    self.log(&format!("SSH ready on {} after {} attempts", target, attempt));
                    return Ok(session);
                }
                Err(e) if e.is_retryable() => {
                    self.log(&format!("SSH attempt {} to {} failed: {}", attempt, target, e));
                    if Instant::now() >= deadline {
                        return Err(OrchestratorError::Connectivity(format!(
                            "SSH to {} not ready after {}s: {}",
                            target, settings.timeouts.ssh_wait_secs, e
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_secs(settings.timeouts.ssh_poll_secs)).await;
        }
    }

    async fn upload_archive(&self, session: &dyn RemoteSession) -> Result<(), OrchestratorError> {
        let remote = &self.ctx.settings.remote;
        let program_dir = sh_quote(&remote.program_dir());
        let remote_archive = remote.archive_path(self.id);

        session
            .exec(
                "prepare workspace",
                &format!("mkdir -p {}", sh_quote(&remote.workspace_dir)),
            )
            .await?;
        let bytes = session
            .upload_file(&self.ctx.archive_path(self.id), &remote_archive)
            .await?;
        self.log(&format!("uploaded archive ({} bytes)", bytes));

        session
            .exec(
                "extract archive",
                &format!(
                    "rm -rf {dir}\nmkdir -p {dir}\ntar -xzf {archive} -C {dir}\nrm -f {archive}",
                    dir = program_dir,
                    archive = sh_quote(&remote_archive)
                ),
            )
            .await?;
        self.log("extracted archive");
        Ok(())
    }

    async fn upload_data(&self, session: &dyn RemoteSession) -> Result<(), OrchestratorError> {
        let settings = &self.ctx.settings;
        session
            .exec(
                "prepare data directory",
                &format!("mkdir -p {}", sh_quote(&settings.remote.data_dir())),
            )
            .await?;
        let bytes = session
            .upload_file(&settings.engine.data_file, &settings.remote.snapshot_path())
            .await?;
        self.log(&format!("uploaded market data snapshot ({} bytes)", bytes));
        Ok(())
    }

    async fn upload_mtls(
        &self,
        session: &dyn RemoteSession,
        bundle: &MtlsBundle,
    ) -> Result<RemoteMtlsPaths, OrchestratorError> {
        let paths = bundle
            .upload(session, &self.ctx.settings.remote.mtls_dir)
            .await?;
        self.log("uploaded mTLS client bundle");
        Ok(paths)
    }

    async fn upload_launcher(
        &self,
        session: &dyn RemoteSession,
        server_id: ServerId,
        mtls: Option<RemoteMtlsPaths>,
    ) -> Result<(), OrchestratorError> {
        let settings = &self.ctx.settings;
        let job = self.ctx.store.require(self.id)?;
        let token = self
            .ctx
            .kv
            .get(CLOUD_API_TOKEN)
            .await?
            .ok_or_else(|| OrchestratorError::Config("cloud API token is not configured".to_string()))?;

        let params = LauncherParams {
            job_id: job.id.clone(),
            template_id: job.template_id.clone(),
            template_name: job.template_name.clone(),
            triggered_by: job.triggered_by.clone(),
            program_dir: settings.remote.program_dir(),
            data_file: settings.remote.snapshot_path(),
            entry_command: settings.engine.entry_command.clone(),
            log_path: settings.remote.log_path.clone(),
            status_path: settings.remote.status_path.clone(),
            max_runtime_secs: settings.remote.max_runtime_secs,
            platform_api_url: settings.mtls.platform_api_url.clone(),
            mtls,
            cloud_api_url: settings.cloud.api_base_url.clone(),
            cloud_api_token: SecretString::from(token),
            server_id,
        };
        let contents = script::render_launcher(&params);

        let local = File::new(self.ctx.script_path(self.id));
        local.write_string(&contents).await?;
        local.set_permissions_600().await?;

        let launcher = settings.remote.launcher_path();
        session.upload_bytes(contents.as_bytes(), &launcher).await?;
        session
            .exec("chmod launcher", &format!("chmod 700 {}", sh_quote(&launcher)))
            .await?;
        self.log("uploaded launcher script");
        Ok(())
    }

    async fn launch(&self, session: &dyn RemoteSession) -> Result<(), OrchestratorError> {
        let settings = &self.ctx.settings;
        let command = script::detached_launch(
            &settings.remote.launcher_path(),
            &settings.remote.log_path,
            &settings.remote.pid_path,
        );
        session
            .exec_detached(
                "launch",
                &command,
                Duration::from_secs(settings.timeouts.ack_secs),
            )
            .await?;
        self.log("launcher started in the background");
        Ok(())
    }

    /// Mark the job failed; false when it was already terminal
    async fn record_failure(&self, failure: &StageFailure) -> bool {
        if failure.stage == STAGE_CANCELLED {
            return false;
        }
        let details = failure.details();
        self.log(&format!("failed at {}: {}", failure.stage, failure.error));

        let applied = self.ctx.store.update(self.id, |job| {
            job.apply(JobEvent::fail(failure.stage, details), Utc::now())
        });
        match applied {
            Ok(_) => {
                if let Err(e) = self.ctx.persister.flush_now(self.id).await {
                    error!("Could not persist failure of job {}: {}", self.id, e);
                }
                true
            }
            Err(e) => {
                info!("Job {} was finished elsewhere: {}", self.id, e);
                false
            }
        }
    }

    async fn cleanup(&self) {
        for path in [self.ctx.archive_path(self.id), self.ctx.script_path(self.id)] {
            if let Err(e) = File::new(&path).delete().await {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        let handed_off = self
            .ctx
            .store
            .with_runtime(self.id, |runtime| runtime.handoff_complete)
            .unwrap_or(false);
        if handed_off {
            return;
        }

        let Some(server_id) = self.ctx.store.get(self.id).and_then(|job| job.hetzner_server_id)
        else {
            return;
        };
        match self.ctx.cloud.delete_server(server_id).await {
            Ok(outcome) => {
                self.log(&format!("server {} removed ({:?})", server_id, outcome));
                let cleared = self.ctx.store.update(self.id, |job| {
                    job.hetzner_server_id = None;
                    job.remote_server_ip = None;
                    Ok(())
                });
                if cleared.is_ok() {
                    if let Err(e) = self.ctx.persister.flush_now(self.id).await {
                        warn!("Could not persist cleanup of job {}: {}", self.id, e);
                    }
                }
            }
            Err(e) => error!(
                "Could not delete server {} of job {}, the reconciler will retry: {}",
                server_id, self.id, e
            ),
        }
    }

    async fn notify(&self) {
        let Some(job) = self.ctx.store.get(self.id) else {
            return;
        };
        let log_tail = self.ctx.store.log_tail(self.id, EMAIL_LOG_LINES);
        let outcome =
            notify::notify_failure(self.ctx.kv.as_ref(), self.ctx.mailer.as_ref(), &job, &log_tail)
                .await;
        info!("Failure notification for job {}: {:?}", self.id, outcome);
    }
}
