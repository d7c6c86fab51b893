//! Remote launcher script
//!
//! The launcher runs the engine under a wall-clock limit, records progress
//! in the status file and deletes its own VM on exit so billing stops even
//! when the engine crashes. Every interpolated value is shell-quoted.

use secrecy::{ExposeSecret, SecretString};

use crate::bootstrap::mtls::RemoteMtlsPaths;
use crate::cloud::models::ServerId;
use crate::remote::exec::sh_quote;

/// Inputs for one job's launcher
#[derive(Debug, Clone)]
pub struct LauncherParams {
    pub job_id: String,
    pub template_id: String,
    pub template_name: String,
    pub triggered_by: String,
    pub program_dir: String,
    pub data_file: String,
    pub entry_command: String,
    pub log_path: String,
    pub status_path: String,
    pub max_runtime_secs: u64,
    pub platform_api_url: Option<String>,
    pub mtls: Option<RemoteMtlsPaths>,
    pub cloud_api_url: String,
    pub cloud_api_token: SecretString,
    pub server_id: ServerId,
}

fn export(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("export {}={}\n", name, sh_quote(value)));
}

fn assign(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("{}={}\n", name, sh_quote(value)));
}

pub fn render_launcher(params: &LauncherParams) -> String {
    let mut s = String::from("#!/usr/bin/env bash\nset -euo pipefail\n\n");

    export(&mut s, "OPTIMIZER_JOB_ID", &params.job_id);
    export(&mut s, "OPTIMIZER_TEMPLATE_ID", &params.template_id);
    export(&mut s, "OPTIMIZER_TEMPLATE_NAME", &params.template_name);
    export(&mut s, "OPTIMIZER_TRIGGERED_BY", &params.triggered_by);
    export(&mut s, "OPTIMIZER_DATA_FILE", &params.data_file);
    if let Some(url) = &params.platform_api_url {
        export(&mut s, "OPTIMIZER_PLATFORM_API_URL", url);
    }
    if let Some(mtls) = &params.mtls {
        export(&mut s, "OPTIMIZER_MTLS_CERT", &mtls.cert);
        export(&mut s, "OPTIMIZER_MTLS_KEY", &mtls.key);
        export(&mut s, "OPTIMIZER_MTLS_CA", &mtls.ca);
    }
    s.push('\n');

    assign(&mut s, "STATUS_FILE", &params.status_path);
    assign(&mut s, "LOG_FILE", &params.log_path);
    assign(&mut s, "CLOUD_API_URL", params.cloud_api_url.trim_end_matches('/'));
    assign(&mut s, "CLOUD_API_TOKEN", params.cloud_api_token.expose_secret());
    assign(&mut s, "SERVER_ID", &params.server_id.to_string());

    s.push_str(
        r#"
self_destruct() {
  code=$?
  if [ "$code" -ne 0 ] && ! grep -q '^failed' "$STATUS_FILE" 2>/dev/null; then
    echo "failed:$code" > "$STATUS_FILE"
  fi
  echo "[launcher] exiting with $code, deleting server $SERVER_ID"
  sync || true
  curl -fsS -X DELETE -H "Authorization: Bearer ${CLOUD_API_TOKEN}" \
    "${CLOUD_API_URL}/servers/${SERVER_ID}" > /dev/null || true
}
trap self_destruct EXIT

mkdir -p "$(dirname "$STATUS_FILE")" "$(dirname "$LOG_FILE")"
echo running > "$STATUS_FILE"
echo "[launcher] job $OPTIMIZER_JOB_ID started at $(date -u +%Y-%m-%dT%H:%M:%SZ)"
"#,
    );

    s.push_str(&format!("cd {}\n", sh_quote(&params.program_dir)));
    s.push_str("set +e\n");
    s.push_str(&format!(
        "timeout --signal=TERM --kill-after=60 {} bash -c {} 2>&1\n",
        params.max_runtime_secs,
        sh_quote(&params.entry_command)
    ));
    s.push_str(
        r#"code=$?
set -e
if [ "$code" -eq 0 ]; then
  echo succeeded > "$STATUS_FILE"
else
  echo "failed:$code" > "$STATUS_FILE"
fi
exit "$code"
"#,
    );
    s
}

/// Start the launcher outside the SSH session and record its PID; the
/// launcher's output goes to the log file
pub fn detached_launch(launcher_path: &str, log_path: &str, pid_path: &str) -> String {
    let log = sh_quote(log_path);
    let pid = sh_quote(pid_path);
    format!(
        "mkdir -p \"$(dirname {log})\" \"$(dirname {pid})\"\n\
         nohup setsid bash {launcher} >> {log} 2>&1 < /dev/null &\n\
         echo $! > {pid}",
        launcher = sh_quote(launcher_path),
        log = log,
        pid = pid,
    )
}
