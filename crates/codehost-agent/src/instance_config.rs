use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::settings::Settings;

pub(crate) const CONFIG_FILE: &str = "config.yaml";
pub(crate) const RUN_FILE: &str = "run.json";

/// Snapshot of the server configuration taken right before a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    pub bind_addr: String,
    pub auth: String,
    pub cert: bool,
    pub disable_telemetry: bool,
    pub disable_update_check: bool,
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Where a local client reaches a server bound to `bind_host:port`.
/// Wildcard binds are reached through the loopback of the same family.
pub(crate) fn probe_addr(bind_host: &str, port: u16) -> String {
    let bare = bind_host.trim_start_matches('[').trim_end_matches(']');
    let host = match bare {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    };
    join_host_port(host, port)
}

impl InstanceConfig {
    pub fn new(settings: &Settings, port: u16) -> Self {
        Self {
            bind_addr: join_host_port(&settings.bind_addr, port),
            auth: settings.auth.clone(),
            cert: settings.cert,
            disable_telemetry: true,
            disable_update_check: true,
        }
    }

    /// Server flags mirroring the config file, so the launch does not depend
    /// on the binary honoring `--config` alone.
    pub fn launch_args(&self, config_path: &Path, workspace: &Path) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            config_path.display().to_string(),
            "--bind-addr".to_string(),
            self.bind_addr.clone(),
            "--auth".to_string(),
            self.auth.clone(),
        ];
        if self.disable_telemetry {
            args.push("--disable-telemetry".to_string());
        }
        if self.disable_update_check {
            args.push("--disable-update-check".to_string());
        }
        args.push(workspace.display().to_string());
        args
    }
}

async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create instance dir {}", dir.display()))?;
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {name}.tmp"))?;
    f.write_all(data)
        .await
        .with_context(|| format!("write {name}.tmp"))?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("persist {name}"))?;
    Ok(path)
}

/// Writes `config.yaml` into `dir`, replacing any previous run's file.
pub(crate) async fn materialize(config: &InstanceConfig, dir: &Path) -> anyhow::Result<PathBuf> {
    let yaml = serde_yaml::to_string(config).context("serialize config.yaml")?;
    write_atomic(dir, CONFIG_FILE, yaml.as_bytes()).await
}

/// Diagnostic record of one launch, written next to the config.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunInfo {
    pub key: String,
    pub run_id: String,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

pub(crate) fn unix_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn collect_safe_env() -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for key in ["CODEHOST_DATA_ROOT", "HOME", "NODE_OPTIONS", "PATH"] {
        if let Ok(v) = std::env::var(key) {
            let val = if key == "PATH" && v.len() > 512 {
                let mut end = 512;
                while !v.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}…(truncated)", &v[..end])
            } else {
                v
            };
            out.insert(key.to_string(), val);
        }
    }
    out
}

pub(crate) async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    write_atomic(dir, RUN_FILE, &data).await?;
    Ok(())
}
