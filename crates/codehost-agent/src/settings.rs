use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use codehost_process::WorkspaceKey;

const DEFAULT_INSTALL_CMD: &str =
    "curl -fsSL https://code-server.dev/install.sh | sh -s -- --method=standalone";

const DEFAULT_EXTENSIONS: &[&str] = &[
    "ms-python.python",
    "ms-vscode.vscode-typescript-next",
    "bradlc.vscode-tailwindcss",
    "esbenp.prettier-vscode",
    "ms-vscode.vscode-json",
    "redhat.vscode-yaml",
    "ms-vscode.vscode-css",
    "formulahendry.auto-rename-tag",
    "christian-kohler.path-intellisense",
    "ms-vscode.vscode-eslint",
];

const DEFAULT_BASE_PORT: u16 = 8080;
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(raw: Option<&str>, default_value: bool) -> bool {
    match raw
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .as_deref()
    {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

fn env_bool(name: &str, default_value: bool) -> bool {
    parse_bool(std::env::var(name).ok().as_deref(), default_value)
}

fn env_millis(name: &str, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(
        env_u64(name)
            .map(|v| v.clamp(min_ms, max_ms))
            .unwrap_or(default_ms),
    )
}

fn parse_list(raw: &str, sep: impl Fn(char) -> bool) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn absolutize(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Host-wide knobs shared by every supervised instance.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub workspace_root: PathBuf,

    /// Server executable and any launcher args placed before the server's own flags.
    pub server_bin: String,
    pub server_args: Vec<String>,
    /// Shell snippet run once when the server binary is missing.
    pub install_command: String,

    pub bind_addr: String,
    pub base_port: u16,
    pub auth: String,
    pub cert: bool,
    pub extensions: Vec<String>,
    pub health_path: String,

    pub launch_grace: Duration,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    pub probe_timeout: Duration,
    pub stop_grace: Duration,
    pub version_check_timeout: Duration,
    pub extension_timeout: Duration,

    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_data_root("./data")
    }
}

impl Settings {
    /// Defaults with every directory rooted under `data_root`.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            workspace_root: data_root.join("workspaces"),
            data_root,
            server_bin: "code-server".to_string(),
            server_args: Vec::new(),
            install_command: DEFAULT_INSTALL_CMD.to_string(),
            bind_addr: "0.0.0.0".to_string(),
            base_port: DEFAULT_BASE_PORT,
            auth: "none".to_string(),
            cert: false,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            health_path: "/healthz".to_string(),
            launch_grace: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(60),
            ready_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            version_check_timeout: Duration::from_secs(10),
            extension_timeout: Duration::from_secs(120),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }

    pub fn from_env() -> Self {
        let data_root = absolutize(PathBuf::from(
            env_string("CODEHOST_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        ));
        let mut s = Self::with_data_root(data_root);

        if let Some(v) = env_string("CODEHOST_WORKSPACE_ROOT") {
            s.workspace_root = absolutize(PathBuf::from(v));
        }
        if let Some(v) = env_string("CODEHOST_SERVER_BIN") {
            s.server_bin = v;
        }
        if let Some(v) = env_string("CODEHOST_SERVER_ARGS") {
            s.server_args = parse_list(&v, char::is_whitespace);
        }
        if let Some(v) = env_string("CODEHOST_INSTALL_CMD") {
            s.install_command = v;
        }
        if let Some(v) = env_string("CODEHOST_BIND_ADDR") {
            s.bind_addr = v;
        }
        if let Some(v) = env_u64("CODEHOST_BASE_PORT").filter(|v| (1024..=65535).contains(v)) {
            s.base_port = v as u16;
        }
        if let Some(v) = env_string("CODEHOST_AUTH") {
            s.auth = v;
        }
        s.cert = env_bool("CODEHOST_CERT", false);
        // An explicitly empty list disables extension installs.
        if let Ok(v) = std::env::var("CODEHOST_EXTENSIONS") {
            s.extensions = parse_list(&v, |c| c == ',');
        }
        if let Some(v) = env_string("CODEHOST_HEALTH_PATH") {
            s.health_path = if v.starts_with('/') { v } else { format!("/{v}") };
        }

        s.launch_grace = env_millis("CODEHOST_LAUNCH_GRACE_MS", 2000, 100, 60_000);
        s.ready_timeout = env_millis("CODEHOST_READY_TIMEOUT_MS", 60_000, 1000, 30 * 60 * 1000);
        s.ready_interval = env_millis("CODEHOST_READY_INTERVAL_MS", 1000, 50, 60_000);
        s.probe_timeout = env_millis("CODEHOST_PROBE_TIMEOUT_MS", 5000, 100, 60_000);
        s.stop_grace = env_millis("CODEHOST_STOP_GRACE_MS", 10_000, 100, 5 * 60 * 1000);
        s.version_check_timeout =
            env_millis("CODEHOST_VERSION_CHECK_TIMEOUT_MS", 10_000, 500, 5 * 60 * 1000);
        s.extension_timeout =
            env_millis("CODEHOST_EXTENSION_TIMEOUT_MS", 120_000, 1000, 30 * 60 * 1000);

        s.log_max_lines = env_usize("CODEHOST_LOG_MAX_LINES")
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(DEFAULT_LOG_MAX_LINES);
        s.log_file_max_bytes = env_u64("CODEHOST_LOG_FILE_MAX_BYTES")
            .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
        s.log_file_max_files = env_usize("CODEHOST_LOG_FILE_MAX_FILES")
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);

        s
    }

    pub fn instance_dir(&self, key: &WorkspaceKey) -> PathBuf {
        self.data_root.join("instances").join(key.as_str())
    }

    pub fn default_workspace(&self, key: &WorkspaceKey) -> PathBuf {
        self.workspace_root.join(key.as_str())
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}
