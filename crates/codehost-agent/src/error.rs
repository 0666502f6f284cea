use std::time::Duration;

use codehost_process::{ErrorInfo, InstanceState};

pub const MAX_MESSAGE_BYTES: usize = 32 * 1024;
pub const MAX_STDERR_BYTES: usize = 8 * 1024;

/// Failure of a lifecycle operation.
///
/// Start failures are terminal for the attempt only: the instance stays
/// restartable and a later `start()` begins again at the install check.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("installation failed: {0}")]
    Installation(String),

    #[error("configuration failed: {0}")]
    Configuration(String),

    #[error("launch failed: {message}")]
    Launch { message: String, stderr: String },

    #[error("readiness timeout: server on port {port} not healthy after {}ms", .waited.as_millis())]
    ReadinessTimeout { port: u16, waited: Duration },

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("unknown workspace: {0}")]
    NotFound(String),

    #[error("workspace {key} is {state}, not stopped; stop it first")]
    StillRunning { key: String, state: InstanceState },

    #[error("invalid workspace key: {0}")]
    InvalidKey(String),

    #[error("workspace {0} was removed from the registry")]
    Retired(String),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Installation(_) => "installation_error",
            SupervisorError::Configuration(_) => "configuration_error",
            SupervisorError::Launch { .. } => "launch_error",
            SupervisorError::ReadinessTimeout { .. } => "readiness_timeout",
            SupervisorError::Shutdown(_) => "shutdown_error",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::StillRunning { .. } => "still_running",
            SupervisorError::InvalidKey(_) => "invalid_key",
            SupervisorError::Retired(_) => "retired",
        }
    }

    /// Human-readable message, with captured stderr appended for launch failures.
    pub fn message(&self) -> String {
        let msg = match self {
            SupervisorError::Launch { message, stderr } if !stderr.trim().is_empty() => {
                format!("launch failed: {message}\n{}", stderr.trim_end())
            }
            other => other.to_string(),
        };
        truncate_utf8(&msg, MAX_MESSAGE_BYTES)
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.message(),
        }
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
