use std::{collections::HashSet, process::Stdio, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{process::Command, sync::Mutex};

use crate::error::{MAX_STDERR_BYTES, SupervisorError, format_error_chain, truncate_utf8};
use crate::settings::Settings;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Outcome of one auxiliary extension install.
#[derive(Debug, Clone)]
pub struct ExtensionOutcome {
    pub id: String,
    pub result: Result<(), String>,
}

impl ExtensionOutcome {
    pub fn warning(&self) -> Option<String> {
        match &self.result {
            Ok(()) => None,
            Err(e) => Some(format!("extension {} not installed: {e}", self.id)),
        }
    }
}

/// Makes sure the server binary exists, installing it at most once per host
/// process, and installs editor extensions on a best-effort basis.
///
/// Shared by every instance so concurrent starts never run the installer twice.
#[derive(Debug)]
pub struct Installer {
    settings: Arc<Settings>,
    verified: Mutex<Option<String>>,
    extensions_done: Mutex<HashSet<String>>,
}

fn describe_output(out: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr);
    let stderr = stderr.trim();
    let text = if stderr.is_empty() {
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    } else {
        stderr.to_string()
    };
    let status = match out.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    if text.is_empty() {
        status
    } else {
        format!("{status}: {}", truncate_utf8(&text, MAX_STDERR_BYTES))
    }
}

async fn run_bounded(mut cmd: Command, limit: Duration) -> anyhow::Result<std::process::Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(res) => Ok(res?),
        Err(_) => anyhow::bail!("timed out after {}ms", limit.as_millis()),
    }
}

impl Installer {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            verified: Mutex::new(None),
            extensions_done: Mutex::new(HashSet::new()),
        }
    }

    fn server_command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.server_bin);
        cmd.args(&self.settings.server_args);
        cmd
    }

    async fn probe_version(&self) -> anyhow::Result<String> {
        let mut cmd = self.server_command();
        cmd.arg("--version");
        let out = run_bounded(cmd, self.settings.version_check_timeout)
            .await
            .with_context(|| format!("run `{} --version`", self.settings.server_bin))?;
        if !out.status.success() {
            anyhow::bail!(
                "`{} --version` failed ({})",
                self.settings.server_bin,
                describe_output(&out)
            );
        }
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn run_install(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.settings.install_command);
        let out = run_bounded(cmd, INSTALL_TIMEOUT)
            .await
            .context("run install command")?;
        if !out.status.success() {
            anyhow::bail!("install command failed ({})", describe_output(&out));
        }
        Ok(())
    }

    /// Returns the reported server version.
    pub async fn ensure_installed(&self) -> Result<String, SupervisorError> {
        let mut verified = self.verified.lock().await;
        if let Some(version) = verified.as_ref() {
            return Ok(version.clone());
        }

        let version = match self.probe_version().await {
            Ok(v) => v,
            Err(e) => {
                tracing::info!(
                    bin = %self.settings.server_bin,
                    reason = %format_error_chain(&e),
                    "server binary unavailable; installing"
                );
                self.run_install()
                    .await
                    .map_err(|e| SupervisorError::Installation(format_error_chain(&e)))?;
                self.probe_version().await.map_err(|e| {
                    SupervisorError::Installation(format!(
                        "binary still unavailable after install: {}",
                        format_error_chain(&e)
                    ))
                })?
            }
        };

        tracing::debug!(version = %version, "server binary verified");
        *verified = Some(version.clone());
        Ok(version)
    }

    async fn install_extension(&self, id: &str) -> Result<(), String> {
        let mut cmd = self.server_command();
        cmd.arg("--install-extension").arg(id);
        match run_bounded(cmd, self.settings.extension_timeout).await {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(describe_output(&out)),
            Err(e) => Err(format_error_chain(&e)),
        }
    }

    /// Installs every configured extension not installed earlier in this
    /// host process. Never fails; each extension reports its own outcome.
    pub async fn install_extensions(&self) -> Vec<ExtensionOutcome> {
        let pending: Vec<String> = {
            let done = self.extensions_done.lock().await;
            self.settings
                .extensions
                .iter()
                .filter(|id| !done.contains(*id))
                .cloned()
                .collect()
        };

        let mut outcomes = Vec::with_capacity(pending.len());
        for id in pending {
            let result = self.install_extension(&id).await;
            match &result {
                Ok(()) => {
                    tracing::debug!(extension = %id, "extension installed");
                    self.extensions_done.lock().await.insert(id.clone());
                }
                Err(e) => tracing::warn!(extension = %id, error = %e, "extension install failed"),
            }
            outcomes.push(ExtensionOutcome { id, result });
        }
        outcomes
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::fake_settings;

    #[tokio::test]
    async fn present_binary_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = fake_settings(dir.path(), "exit 0", 8080);
        s.install_command = format!("touch {}", dir.path().join("ran").display());
        let installer = Installer::new(Arc::new(s));

        assert_eq!(installer.ensure_installed().await.unwrap(), "4.0.0-fake");
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn missing_binary_is_installed_once() {
        let dir = tempfile::tempdir().unwrap();
        let mark = dir.path().join("installed");
        let count = dir.path().join("count");
        let mut s = Settings::with_data_root(dir.path());
        s.server_bin = "/bin/sh".to_string();
        s.server_args = vec![
            "-c".to_string(),
            format!(
                "[ \"$1\" = --version ] && [ -f '{}' ] && echo 4.1.0 && exit 0; exit 127",
                mark.display()
            ),
            "code-server".to_string(),
        ];
        s.install_command = format!(
            "touch '{}' && echo run >> '{}'",
            mark.display(),
            count.display()
        );
        let installer = Installer::new(Arc::new(s));

        assert_eq!(installer.ensure_installed().await.unwrap(), "4.1.0");
        assert_eq!(installer.ensure_installed().await.unwrap(), "4.1.0");
        let runs = std::fs::read_to_string(&count).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn failed_install_is_an_installation_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::with_data_root(dir.path());
        s.server_bin = dir.path().join("missing/code-server").display().to_string();
        s.install_command = "echo 'no network' >&2; exit 1".to_string();
        let installer = Installer::new(Arc::new(s));

        let err = installer.ensure_installed().await.unwrap_err();
        assert_eq!(err.code(), "installation_error");
        assert!(err.to_string().contains("no network"));
    }

    #[tokio::test]
    async fn extension_failures_become_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::with_data_root(dir.path());
        s.server_bin = "/bin/sh".to_string();
        s.server_args = vec![
            "-c".to_string(),
            "[ \"$2\" = bad.ext ] && { echo 'not found in marketplace' >&2; exit 1; }; exit 0"
                .to_string(),
            "code-server".to_string(),
        ];
        s.extensions = vec!["good.ext".to_string(), "bad.ext".to_string()];
        let installer = Installer::new(Arc::new(s));

        let first = installer.install_extensions().await;
        assert_eq!(first.len(), 2);
        assert!(first[0].result.is_ok());
        assert!(first[0].warning().is_none());
        let warning = first[1].warning().unwrap();
        assert!(warning.contains("bad.ext"));
        assert!(warning.contains("not found in marketplace"));

        // Installed extensions are remembered; failed ones are retried.
        let second = installer.install_extensions().await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "bad.ext");
    }
}
