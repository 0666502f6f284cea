use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use codehost_process::{ErrorInfo, InstanceState, InstanceStatus, RunId, WorkspaceKey};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::{
    error::{MAX_STDERR_BYTES, SupervisorError, format_error_chain, truncate_utf8},
    install::{ExtensionOutcome, Installer},
    instance_config::{self, InstanceConfig, RunInfo},
    logs::{LogBuffer, LogSink},
    process_group::{self, ExitInfo, LaunchSpec, Termination},
    readiness::{Attempt, HealthProbe, PollOutcome, poll_with_deadline},
    settings::Settings,
};

const AGENT_PREFIX: &str = "[codehost] ";
const LAUNCH_STDERR_LINES: usize = 50;

/// Result of a successful `start()` or `restart()`.
#[derive(Debug, Clone)]
pub struct StartReport {
    pub status: InstanceStatus,
    pub already_running: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    NotRunning,
    Stopped(Termination),
}

struct ProcessHandle {
    pid: u32,
    pgid: i32,
    exited: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    fn is_alive(&self) -> bool {
        self.exited.borrow().is_none()
    }
}

/// State guarded by the per-instance operation lock.
#[derive(Default)]
struct Slot {
    process: Option<ProcessHandle>,
    retired: bool,
}

/// Supervises one server process bound to one workspace.
///
/// Lifecycle operations are serialized on an async mutex and run on their
/// own task: a caller that stops waiting does not cancel a start halfway, and
/// `status()` keeps reporting progress from the watch snapshot.
pub struct Instance {
    key: WorkspaceKey,
    workspace: PathBuf,
    instance_dir: PathBuf,
    port: u16,
    settings: Arc<Settings>,
    installer: Arc<Installer>,
    logs: Arc<Mutex<LogBuffer>>,
    slot: Arc<Mutex<Slot>>,
    snapshot: Arc<watch::Sender<InstanceStatus>>,
}

impl Instance {
    pub(crate) fn new(
        key: WorkspaceKey,
        workspace: PathBuf,
        port: u16,
        settings: Arc<Settings>,
        installer: Arc<Installer>,
    ) -> Self {
        let initial = InstanceStatus {
            key: key.clone(),
            state: InstanceState::Stopped,
            ready: false,
            port,
            url: format!("http://localhost:{port}"),
            workspace: workspace.display().to_string(),
            pid: None,
            run_id: None,
            last_error: None,
        };
        let (snapshot, _) = watch::channel(initial);
        Self {
            instance_dir: settings.instance_dir(&key),
            logs: Arc::new(Mutex::new(LogBuffer::new(settings.log_max_lines))),
            key,
            workspace,
            port,
            settings,
            installer,
            slot: Arc::new(Mutex::new(Slot::default())),
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Last committed snapshot. Never blocks and never probes the process.
    pub fn status(&self) -> InstanceStatus {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> InstanceState {
        self.snapshot.borrow().state
    }

    /// Buffered server output after `cursor`, and the cursor to pass next.
    pub async fn tail_logs(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.logs.lock().await.tail_after(cursor, limit)
    }

    pub async fn start(self: &Arc<Self>) -> Result<StartReport, SupervisorError> {
        self.run_exclusive(|this, mut slot| async move { this.start_locked(&mut slot).await })
            .await
    }

    pub async fn stop(self: &Arc<Self>) -> Result<StopReport, SupervisorError> {
        self.run_exclusive(|this, mut slot| async move { this.stop_locked(&mut slot).await })
            .await
    }

    /// Stop then start without letting another operation in between.
    pub async fn restart(self: &Arc<Self>) -> Result<StartReport, SupervisorError> {
        self.run_exclusive(|this, mut slot| async move {
            if slot.retired {
                return Err(SupervisorError::Retired(this.key.to_string()));
            }
            this.stop_locked(&mut slot).await?;
            this.start_locked(&mut slot).await
        })
        .await
    }

    /// Retires the instance if it is stopped, running `unlink` while the
    /// operation lock is still held.
    pub(crate) async fn retire_if_stopped<F, Fut>(&self, unlink: F) -> Result<(), SupervisorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut slot = self.slot.lock().await;
        if slot.retired {
            return Ok(());
        }
        let state = self.state();
        if slot.process.is_some() || state != InstanceState::Stopped {
            return Err(SupervisorError::StillRunning {
                key: self.key.to_string(),
                state,
            });
        }
        slot.retired = true;
        unlink().await;
        Ok(())
    }

    /// Stops the process and retires the instance, whatever the outcome.
    pub(crate) async fn shutdown(self: &Arc<Self>) -> Result<StopReport, SupervisorError> {
        self.run_exclusive(|this, mut slot| async move {
            slot.retired = true;
            this.stop_locked(&mut slot).await
        })
        .await
    }

    async fn run_exclusive<T, F, Fut>(self: &Arc<Self>, op: F) -> Result<T, SupervisorError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Self>, OwnedMutexGuard<Slot>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SupervisorError>> + Send + 'static,
    {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let slot = this.slot.clone().lock_owned().await;
            op(this, slot).await
        });
        match task.await {
            Ok(res) => res,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SupervisorError::Shutdown(format!(
                "operation on {} cancelled by runtime shutdown",
                self.key
            ))),
        }
    }

    fn commit(&self, f: impl FnOnce(&mut InstanceStatus)) {
        self.snapshot.send_modify(f);
    }

    fn set_state(&self, state: InstanceState) {
        self.commit(|s| {
            s.state = state;
            s.ready = false;
        });
    }

    async fn start_locked(&self, slot: &mut Slot) -> Result<StartReport, SupervisorError> {
        if slot.retired {
            return Err(SupervisorError::Retired(self.key.to_string()));
        }

        let alive = slot.process.as_ref().is_some_and(ProcessHandle::is_alive);
        if alive && self.state() == InstanceState::Running {
            return Ok(StartReport {
                status: self.status(),
                already_running: true,
                warnings: Vec::new(),
            });
        }

        // A readiness timeout leaves its process behind.
        if slot.process.is_some() {
            tracing::info!(key = %self.key, "terminating leftover server before relaunch");
            self.stop_locked(slot).await?;
        }

        match self.launch_sequence(slot).await {
            Ok(report) => Ok(report),
            Err(err) => {
                let keep_pid = slot.process.is_some();
                tracing::warn!(key = %self.key, code = err.code(), error = %err, "start failed");
                self.commit(|s| {
                    s.state = InstanceState::Failed;
                    s.ready = false;
                    s.last_error = Some(err.to_info());
                    if !keep_pid {
                        s.pid = None;
                    }
                });
                Err(err)
            }
        }
    }

    async fn launch_sequence(&self, slot: &mut Slot) -> Result<StartReport, SupervisorError> {
        self.set_state(InstanceState::Installing);
        let version = self.installer.ensure_installed().await?;

        self.set_state(InstanceState::Configuring);
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .map_err(|e| {
                SupervisorError::Configuration(format!(
                    "create workspace {}: {e}",
                    self.workspace.display()
                ))
            })?;
        let config = InstanceConfig::new(&self.settings, self.port);
        let config_path = instance_config::materialize(&config, &self.instance_dir)
            .await
            .map_err(|e| SupervisorError::Configuration(format_error_chain(&e)))?;
        let probe = HealthProbe::new(
            &instance_config::probe_addr(&self.settings.bind_addr, self.port),
            &self.settings.health_path,
            self.settings.probe_timeout,
        )
        .map_err(|e| SupervisorError::Configuration(format_error_chain(&e)))?;

        let warnings: Vec<String> = self
            .installer
            .install_extensions()
            .await
            .iter()
            .filter_map(ExtensionOutcome::warning)
            .collect();

        self.set_state(InstanceState::Launching);
        let mut args = self.settings.server_args.clone();
        args.extend(config.launch_args(&config_path, &self.workspace));
        let spec = LaunchSpec {
            exec: self.settings.server_bin.clone(),
            args,
            cwd: self.workspace.clone(),
        };

        let run_id = RunId::new();
        let log_cursor = self.logs.lock().await.last_seq();
        let sink = LogSink::new(
            self.logs.clone(),
            Some(self.instance_dir.join("logs").join("console.log")),
            self.settings.log_file_max_bytes,
            self.settings.log_file_max_files,
        );
        sink.emit(format!(
            "{AGENT_PREFIX}run {} ({version}) on port {}",
            run_id.0, self.port
        ))
        .await;

        let launched = process_group::launch(&spec, &sink, self.exit_hook(run_id.clone()))
            .map_err(|e| SupervisorError::Launch {
                message: format!("spawn {}: {e}", spec.exec),
                stderr: String::new(),
            })?;
        let pid = launched.pid;
        let mut exited = launched.exited.clone();
        slot.process = Some(ProcessHandle {
            pid,
            pgid: launched.pgid,
            exited: launched.exited,
        });
        self.commit(|s| {
            s.pid = Some(pid);
            s.run_id = Some(run_id.clone());
        });
        tracing::info!(
            key = %self.key,
            pid,
            port = self.port,
            run_id = %run_id.0,
            "server spawned"
        );

        let run = RunInfo {
            key: self.key.to_string(),
            run_id: run_id.0.clone(),
            started_at_unix_ms: instance_config::unix_ms_now(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: Some(pid),
            pgid: Some(launched.pgid),
            exec: spec.exec.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.display().to_string(),
            env: instance_config::collect_safe_env(),
        };
        if let Err(e) = instance_config::write_run_json(&self.instance_dir, &run).await {
            let error = format_error_chain(&e);
            tracing::warn!(key = %self.key, %error, "failed to write run.json");
        }

        if let Ok(info) =
            tokio::time::timeout(self.settings.launch_grace, process_group::wait_exit(&mut exited))
                .await
        {
            slot.process = None;
            let info = info.map_or_else(|| "unknown exit status".to_string(), |i| i.to_string());
            return Err(self
                .launch_failure(format!("server exited during startup ({info})"), log_cursor)
                .await);
        }

        self.set_state(InstanceState::AwaitingReady);
        let probe_ref = &probe;
        let leader = exited.clone();
        let outcome = poll_with_deadline(
            self.settings.ready_interval,
            self.settings.ready_timeout,
            move |budget| {
                let probe = probe_ref;
                let exited = leader.clone();
                async move {
                    let exit = *exited.borrow();
                    if let Some(info) = exit {
                        return Attempt::Abort(format!(
                            "server exited while waiting for readiness ({info})"
                        ));
                    }
                    match probe.check(budget).await {
                        Ok(()) => Attempt::Ready,
                        Err(e) => Attempt::Pending(e),
                    }
                }
            },
        )
        .await;

        match outcome {
            PollOutcome::Ready { attempts } => {
                tracing::debug!(key = %self.key, attempts, url = probe.url(), "server ready");
            }
            PollOutcome::Aborted(reason) => {
                slot.process = None;
                return Err(self.launch_failure(reason, log_cursor).await);
            }
            PollOutcome::TimedOut {
                attempts,
                last_error,
            } => {
                tracing::warn!(
                    key = %self.key,
                    pid,
                    attempts,
                    last_error = last_error.as_deref().unwrap_or("none"),
                    "server never became healthy; leaving it running for diagnosis"
                );
                return Err(SupervisorError::ReadinessTimeout {
                    port: self.port,
                    waited: self.settings.ready_timeout,
                });
            }
        }

        self.commit(|s| {
            s.state = InstanceState::Running;
            s.ready = true;
            s.last_error = None;
        });
        // The exit hook only flags Running instances; catch an exit that
        // slipped in between the last probe and the commit.
        if self.leader_gone(&exited) {
            slot.process = None;
            return Err(self
                .launch_failure("server exited right after becoming ready".to_string(), log_cursor)
                .await);
        }

        tracing::info!(key = %self.key, pid, port = self.port, "server running");
        Ok(StartReport {
            status: self.status(),
            already_running: false,
            warnings,
        })
    }

    /// The hook clears the pid before the exit is published on `exited`,
    /// so either signal means the leader is gone.
    fn leader_gone(&self, exited: &watch::Receiver<Option<ExitInfo>>) -> bool {
        exited.borrow().is_some() || self.status().pid.is_none()
    }

    async fn launch_failure(&self, message: String, cursor: u64) -> SupervisorError {
        let stderr = self
            .logs
            .lock()
            .await
            .stderr_since(cursor, LAUNCH_STDERR_LINES);
        SupervisorError::Launch {
            message,
            stderr: truncate_utf8(&stderr, MAX_STDERR_BYTES),
        }
    }

    /// Runs on the monitor task when the leader exits. Launch and stop paths
    /// handle their own exits; this only clears the pid for them and flags
    /// an exit out of Running as a failure.
    fn exit_hook(&self, run_id: RunId) -> impl FnOnce(ExitInfo) + Send + use<> {
        let snapshot = self.snapshot.clone();
        let key = self.key.clone();
        move |info| {
            let mut crashed = false;
            snapshot.send_if_modified(|s| {
                if s.run_id.as_ref() != Some(&run_id)
                    || s.pid.is_none()
                    || s.state == InstanceState::Stopping
                {
                    return false;
                }
                s.pid = None;
                s.ready = false;
                if s.state == InstanceState::Running {
                    crashed = true;
                    s.state = InstanceState::Failed;
                    s.last_error = Some(ErrorInfo {
                        code: "launch_error".to_string(),
                        message: format!("server exited unexpectedly: {info}"),
                    });
                }
                true
            });
            if crashed {
                tracing::warn!(key = %key, %info, "server exited unexpectedly");
            }
        }
    }

    async fn stop_locked(&self, slot: &mut Slot) -> Result<StopReport, SupervisorError> {
        let Some(handle) = slot.process.as_mut() else {
            self.commit(|s| {
                s.state = InstanceState::Stopped;
                s.ready = false;
                s.pid = None;
            });
            return Ok(StopReport::NotRunning);
        };

        let (pid, pgid) = (handle.pid, handle.pgid);
        self.set_state(InstanceState::Stopping);
        tracing::info!(key = %self.key, pid, pgid, "stopping server");

        match process_group::terminate(pgid, &mut handle.exited, self.settings.stop_grace).await {
            Ok(termination) => {
                slot.process = None;
                self.commit(|s| {
                    s.state = InstanceState::Stopped;
                    s.ready = false;
                    s.pid = None;
                });
                tracing::info!(key = %self.key, pid, ?termination, "server stopped");
                Ok(StopReport::Stopped(termination))
            }
            Err(e) => {
                let err = SupervisorError::Shutdown(format!("signal process group {pgid}: {e}"));
                tracing::error!(key = %self.key, pid, error = %err, "stop failed");
                self.commit(|s| {
                    s.state = InstanceState::Failed;
                    s.last_error = Some(err.to_info());
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
impl Instance {
    /// Installs a live handle whose group cannot be signaled (pgid 1 is
    /// refused). The handle stays alive while the returned sender is held.
    pub(crate) async fn adopt_unsignalable(&self) -> watch::Sender<Option<ExitInfo>> {
        let (tx, rx) = watch::channel(None);
        self.slot.lock().await.process = Some(ProcessHandle {
            pid: 1,
            pgid: 1,
            exited: rx,
        });
        self.commit(|s| {
            s.state = InstanceState::Running;
            s.ready = true;
            s.pid = Some(1);
        });
        tx
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{
        CRASHER, SLEEPER, eventually, fake_settings, free_port, pid_alive, serve_http,
        serve_http_at, serve_http_on,
    };

    fn instance(settings: Settings, key: &str, port: u16) -> Arc<Instance> {
        let settings = Arc::new(settings);
        let installer = Arc::new(Installer::new(settings.clone()));
        let key = WorkspaceKey(key.to_string());
        let workspace = settings.default_workspace(&key);
        Arc::new(Instance::new(key, workspace, port, settings, installer))
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let inst = instance(fake_settings(dir.path(), SLEEPER, port), "ws1", port);

        let first = inst.start().await.unwrap();
        assert!(!first.already_running);
        assert_eq!(first.status.state, InstanceState::Running);
        assert!(first.status.ready);
        assert_eq!(first.status.port, port);
        let pid = first.status.pid.unwrap();
        assert!(pid_alive(pid));

        let second = inst.start().await.unwrap();
        assert!(second.already_running);
        assert_eq!(second.status.pid, Some(pid));

        let dir_path = dir.path().join("instances").join("ws1");
        assert!(dir_path.join("config.yaml").is_file());
        let run: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir_path.join("run.json")).unwrap()).unwrap();
        assert_eq!(run["pid"].as_u64(), Some(pid as u64));
        assert!(inst.workspace().is_dir());

        assert_eq!(
            inst.stop().await.unwrap(),
            StopReport::Stopped(Termination::Graceful)
        );
        let status = inst.status();
        assert_eq!(status.state, InstanceState::Stopped);
        assert!(!status.ready);
        assert_eq!(status.pid, None);
        assert!(eventually(Duration::from_secs(2), || !pid_alive(pid)).await);
    }

    #[tokio::test]
    async fn stop_without_a_process_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(fake_settings(dir.path(), SLEEPER, 8080), "idle", 8080);
        assert_eq!(inst.stop().await.unwrap(), StopReport::NotRunning);
        assert_eq!(inst.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn restart_spawns_a_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let inst = instance(fake_settings(dir.path(), SLEEPER, port), "ws1", port);

        let before = inst.start().await.unwrap().status.pid.unwrap();
        let after = inst.restart().await.unwrap();
        assert!(!after.already_running);
        assert_ne!(after.status.pid.unwrap(), before);
        assert!(eventually(Duration::from_secs(2), || !pid_alive(before)).await);
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn early_exit_is_a_launch_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let inst = instance(fake_settings(dir.path(), CRASHER, port), "ws1", port);

        let err = inst.start().await.unwrap_err();
        assert_eq!(err.code(), "launch_error");
        assert!(err.message().contains("boom: EADDRINUSE"), "{}", err.message());

        let status = inst.status();
        assert_eq!(status.state, InstanceState::Failed);
        assert_eq!(status.pid, None);
        assert!(!status.ready);
        assert_eq!(status.last_error.unwrap().code, "launch_error");

        // The attempt failed, not the instance.
        let again = inst.start().await.unwrap_err();
        assert_eq!(again.code(), "launch_error");
    }

    #[tokio::test]
    async fn readiness_timeout_keeps_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let mut settings = fake_settings(dir.path(), SLEEPER, port);
        settings.ready_timeout = Duration::from_millis(700);
        let inst = instance(settings, "ws2", port);

        let err = inst.start().await.unwrap_err();
        assert_eq!(err.code(), "readiness_timeout");
        assert!(err.to_string().contains("timeout"));

        let status = inst.status();
        assert_eq!(status.state, InstanceState::Failed);
        assert!(!status.ready);
        let pid = status.pid.unwrap();
        assert!(pid_alive(pid));

        assert_eq!(
            inst.stop().await.unwrap(),
            StopReport::Stopped(Termination::Graceful)
        );
        assert!(eventually(Duration::from_secs(2), || !pid_alive(pid)).await);
    }

    #[tokio::test]
    async fn leftover_process_is_replaced_on_the_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let mut settings = fake_settings(dir.path(), SLEEPER, port);
        settings.ready_timeout = Duration::from_millis(500);
        let inst = instance(settings, "ws2", port);

        inst.start().await.unwrap_err();
        let stale = inst.status().pid.unwrap();

        let (_, _server) = serve_http_on(port, 200).await;
        let report = inst.start().await.unwrap();
        assert_ne!(report.status.pid, Some(stale));
        assert!(eventually(Duration::from_secs(2), || !pid_alive(stale)).await);
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn death_while_awaiting_readiness_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let mut settings = fake_settings(
            dir.path(),
            "sleep 1; echo 'late failure' >&2; exit 4",
            port,
        );
        settings.ready_timeout = Duration::from_secs(30);
        let inst = instance(settings, "ws1", port);

        let started = tokio::time::Instant::now();
        let err = inst.start().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(err.code(), "launch_error");
        assert!(err.message().contains("late failure"), "{}", err.message());
        assert_eq!(inst.status().pid, None);
    }

    #[tokio::test]
    async fn unexpected_exit_after_running_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let inst = instance(fake_settings(dir.path(), "sleep 1; exit 0", port), "ws1", port);

        let pid = inst.start().await.unwrap().status.pid.unwrap();
        assert!(eventually(Duration::from_secs(5), || inst.status().pid.is_none()).await);

        let status = inst.status();
        assert_eq!(status.state, InstanceState::Failed);
        assert!(!status.ready);
        assert!(status.last_error.unwrap().message.contains("exited unexpectedly"));

        // A later start relaunches rather than reporting already_running.
        let report = inst.start().await.unwrap();
        assert!(!report.already_running);
        assert_ne!(report.status.pid, Some(pid));
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn installation_failure_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(dir.path(), SLEEPER, 8080);
        settings.server_bin = dir.path().join("nope/code-server").display().to_string();
        settings.server_args.clear();
        let inst = instance(settings, "ws1", 8080);

        let err = inst.start().await.unwrap_err();
        assert_eq!(err.code(), "installation_error");
        assert_eq!(inst.status().state, InstanceState::Failed);
        assert_eq!(inst.status().pid, None);
        assert!(!dir.path().join("instances/ws1/run.json").exists());
    }

    #[tokio::test]
    async fn extension_failures_surface_as_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let mut settings = fake_settings(dir.path(), SLEEPER, port);
        settings.server_args[1] = format!(
            "[ \"$1\" = --version ] && echo 4.0.0 && exit 0\n\
             [ \"$1\" = --install-extension ] && {{ echo 'marketplace down' >&2; exit 1; }}\n\
             {SLEEPER}"
        );
        settings.extensions = vec!["ms-python.python".to_string()];
        let inst = instance(settings, "ws1", port);

        let report = inst.start().await.unwrap();
        assert_eq!(report.status.state, InstanceState::Running);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("ms-python.python"));
        assert!(report.warnings[0].contains("marketplace down"));
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_start_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let inst = instance(fake_settings(dir.path(), SLEEPER, port), "ws1", port);

        let abandoned = tokio::time::timeout(Duration::from_millis(600), inst.start()).await;
        assert!(abandoned.is_err());
        assert!(inst.status().pid.is_some());

        let (_, _server) = serve_http_on(port, 200).await;
        assert!(
            eventually(Duration::from_secs(5), || inst.state() == InstanceState::Running).await
        );
        assert!(inst.start().await.unwrap().already_running);
        inst.stop().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_reaches_helper_children() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let body = "sleep 300 &\necho $! > helper.pid\nwait";
        let inst = instance(fake_settings(dir.path(), body, port), "ws1", port);

        inst.start().await.unwrap();
        let helper_file = inst.workspace().join("helper.pid");
        assert!(eventually(Duration::from_secs(2), || helper_file.is_file()).await);
        let helper: u32 = std::fs::read_to_string(&helper_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid_alive(helper));

        inst.stop().await.unwrap();
        assert!(eventually(Duration::from_secs(3), || !pid_alive(helper)).await);
    }

    #[tokio::test]
    async fn logs_capture_server_output() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let body = "echo 'listening'\nexec sleep 300";
        let inst = instance(fake_settings(dir.path(), body, port), "ws1", port);

        inst.start().await.unwrap();
        let (lines, next) = inst.tail_logs(0, 10).await;
        assert!(lines.iter().any(|l| l == "[stdout] listening"), "{lines:?}");
        assert!(lines[0].starts_with(AGENT_PREFIX));
        assert!(next > 0);
        inst.stop().await.unwrap();

        let console = dir.path().join("instances/ws1/logs/console.log");
        assert!(eventually(Duration::from_secs(2), || {
            std::fs::read_to_string(&console).is_ok_and(|t| t.contains("listening"))
        })
        .await);
    }

    #[tokio::test]
    async fn unusable_workspace_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _server) = serve_http(200).await;
        let inst = instance(fake_settings(dir.path(), SLEEPER, port), "ws1", port);
        std::fs::create_dir_all(inst.workspace().parent().unwrap()).unwrap();
        std::fs::write(inst.workspace(), b"not a directory").unwrap();

        let err = inst.start().await.unwrap_err();
        assert_eq!(err.code(), "configuration_error");
        let status = inst.status();
        assert_eq!(status.state, InstanceState::Failed);
        assert_eq!(status.pid, None);
        assert!(!status.ready);
        assert_eq!(status.last_error.unwrap().code, "configuration_error");
        assert!(!dir.path().join("instances/ws1/run.json").exists());

        std::fs::remove_file(inst.workspace()).unwrap();
        let report = inst.start().await.unwrap();
        assert_eq!(report.status.state, InstanceState::Running);
        assert!(report.status.last_error.is_none());
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_signal_delivery_keeps_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(fake_settings(dir.path(), SLEEPER, 8080), "ws1", 8080);
        let _alive = inst.adopt_unsignalable().await;

        let err = inst.stop().await.unwrap_err();
        assert_eq!(err.code(), "shutdown_error");
        let status = inst.status();
        assert_eq!(status.state, InstanceState::Failed);
        assert_eq!(status.pid, Some(1));
        assert_eq!(status.last_error.unwrap().code, "shutdown_error");
        assert!(inst.slot.lock().await.process.is_some());

        // The handle is still held, so the instance cannot be retired.
        let refused = inst.retire_if_stopped(|| async {}).await.unwrap_err();
        assert_eq!(refused.code(), "still_running");
        assert_eq!(inst.stop().await.unwrap_err().code(), "shutdown_error");
    }

    #[tokio::test]
    async fn exit_seen_by_the_hook_counts_before_it_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(fake_settings(dir.path(), SLEEPER, 8080), "ws1", 8080);
        let run_id = RunId::new();
        inst.commit(|s| {
            s.state = InstanceState::AwaitingReady;
            s.pid = Some(4242);
            s.run_id = Some(run_id.clone());
        });
        let (_tx, exited) = watch::channel(None);
        assert!(!inst.leader_gone(&exited));

        (inst.exit_hook(run_id))(ExitInfo {
            code: Some(0),
            signal: None,
        });
        assert_eq!(inst.state(), InstanceState::AwaitingReady);
        assert_eq!(inst.status().pid, None);
        assert!(inst.leader_gone(&exited));
    }

    #[tokio::test]
    async fn readiness_follows_the_bind_address() {
        let Ok((port, _server)) = serve_http_at("::1", 0, 200).await else {
            // No IPv6 loopback here.
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(dir.path(), SLEEPER, port);
        settings.bind_addr = "::1".to_string();
        settings.ready_timeout = Duration::from_secs(3);
        let inst = instance(settings, "ws1", port);

        let report = inst.start().await.unwrap();
        assert_eq!(report.status.state, InstanceState::Running);
        assert!(report.status.ready);
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retired_instance_rejects_start() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(fake_settings(dir.path(), SLEEPER, 8080), "ws1", 8080);
        inst.retire_if_stopped(|| async {}).await.unwrap();
        assert_eq!(inst.start().await.unwrap_err().code(), "retired");
        assert_eq!(inst.restart().await.unwrap_err().code(), "retired");
    }
}
