//! JSON-shaped operations over a [`Registry`].
//!
//! Every call returns a response carrying a `status`; failures are reported
//! through `message` and `code` instead of `Err`.

use std::sync::Arc;

use codehost_process::{
    CreateProjectResponse, HealthResponse, InstanceStatus, ListProjectsResponse, LogsResponse,
    ResultStatus, StartOutcome, StartResponse, StatusOutcome, StatusResponse, StopOutcome,
    StopResponse,
};

use crate::{
    error::{SupervisorError, format_error_chain},
    projects::{self, ProjectScaffolder},
    registry::{Registry, validate_key},
    supervisor::{StartReport, StopReport},
};

const DEFAULT_LOG_LIMIT: usize = 200;

pub struct CodeHostService {
    registry: Arc<Registry>,
    scaffolder: Arc<dyn ProjectScaffolder>,
}

fn start_ok(report: StartReport) -> StartResponse {
    let (status, message) = if report.already_running {
        (StartOutcome::AlreadyRunning, "Code server is already running")
    } else {
        (StartOutcome::Running, "Code server started")
    };
    let s = report.status;
    StartResponse {
        status,
        message: Some(message.to_string()),
        code: None,
        port: Some(s.port),
        url: Some(s.url),
        workspace: Some(s.workspace),
        pid: s.pid,
        warnings: report.warnings,
    }
}

fn start_err(err: &SupervisorError, last: Option<InstanceStatus>) -> StartResponse {
    StartResponse {
        status: StartOutcome::Error,
        message: Some(err.message()),
        code: Some(err.code().to_string()),
        port: last.as_ref().map(|s| s.port),
        url: last.as_ref().map(|s| s.url.clone()),
        workspace: last.as_ref().map(|s| s.workspace.clone()),
        pid: last.and_then(|s| s.pid),
        warnings: Vec::new(),
    }
}

fn status_of(s: InstanceStatus) -> StatusResponse {
    let live = s.has_process();
    StatusResponse {
        status: if live {
            StatusOutcome::Running
        } else {
            StatusOutcome::Stopped
        },
        state: Some(s.state),
        ready: Some(s.ready),
        port: live.then_some(s.port),
        url: live.then(|| s.url.clone()),
        workspace: Some(s.workspace),
        pid: s.pid,
        message: s.last_error.map(|e| e.message),
    }
}

impl CodeHostService {
    pub fn new(registry: Arc<Registry>, scaffolder: Arc<dyn ProjectScaffolder>) -> Self {
        Self {
            registry,
            scaffolder,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    async fn last_status(&self, key: &str) -> Option<InstanceStatus> {
        self.registry.get(key).await.map(|inst| inst.status())
    }

    pub async fn start(&self, key: &str) -> StartResponse {
        match self.registry.start(key).await {
            Ok(report) => start_ok(report),
            Err(e) => start_err(&e, self.last_status(key).await),
        }
    }

    pub async fn restart(&self, key: &str) -> StartResponse {
        match self.registry.restart(key).await {
            Ok(report) => start_ok(report),
            Err(e) => start_err(&e, self.last_status(key).await),
        }
    }

    pub async fn stop(&self, key: &str) -> StopResponse {
        let (status, message) = match self.registry.stop(key).await {
            Ok(StopReport::Stopped(_)) => (StopOutcome::Stopped, "Code server stopped".to_string()),
            Ok(StopReport::NotRunning) => {
                (StopOutcome::NotRunning, "Code server is not running".to_string())
            }
            Err(SupervisorError::NotFound(_)) => (
                StopOutcome::NotRunning,
                "Code server was not initialized".to_string(),
            ),
            Err(e) => (StopOutcome::Error, e.message()),
        };
        StopResponse {
            status,
            message: Some(message),
        }
    }

    pub async fn status(&self, key: &str) -> StatusResponse {
        match self.last_status(key).await {
            Some(s) => status_of(s),
            None => StatusResponse {
                status: StatusOutcome::NotInitialized,
                state: None,
                ready: None,
                port: None,
                url: None,
                workspace: None,
                pid: None,
                message: Some("Code server not initialized for this workspace".to_string()),
            },
        }
    }

    pub async fn health(&self) -> HealthResponse {
        let instances = self.registry.list_statuses().await;
        HealthResponse {
            status: "healthy".to_string(),
            active_count: u32::try_from(instances.len()).unwrap_or(u32::MAX),
            instances,
        }
    }

    pub async fn shutdown_all(&self) {
        self.registry.shutdown_all().await;
    }

    /// Server output after `cursor` (empty or unparsable means the most recent
    /// lines). Unknown workspaces have no output.
    pub async fn logs(
        &self,
        key: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> LogsResponse {
        let cursor = cursor.and_then(|c| c.trim().parse::<u64>().ok()).unwrap_or(0);
        let limit = limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, self.registry.settings().log_max_lines.max(1));
        let Some(inst) = self.registry.get(key).await else {
            return LogsResponse {
                lines: Vec::new(),
                next_cursor: cursor.to_string(),
            };
        };
        let (lines, next) = inst.tail_logs(cursor, limit).await;
        LogsResponse {
            lines,
            next_cursor: next.to_string(),
        }
    }

    /// Read-only: does not create an instance for `key`.
    pub async fn list_projects(&self, key: &str) -> ListProjectsResponse {
        let key = match validate_key(key) {
            Ok(k) => k,
            Err(e) => {
                return ListProjectsResponse {
                    status: ResultStatus::Error,
                    message: Some(e.message()),
                    workspace: String::new(),
                    projects: Vec::new(),
                };
            }
        };
        let workspace = match self.registry.get(key.as_str()).await {
            Some(inst) => inst.workspace().to_path_buf(),
            None => self.registry.settings().default_workspace(&key),
        };
        match projects::list_projects(&workspace).await {
            Ok(projects) => ListProjectsResponse {
                status: ResultStatus::Success,
                message: None,
                workspace: workspace.display().to_string(),
                projects,
            },
            Err(e) => {
                let error = format_error_chain(&e);
                tracing::warn!(key = %key, %error, "failed to list projects");
                ListProjectsResponse {
                    status: ResultStatus::Error,
                    message: Some(error),
                    workspace: workspace.display().to_string(),
                    projects: Vec::new(),
                }
            }
        }
    }

    /// Starts the workspace's server if needed, then scaffolds `name` in it.
    pub async fn create_project(
        &self,
        key: &str,
        project_type: &str,
        name: &str,
    ) -> CreateProjectResponse {
        let failed = |message: String, code_server: Option<StartResponse>| CreateProjectResponse {
            status: ResultStatus::Error,
            message: Some(message),
            project_path: None,
            project_type: project_type.to_string(),
            code_server,
        };

        if let Err(e) = projects::validate_project_name(name) {
            return failed(format_error_chain(&e), None);
        }

        let (workspace, started) = match self.registry.start(key).await {
            Ok(report) => (report.status.workspace.clone(), start_ok(report)),
            Err(e) => {
                let resp = start_err(&e, self.last_status(key).await);
                return failed(
                    format!("code server failed to start: {}", e.message()),
                    Some(resp),
                );
            }
        };

        let scaffolder = self.scaffolder.clone();
        let (kind, project) = (project_type.to_string(), name.to_string());
        let made = tokio::task::spawn_blocking(move || {
            scaffolder.materialize(&kind, &project, std::path::Path::new(&workspace))
        })
        .await;

        match made {
            Ok(Ok(path)) => {
                tracing::info!(key = %key, project = %name, project_type, "project created");
                CreateProjectResponse {
                    status: ResultStatus::Success,
                    message: None,
                    project_path: Some(path.display().to_string()),
                    project_type: project_type.to_string(),
                    code_server: Some(started),
                }
            }
            Ok(Err(e)) => failed(format_error_chain(&e), Some(started)),
            Err(e) => failed(format!("scaffolder task failed: {e}"), Some(started)),
        }
    }
}
