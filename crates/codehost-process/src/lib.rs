use std::{collections::BTreeMap, fmt};

use specta::Type;

/// Stable identifier of one workspace (a sandbox id).
///
/// NOTE: The agent validates keys before using them as directory names.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(transparent)]
pub struct WorkspaceKey(pub String);

impl WorkspaceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a single launch of a server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    Installing,
    Configuring,
    Launching,
    AwaitingReady,
    Running,
    Stopping,
    Failed,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Installing => "installing",
            InstanceState::Configuring => "configuring",
            InstanceState::Launching => "launching",
            InstanceState::AwaitingReady => "awaiting_ready",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// Last committed view of one instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceStatus {
    pub key: WorkspaceKey,
    pub state: InstanceState,
    pub ready: bool,
    pub port: u16,
    pub url: String,
    pub workspace: String,
    /// Set while a server process is alive, even if it never became ready.
    pub pid: Option<u32>,
    pub run_id: Option<RunId>,
    pub last_error: Option<ErrorInfo>,
}

impl InstanceStatus {
    pub fn has_process(&self) -> bool {
        self.pid.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Running,
    AlreadyRunning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StartResponse {
    pub status: StartOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StopResponse {
    pub status: StopOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum StatusOutcome {
    Running,
    Stopped,
    NotInitialized,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StatusResponse {
    pub status: StatusOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct HealthResponse {
    pub status: String,
    pub active_count: u32,
    pub instances: BTreeMap<String, InstanceState>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct LogsResponse {
    pub lines: Vec<String>,
    pub next_cursor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Nextjs,
    React,
    Nodejs,
    Python,
    Rust,
    Go,
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ProjectInfo {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ProjectKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ListProjectsResponse {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub workspace: String,
    pub projects: Vec<ProjectInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct CreateProjectResponse {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub project_type: String,
    /// Absent when the request was rejected before the server was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_server: Option<StartResponse>,
}
