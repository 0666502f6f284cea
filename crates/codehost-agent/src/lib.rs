//! Supervises one development-server process per workspace: install check,
//! config materialization, detached launch, readiness gating and
//! process-group shutdown, behind a registry keyed by workspace.

mod error;
mod install;
mod instance_config;
mod logs;
mod port_alloc;
mod process_group;
mod projects;
mod readiness;
mod registry;
mod service;
mod settings;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use error::{MAX_MESSAGE_BYTES, MAX_STDERR_BYTES, SupervisorError};
pub use install::{ExtensionOutcome, Installer};
pub use instance_config::InstanceConfig;
pub use process_group::{ExitInfo, Termination};
pub use projects::{DirectoryScaffolder, ProjectScaffolder, list_projects, validate_project_name};
pub use registry::{Registry, validate_key};
pub use service::CodeHostService;
pub use settings::Settings;
pub use supervisor::{Instance, StartReport, StopReport};
