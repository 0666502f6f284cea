use std::path::{Path, PathBuf};

use anyhow::Context;
use codehost_process::{ProjectInfo, ProjectKind};

use crate::registry::is_safe_component;

/// Produces a project's files inside a workspace. Called only once the
/// workspace's server is running.
pub trait ProjectScaffolder: Send + Sync {
    fn materialize(&self, project_type: &str, name: &str, root: &Path) -> anyhow::Result<PathBuf>;
}

/// Creates an empty project directory and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryScaffolder;

impl ProjectScaffolder for DirectoryScaffolder {
    fn materialize(&self, _project_type: &str, name: &str, root: &Path) -> anyhow::Result<PathBuf> {
        let path = root.join(name);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create project dir {}", path.display()))?;
        Ok(path)
    }
}

pub fn validate_project_name(name: &str) -> anyhow::Result<()> {
    if !is_safe_component(name) {
        anyhow::bail!("invalid project name {name:?}");
    }
    Ok(())
}

fn kind_from_package_json(text: &str) -> ProjectKind {
    let Ok(pkg) = serde_json::from_str::<serde_json::Value>(text) else {
        return ProjectKind::Nodejs;
    };
    let deps = pkg.get("dependencies").and_then(|d| d.as_object());
    match deps {
        Some(d) if d.contains_key("next") => ProjectKind::Nextjs,
        Some(d) if d.contains_key("react") => ProjectKind::React,
        _ => ProjectKind::Nodejs,
    }
}

async fn detect_kind(dir: &Path) -> ProjectKind {
    if let Ok(text) = tokio::fs::read_to_string(dir.join("package.json")).await {
        return kind_from_package_json(&text);
    }
    let markers = [
        ("requirements.txt", ProjectKind::Python),
        ("Cargo.toml", ProjectKind::Rust),
        ("go.mod", ProjectKind::Go),
    ];
    for (file, kind) in markers {
        if tokio::fs::try_exists(dir.join(file)).await.unwrap_or(false) {
            return kind;
        }
    }
    ProjectKind::Unknown
}

/// Top-level project directories of `workspace`, sorted by name. Hidden
/// directories are skipped; a missing workspace has no projects.
pub async fn list_projects(workspace: &Path) -> anyhow::Result<Vec<ProjectInfo>> {
    let mut entries = match tokio::fs::read_dir(workspace).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read workspace {}", workspace.display()));
        }
    };

    let mut projects = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read workspace {}", workspace.display()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let path = entry.path();
        projects.push(ProjectInfo {
            kind: detect_kind(&path).await,
            path: path.display().to_string(),
            name,
        });
    }
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(projects)
}
