use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::Arc,
};

use codehost_process::{InstanceState, WorkspaceKey};
use futures_util::future::join_all;
use tokio::sync::RwLock;

use crate::{
    error::SupervisorError,
    install::Installer,
    port_alloc::next_free_port,
    settings::Settings,
    supervisor::{Instance, StartReport, StopReport},
};

const MAX_KEY_LEN: usize = 128;

/// A single path component made of `[A-Za-z0-9._-]`, other than `.` and `..`.
pub(crate) fn is_safe_component(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_KEY_LEN
        && raw != "."
        && raw != ".."
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Keys become directory names, so only a safe path component is allowed.
pub fn validate_key(raw: &str) -> Result<WorkspaceKey, SupervisorError> {
    if is_safe_component(raw) {
        Ok(WorkspaceKey(raw.to_string()))
    } else {
        Err(SupervisorError::InvalidKey(raw.to_string()))
    }
}

/// All instances known to this host process, keyed by workspace.
pub struct Registry {
    settings: Arc<Settings>,
    installer: Arc<Installer>,
    instances: RwLock<BTreeMap<WorkspaceKey, Arc<Instance>>>,
}

impl Registry {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        Self {
            installer: Arc::new(Installer::new(settings.clone())),
            settings,
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the instance for `key`, creating it on first use.
    pub async fn resolve(&self, key: &str) -> Result<Arc<Instance>, SupervisorError> {
        let key = validate_key(key)?;
        if let Some(inst) = self.instances.read().await.get(&key) {
            return Ok(inst.clone());
        }

        let mut map = self.instances.write().await;
        if let Some(inst) = map.get(&key) {
            return Ok(inst.clone());
        }
        let taken: BTreeSet<u16> = map.values().map(|i| i.port()).collect();
        let port = next_free_port(self.settings.base_port, &taken).ok_or_else(|| {
            SupervisorError::Configuration(format!(
                "no free port at or above {}",
                self.settings.base_port
            ))
        })?;
        let workspace = self.settings.default_workspace(&key);
        let inst = Arc::new(Instance::new(
            key.clone(),
            workspace,
            port,
            self.settings.clone(),
            self.installer.clone(),
        ));
        tracing::debug!(key = %key, port, "workspace registered");
        map.insert(key, inst.clone());
        Ok(inst)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .await
            .get(&WorkspaceKey(key.to_string()))
            .cloned()
    }

    /// Forgets a stopped instance. A later `resolve` creates a fresh one.
    pub async fn remove(&self, key: &str) -> Result<(), SupervisorError> {
        let inst = self
            .get(key)
            .await
            .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;

        let instances = &self.instances;
        let target = &inst;
        inst.retire_if_stopped(move || async move {
            let mut map = instances.write().await;
            if map.get(target.key()).is_some_and(|cur| Arc::ptr_eq(cur, target)) {
                map.remove(target.key());
            }
        })
        .await?;
        tracing::debug!(key = %key, "workspace removed");
        Ok(())
    }

    pub async fn list_statuses(&self) -> BTreeMap<String, InstanceState> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(k, inst)| (k.to_string(), inst.state()))
            .collect()
    }

    /// Stops every instance and empties the registry. Failures are logged,
    /// never returned; calling it again is a no-op.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<Instance>> = {
            let mut map = self.instances.write().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        if drained.is_empty() {
            return;
        }

        tracing::info!(count = drained.len(), "stopping all workspaces");
        let results = join_all(drained.iter().map(|inst| inst.shutdown())).await;
        for (inst, res) in drained.iter().zip(results) {
            if let Err(e) = res {
                tracing::warn!(key = %inst.key(), error = %e, "workspace did not stop cleanly");
            }
        }
    }

    /// Runs `op` on the live instance for `key`, re-resolving once if the
    /// instance was retired while we held it.
    async fn with_live_instance<T, F, Fut>(&self, key: &str, op: F) -> Result<T, SupervisorError>
    where
        F: Fn(Arc<Instance>) -> Fut,
        Fut: Future<Output = Result<T, SupervisorError>>,
    {
        let mut retried = false;
        loop {
            let inst = self.resolve(key).await?;
            match op(inst).await {
                Err(SupervisorError::Retired(_)) if !retried => {
                    tracing::debug!(key = %key, "instance retired concurrently; re-resolving");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    pub async fn start(&self, key: &str) -> Result<StartReport, SupervisorError> {
        self.with_live_instance(key, |inst| async move { inst.start().await })
            .await
    }

    pub async fn restart(&self, key: &str) -> Result<StartReport, SupervisorError> {
        self.with_live_instance(key, |inst| async move { inst.restart().await })
            .await
    }

    /// Stops `key` and forgets it once it is stopped.
    pub async fn stop(&self, key: &str) -> Result<StopReport, SupervisorError> {
        let inst = self
            .get(key)
            .await
            .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;
        let report = inst.stop().await?;
        match self.remove(key).await {
            // Someone restarted or removed it in the meantime.
            Ok(())
            | Err(SupervisorError::StillRunning { .. })
            | Err(SupervisorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(report)
    }
}
