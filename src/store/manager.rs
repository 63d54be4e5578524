use super::{DrainReport, ProfileStore, StoreConfig};
use crate::core::{ProfileData, Result, StoreError};
use crate::remote::{MockRemoteStore, RemoteKeyValue};
use crate::task::Task;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Level, event};

/// Registry of profile stores sharing one remote service.
///
/// Passed explicitly to whatever loads profiles; there is no process-wide
/// singleton. Several managers (and stores) may coexist in one process.
#[derive(Clone)]
pub struct StoreManager {
    remote: Arc<dyn RemoteKeyValue>,
    config: StoreConfig,
    stores: Arc<Mutex<HashMap<String, ProfileStore>>>,
}

impl StoreManager {
    pub fn new(remote: Arc<dyn RemoteKeyValue>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            remote,
            config,
            stores: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// A manager backed by an in-process mock store, for offline use.
    pub fn mock(config: StoreConfig) -> Result<(Self, MockRemoteStore)> {
        let remote = MockRemoteStore::new();
        let manager = Self::new(Arc::new(remote.clone()), config)?;
        Ok((manager, remote))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Creates a store named `name` with `template` as its default data.
    ///
    /// `template` must be a JSON object. The returned task settles after the
    /// connectivity probe; it rejects with `StoreUnavailable` if the service
    /// is unreachable.
    pub fn create(&self, name: &str, template: Value) -> Task<ProfileStore> {
        let template: ProfileData = match template {
            Value::Object(fields) => fields,
            other => {
                return Task::rejected(StoreError::InvalidConfig(format!(
                    "template for store '{}' must be a JSON object, got {}",
                    name, other
                )));
            }
        };
        if self.store(name).is_some() {
            return Task::rejected(StoreError::InvalidConfig(format!(
                "store '{}' already exists",
                name
            )));
        }

        let manager = self.clone();
        let name = name.to_string();
        Task::spawn(async move {
            let store = ProfileStore::open(
                &name,
                template,
                manager.remote.clone(),
                manager.config.clone(),
            )
            .await?;
            let mut stores = manager
                .stores
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if stores.contains_key(&name) {
                return Err(StoreError::InvalidConfig(format!(
                    "store '{}' already exists",
                    name
                )));
            }
            stores.insert(name, store.clone());
            Ok(store)
        })
    }

    pub fn store(&self, name: &str) -> Option<ProfileStore> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn stores(&self) -> Vec<ProfileStore> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Drains every store, bounded by the configured drain timeout overall.
    pub async fn shutdown(&self) -> Vec<DrainReport> {
        let deadline = Instant::now() + self.config.drain_timeout;
        let stores = self.stores();
        event!(Level::INFO, stores = stores.len(), "draining profile stores");
        join_all(stores.iter().map(|store| store.drain(deadline))).await
    }

    /// Drains all stores once `exit_signal` resolves.
    ///
    /// Bind this to the host's "last chance before exit" notification, e.g.
    /// `tokio::signal::ctrl_c()`, and await the handle before exiting.
    pub fn bind_shutdown<F>(&self, exit_signal: F) -> JoinHandle<Vec<DrainReport>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            exit_signal.await;
            manager.shutdown().await
        })
    }
}
