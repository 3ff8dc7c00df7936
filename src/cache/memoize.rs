use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::storage::CacheStore;
use crate::executor::Task;

impl CacheStore {
    /// Return the cached value for `key`, or run `compute` and cache its result.
    ///
    /// Errors from `compute` are returned as-is and nothing is stored.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, compute: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        debug!(key, "computing uncached value");
        let value = compute().await?;
        self.set(key, &value).await;
        Ok(value)
    }
}

impl<T> Task<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Memoise this task under `key`.
    ///
    /// Every attempt checks the store first, so a value cached by an earlier
    /// run skips the work entirely.
    pub fn cached(self, store: Arc<CacheStore>, key: impl Into<String>) -> Task<T> {
        let key: Arc<str> = Arc::from(key.into());
        let label = self.label().map(str::to_string);
        let inner = self;

        let task = Task::new(move || {
            let store = Arc::clone(&store);
            let key = Arc::clone(&key);
            let inner = inner.clone();
            async move {
                store
                    .get_or_compute(&key, || inner.attempt())
                    .await
            }
        });

        match label {
            Some(label) => task.with_label(label),
            None => task,
        }
    }
}
