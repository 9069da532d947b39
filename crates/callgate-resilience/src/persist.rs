//! Bridges from async components to the blocking persistence ports.

use callgate_core::{GateError, GateResult, KeyValueStore, StoreError};
use std::sync::Arc;

/// Run a blocking store call on the blocking pool, keeping the store error
pub(crate) async fn blocking_store<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(StoreError::Backend(format!("storage task failed: {e}"))))
}

/// Run a blocking store call on the blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> GateResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    blocking_store(f).await.map_err(GateError::from)
}

pub(crate) async fn kv_get(store: &Arc<dyn KeyValueStore>, key: &str) -> GateResult<Option<String>> {
    let store = Arc::clone(store);
    let key = key.to_string();
    blocking(move || store.get(&key)).await
}

pub(crate) async fn kv_set(store: &Arc<dyn KeyValueStore>, key: &str, value: String) -> GateResult<()> {
    let store = Arc::clone(store);
    let key = key.to_string();
    blocking(move || store.set(&key, &value)).await
}
