//! Caller-facing registry operations.

use std::sync::Arc;

use async_trait::async_trait;
use registry_core::CoordinationError;

use crate::TreeCache;

/// Hierarchical key/value registry backed by a coordination service.
///
/// Every operation may fail with [`CoordinationError::OperationFailed`];
/// nothing is retried on the caller's behalf.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Payload of `key` as text.
    async fn get(&self, key: &str) -> Result<String, CoordinationError>;

    /// Whether `key` exists.
    async fn is_existed(&self, key: &str) -> Result<bool, CoordinationError>;

    /// Create `key` as a persistent node (with parents), or update it if it
    /// already exists.
    async fn persist(&self, key: &str, value: &str) -> Result<(), CoordinationError>;

    /// Overwrite `key` if it exists. A missing key is left missing.
    async fn update(&self, key: &str, value: &str) -> Result<(), CoordinationError>;

    /// Delete `key` and its descendants.
    async fn remove(&self, key: &str) -> Result<(), CoordinationError>;

    /// Replace whatever is at `key` with an ephemeral node.
    async fn ephemeral(&self, key: &str, value: &str) -> Result<(), CoordinationError>;

    /// Create a persistent sequential node and return its full path.
    async fn persist_sequential(&self, key: &str, value: &str) -> Result<String, CoordinationError>;

    /// Create an ephemeral sequential node with an empty payload.
    async fn ephemeral_sequential(&self, key: &str) -> Result<(), CoordinationError>;

    /// Child names of `key`, in descending order.
    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>, CoordinationError>;

    /// Start a watch cache for `cache_path` and register it.
    async fn add_cache_data(&self, cache_path: &str) -> Result<Arc<TreeCache>, CoordinationError>;

    /// Cache registered for `cache_path`.
    fn get_cache(&self, cache_path: &str) -> Option<Arc<TreeCache>>;
}
