//! Core traits for the coordination-service driver.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    Acl, CreateMode, ExponentialBackoff, SessionState, StoreError, WatchEvent,
    auth::AuthInfo,
    node::{SessionId, Stat},
};

/// Stream of change notifications for a subtree.
///
/// Ends when the session closes.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Options for starting a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Server addresses (`host:port`).
    pub servers: Vec<String>,
    /// Backoff applied between connection attempts.
    pub retry: ExponentialBackoff,
    /// Session timeout override.
    pub session_timeout: Option<Duration>,
    /// Connection timeout override.
    pub connection_timeout: Option<Duration>,
    /// Credentials added once the session connects.
    pub auth: Option<AuthInfo>,
}

/// Options for creating a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub mode: CreateMode,
    pub acl: Vec<Acl>,
    /// Create missing ancestors as persistent nodes with the same ACL.
    pub create_parents: bool,
}

impl CreateOptions {
    #[must_use]
    pub const fn new(mode: CreateMode, acl: Vec<Acl>) -> Self {
        Self {
            mode,
            acl,
            create_parents: false,
        }
    }

    #[must_use]
    pub const fn creating_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }
}

/// Trait for coordination-service drivers.
#[async_trait]
pub trait CoordinationDriver: Send + Sync {
    /// Start a session. Returns immediately; connection happens in the
    /// background.
    async fn connect(&self, options: SessionOptions) -> Result<Arc<dyn DriverSession>, StoreError>;
}

/// A live session to the remote store.
///
/// All paths are absolute store paths.
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Session identifier.
    fn id(&self) -> SessionId;

    /// Current connection state.
    fn state(&self) -> SessionState;

    /// Wait until connected. Returns `false` if `timeout` elapses first.
    async fn block_until_connected(&self, timeout: Duration) -> Result<bool, StoreError>;

    /// Create a node. Returns the created path, including any sequential suffix.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        options: &CreateOptions,
    ) -> Result<String, StoreError>;

    /// Get node payload and metadata.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreError>;

    /// Overwrite node payload.
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<Stat, StoreError>;

    /// Delete a node, and its descendants when `recursive` is set.
    async fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError>;

    /// Node metadata, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError>;

    /// Direct child names, in no particular order.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Watch `path` and all its descendants until the stream is dropped.
    async fn watch(&self, path: &str) -> Result<WatchStream, StoreError>;

    /// Close the session.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Chooses ACLs for created nodes.
pub trait AclProvider: Send + Sync {
    fn default_acl(&self) -> Vec<Acl>;

    fn acl_for_path(&self, path: &str) -> Vec<Acl>;
}

/// Nodes are open to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAclProvider;

impl AclProvider for OpenAclProvider {
    fn default_acl(&self) -> Vec<Acl> {
        vec![Acl::AnyoneAll]
    }

    fn acl_for_path(&self, _path: &str) -> Vec<Acl> {
        self.default_acl()
    }
}

/// Nodes are restricted to the identity that created them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatorAclProvider;

impl AclProvider for CreatorAclProvider {
    fn default_acl(&self) -> Vec<Acl> {
        vec![Acl::CreatorAll]
    }

    fn acl_for_path(&self, _path: &str) -> Vec<Acl> {
        vec![Acl::CreatorAll]
    }
}
