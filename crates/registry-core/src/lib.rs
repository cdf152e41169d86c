//! Core abstractions for a coordination-service registry client.
//!
//! This crate provides the fundamental building blocks:
//! - `RegistryConfig` - Session configuration with the usual defaults
//! - `ExponentialBackoff` - Bounded retry policy
//! - `Namespace` / `CacheKey` - Path handling
//! - `CoordinationDriver` / `DriverSession` - The remote store seam
//! - `CoordinationError` - The single error kind callers see

pub mod auth;
pub mod config;
pub mod error;
pub mod node;
pub mod path;
pub mod retry;
pub mod traits;

pub use auth::{AuthInfo, DigestCredential};
pub use config::RegistryConfig;
pub use error::{CoordinationError, StoreError};
pub use node::{
    Acl, ChildData, CreateMode, SessionId, SessionState, Stat, WatchEvent, WatchEventKind,
};
pub use path::{CacheKey, Namespace};
pub use retry::ExponentialBackoff;
pub use traits::{
    AclProvider, CoordinationDriver, CreateOptions, CreatorAclProvider, DriverSession,
    OpenAclProvider, SessionOptions, WatchStream,
};
