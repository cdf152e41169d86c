//! Registry center for a coordination service.
//!
//! Provides:
//! - `RegistryCenter` - Session lifecycle and tree operations
//! - `TreeCache` / `CacheRegistry` - Local watch-driven subtree mirrors
//! - Driver implementations (in-memory, ZooKeeper)

pub mod cache_registry;
pub mod center;
pub mod driver;
pub mod registry;
pub mod tree_cache;

pub use cache_registry::CacheRegistry;
pub use center::RegistryCenter;
pub use registry::Registry;
pub use tree_cache::{TreeCache, TreeCacheEvent};

pub use registry_core::{CoordinationError, RegistryConfig};
