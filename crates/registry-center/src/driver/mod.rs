//! Driver implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "zookeeper")]
pub mod zookeeper;

#[cfg(feature = "memory")]
pub use memory::{MemoryDriver, MemoryEnsemble};

#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperDriver;
