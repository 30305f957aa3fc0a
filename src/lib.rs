//! Expiry Cache - bounded, expiring byte caches
//!
//! Provides interchangeable memory and disk stores with TTL expiration,
//! group partitioning and size-bounded eviction.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{Cache, DurableStore, MemoryStore, Ticket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DurableStoreConfig, MemoryStoreConfig};
pub use error::{CacheError, Result};
pub use tasks::spawn_sweep_task;
