//! Background Tasks Module
//!
//! Contains background tasks that run periodically alongside a cache.
//!
//! # Tasks
//! - Expiry sweep: Removes expired entries at configured intervals

mod sweep;

pub use sweep::spawn_sweep_task;
