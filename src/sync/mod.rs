//! Sync matching, the sync engine, and the distributed sync engine.

pub mod distributed;
pub mod engine;
pub mod matcher;

pub use distributed::DistributedSyncEngine;
pub use engine::SyncEngine;
pub use matcher::QueryResolver;
