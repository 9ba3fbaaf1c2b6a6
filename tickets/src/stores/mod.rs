//! Storage implementations for the ticket registry.
//!
//! - **Memory** (`dashmap`) - reference adapter, per-key atomic operations,
//!   linearizable within one process
//! - **Redis** - shared adapter for clusters, atomic per key on the Redis
//!   primary (`SET NX`, `GETDEL`)

pub mod memory;
pub mod redis;

// Re-exports
pub use memory::MemoryTicketStorage;
pub use redis::RedisTicketStorage;
