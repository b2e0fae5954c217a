//! Shared building blocks for the group message queue: a transactional
//! key-value database abstraction with an in-memory backend, a compact
//! binary encoding for keys and values, task groups and retry backoff.

pub mod db;
pub mod encoding;
pub mod envs;
pub mod runtime;
pub mod task;
pub mod time;
pub mod util;
