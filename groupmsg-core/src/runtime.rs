//! Thin wrappers over the tokio runtime

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
pub use tokio::task::{JoinError, JoinHandle};
pub use tokio::time::Instant;

#[derive(Debug, Error)]
#[error("deadline has elapsed")]
pub struct Elapsed;

pub fn spawn<F, T>(name: &str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static + Send,
    T: Send + 'static,
{
    tracing::trace!(target: groupmsg_logging::LOG_TASK, task = %name, "Spawning task");
    tokio::spawn(future)
}

/// Run blocking work (like backend I/O) without stalling the executor
pub fn block_in_place<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    tokio::task::block_in_place(f)
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

pub async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await
}

pub async fn timeout<T>(duration: Duration, future: T) -> Result<T::Output, Elapsed>
where
    T: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Elapsed)
}
