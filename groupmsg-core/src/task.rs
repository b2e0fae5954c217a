//! Cooperative task groups
//!
//! Long running workers (like the queue drain loop) are spawned into a
//! [`TaskGroup`]. Shutting the group down signals every task through its
//! [`TaskHandle`]; [`TaskGroup::join_all`] then waits for them and reports
//! panics.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use groupmsg_logging::LOG_TASK;
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, Span, debug, error, info_span, warn};

use crate::runtime::{self, JoinError, JoinHandle};

#[derive(Debug)]
struct TaskGroupInner {
    on_shutdown_tx: watch::Sender<bool>,
    // keeps the channel open so a shutdown is never lost
    on_shutdown_rx: watch::Receiver<bool>,
    join: Mutex<VecDeque<(String, JoinHandle<()>)>>,
}

impl Default for TaskGroupInner {
    fn default() -> Self {
        let (on_shutdown_tx, on_shutdown_rx) = watch::channel(false);
        Self {
            on_shutdown_tx,
            on_shutdown_rx,
            join: Mutex::new(VecDeque::new()),
        }
    }
}

impl TaskGroupInner {
    fn shutdown(&self) {
        self.on_shutdown_tx.send_replace(true);
    }
}

/// A group of tasks that shut down together
#[derive(Clone, Default, Debug)]
pub struct TaskGroup {
    inner: Arc<TaskGroupInner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_handle(&self) -> TaskHandle {
        TaskHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.on_shutdown_tx.borrow()
    }

    pub async fn shutdown_join_all(
        self,
        join_timeout: impl Into<Option<Duration>>,
    ) -> anyhow::Result<()> {
        self.shutdown();
        self.join_all(join_timeout.into()).await
    }

    /// Spawn a task, returning a receiver for its result
    ///
    /// If the task panics the whole group is shut down.
    pub fn spawn<Fut, R>(
        &self,
        name: impl Into<String>,
        f: impl FnOnce(TaskHandle) -> Fut + Send + 'static,
    ) -> oneshot::Receiver<R>
    where
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let name = name.into();
        let span = info_span!(parent: Span::current(), "task", name);
        let handle = self.make_handle();
        let guard = TaskPanicGuard {
            inner: self.inner.clone(),
            completed: false,
        };

        let (tx, rx) = oneshot::channel();
        let join_handle = runtime::spawn(&name, {
            let name = name.clone();
            async move {
                let mut guard = guard;
                debug!(target: LOG_TASK, "Starting task {name}");
                let r = f(handle).await;
                guard.completed = true;
                debug!(target: LOG_TASK, "Finished task {name}");
                // receiver may have lost interest
                let _ = tx.send(r);
            }
            .instrument(span)
        });
        self.inner
            .join
            .lock()
            .expect("lock poison")
            .push_back((name, join_handle));

        rx
    }

    /// Wait for all spawned tasks, giving up on stragglers after `timeout`
    pub async fn join_all(self, timeout: Option<Duration>) -> anyhow::Result<()> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        let mut errors: Vec<JoinError> = vec![];

        while let Some((name, join)) = {
            let mut lock = self.inner.join.lock().expect("lock poison");
            lock.pop_front()
        } {
            debug!(target: LOG_TASK, task = %name, "Waiting for task to finish");

            let join_future: Pin<Box<dyn Future<Output = _> + Send>> = match deadline {
                Some(deadline) => Box::pin(runtime::timeout(
                    deadline.saturating_duration_since(tokio::time::Instant::now()),
                    join,
                )),
                None => Box::pin(async move { Ok(join.await) }),
            };

            match join_future.await {
                Ok(Ok(())) => {
                    debug!(target: LOG_TASK, task = %name, "Task finished");
                }
                Ok(Err(e)) => {
                    error!(target: LOG_TASK, task = %name, error = %e, "Task panicked");
                    errors.push(e);
                }
                Err(_) => {
                    warn!(target: LOG_TASK, task = %name, "Timeout waiting for task to shut down");
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let num_errors = errors.len();
            bail!("{num_errors} tasks did not finish cleanly: {errors:?}")
        }
    }
}

/// Shuts the group down if a task future is dropped before completing
struct TaskPanicGuard {
    inner: Arc<TaskGroupInner>,
    completed: bool,
}

impl Drop for TaskPanicGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                target: LOG_TASK,
                "Task shut down uncleanly. Shutting down task group."
            );
            self.inner.shutdown();
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskHandle {
    inner: Arc<TaskGroupInner>,
}

impl TaskHandle {
    /// Every task in a task group should stop once this is `true`
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.on_shutdown_tx.borrow()
    }

    /// A future that resolves once the group shuts down
    pub fn make_shutdown_rx(&self) -> TaskShutdownToken {
        TaskShutdownToken::new(self.inner.on_shutdown_rx.clone())
    }
}

pub struct TaskShutdownToken(Pin<Box<dyn Future<Output = ()> + Send>>);

impl TaskShutdownToken {
    fn new(mut rx: watch::Receiver<bool>) -> Self {
        Self(Box::pin(async move {
            let _ = rx.wait_for(|v| *v).await;
        }))
    }
}

impl Future for TaskShutdownToken {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}
