//! Cooperative task groups with a shared shutdown signal

use std::collections::VecDeque;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use futures::future::{self, Either};
use otx_logging::LOG_TASK;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info_span, warn};

#[derive(Debug)]
struct TaskGroupInner {
    on_shutdown_tx: watch::Sender<bool>,
    // At least one `Receiver` has to stay around, otherwise shutdown writes
    // are lost.
    on_shutdown_rx: watch::Receiver<bool>,
    // Blocking mutex: `spawn` stays sync and the lock is never held across
    // an await point.
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

/// A group of tasks that shut down together
///
/// Tasks are expected to check [`TaskHandle::is_shutting_down`] between
/// steps, or wrap blocking operations in [`TaskHandle::cancel_on_shutdown`].
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
        // `send_replace` can't fail, we keep a receiver in `inner`
        self.inner.on_shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.on_shutdown_tx.borrow()
    }

    pub fn spawn<Fut>(&self, name: impl Into<String>, f: impl FnOnce(TaskHandle) -> Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let span = info_span!(parent: Span::current(), "task", name);
        let fut = f(self.make_handle());
        let join = tokio::spawn(
            {
                let name = name.clone();
                async move {
                    debug!(target: LOG_TASK, "Starting task {name}");
                    fut.await;
                    debug!(target: LOG_TASK, "Finished task {name}");
                }
            }
            .instrument(span),
        );

        let mut tasks = self.inner.join.lock().expect("lock poison");
        // Drop handles of tasks that are long gone
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.push_back((name, join));
    }

    pub async fn shutdown_join_all(self, join_timeout: Option<Duration>) -> anyhow::Result<()> {
        self.shutdown();
        self.join_all(join_timeout).await
    }

    /// Wait for all spawned tasks, reporting ones that panicked
    pub async fn join_all(self, timeout: Option<Duration>) -> anyhow::Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut errors: Vec<JoinError> = vec![];

        // drop lock before awaiting
        while let Some((name, join)) = {
            let mut lock = self.inner.join.lock().expect("lock poison");
            lock.pop_front()
        } {
            debug!(target: LOG_TASK, task = %name, "Waiting for task to finish");
            let result = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, join).await,
                None => Ok(join.await),
            };
            match result {
                Ok(Ok(())) => debug!(target: LOG_TASK, task = %name, "Task finished"),
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

#[derive(Clone, Debug)]
pub struct TaskHandle {
    inner: Arc<TaskGroupInner>,
}

#[derive(Error, Debug, Clone)]
#[error("Task group is shutting down")]
#[non_exhaustive]
pub struct ShuttingDownError {}

impl TaskHandle {
    /// Is task group shutting down?
    ///
    /// Every task in a task group should detect and stop if `true`.
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.on_shutdown_tx.borrow()
    }

    /// Run the future or cancel it if the [`TaskGroup`] shuts down.
    pub async fn cancel_on_shutdown<F: Future>(
        &self,
        fut: F,
    ) -> Result<F::Output, ShuttingDownError> {
        let mut rx = self.inner.on_shutdown_rx.clone();
        let shutdown: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            let _ = rx.wait_for(|v| *v).await;
        });
        match future::select(shutdown, pin!(fut)).await {
            Either::Left(((), _)) => Err(ShuttingDownError {}),
            Either::Right((value, _)) => Ok(value),
        }
    }
}
