//! Worker context for radio operations.
//!
//! All radio work runs on one dedicated thread driving a current-thread
//! tokio runtime. Callers submit futures and get back a [`TaskHandle`];
//! they never block on submission, and [`TaskHandle::cancel`] blocks
//! until the task has fully stopped, so a cancelled task can never race
//! with whatever the caller does next.
//!
//! Exactly one terminal outcome is reported per submitted operation: the
//! operation's own success callbacks, or a single `on_error`. Errors and
//! panics are caught at this boundary; the worker runtime survives both.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::domain::events::EventSink;
use crate::error::{BridgeError, CoreError};

type Job = BoxFuture<'static, ()>;

/// Cooperative stop signal handed to every submitted operation. Loops
/// check it between iterations; one-shot operations may ignore it.
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        // A dropped handle counts as a stop request.
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation is requested or the handle is gone.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Handle to one submitted operation.
///
/// Dropping the handle requests a stop without waiting; keep it alive
/// for as long as the task should run.
pub struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Requests cancellation and blocks until the task has exited and
    /// released everything it held. Safe to call more than once; must
    /// not be called from the worker context itself.
    pub fn cancel(&self) {
        let _ = self.stop_tx.send(true);
        self.join();
    }

    /// Blocks until the task has finished, without requesting a stop.
    pub fn join(&self) {
        let done = self.done_rx.lock().unwrap().take();
        if let Some(done) = done {
            let _ = done.blocking_recv();
        }
    }

    /// Worker-side cancellation: same guarantee as [`cancel`], but
    /// awaits instead of blocking the runtime.
    ///
    /// [`cancel`]: Self::cancel
    pub(crate) async fn cancel_async(&self) {
        let _ = self.stop_tx.send(true);
        let done = self.done_rx.lock().unwrap().take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// The worker context itself: one thread, one runtime, many cancellable
/// tasks interleaved cooperatively on it.
pub struct AsyncBridge {
    job_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn EventSink>,
}

impl AsyncBridge {
    pub fn new(sink: Arc<dyn EventSink>) -> Result<Self, CoreError> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();

        let worker = std::thread::Builder::new()
            .name("ble-worker".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to create tokio runtime for the radio worker");

                rt.block_on(async move {
                    let mut tasks = tokio::task::JoinSet::new();
                    loop {
                        tokio::select! {
                            job = job_rx.recv() => match job {
                                Some(job) => {
                                    tasks.spawn(job);
                                }
                                None => break,
                            },
                            Some(_finished) = tasks.join_next(), if !tasks.is_empty() => {}
                        }
                    }
                    // Drain what is still running before the runtime goes away.
                    while tasks.join_next().await.is_some() {}
                });
                debug!("radio worker stopped");
            })
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;

        Ok(Self {
            job_tx: Mutex::new(Some(job_tx)),
            worker: Mutex::new(Some(worker)),
            sink,
        })
    }

    /// Schedules one logical operation on the worker context. Never
    /// blocks. The operation's `Err` becomes an `on_error` callback; a
    /// panic is caught and reported the same way.
    pub fn submit<F, Fut>(&self, make: F) -> TaskHandle
    where
        F: FnOnce(StopToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let sink = self.sink.clone();
        let finished_flag = finished.clone();
        let operation = make(StopToken { rx: stop_rx });

        let job = async move {
            match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(kind = err.kind(), %err, "operation failed");
                    sink.on_error(&err);
                }
                Err(_panic) => {
                    error!("operation panicked on the worker context");
                    sink.on_error(&CoreError::Bridge(BridgeError::TaskPanicked));
                }
            }
            finished_flag.store(true, Ordering::Release);
            let _ = done_tx.send(());
        }
        .boxed();

        let handle = TaskHandle {
            stop_tx,
            done_rx: Mutex::new(Some(done_rx)),
            finished,
        };

        let sent = match self.job_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if !sent {
            // The job (and its completion sender) was dropped, so join
            // and cancel on this handle return immediately.
            handle.finished.store(true, Ordering::Release);
            self.sink
                .on_error(&CoreError::Bridge(BridgeError::WorkerGone));
        }

        handle
    }

    /// Closes the job channel and joins the worker thread. In-flight
    /// tasks are drained first; anything submitted afterwards is
    /// reported as a bridge error.
    pub fn shutdown(&self) {
        let tx = self.job_tx.lock().unwrap().take();
        drop(tx);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("radio worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
