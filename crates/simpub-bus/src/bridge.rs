//! Task bridge: a single-threaded event loop on a dedicated thread.
//!
//! All sockets live on the loop. Code on any other thread (the simulation
//! producer, a UI, a test) reaches them only through [`TaskBridge::submit`],
//! which schedules a future on the loop and hands back a [`TaskHandle`]
//! the caller can block on.
//!
//! Blocking on a handle from the loop thread itself can never complete, so
//! [`TaskHandle::result`] refuses with [`BusError::WouldDeadlock`] there.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{BusError, BusResult};

/// How long shutdown waits for blocking handler work to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Cloneable handle to the event loop.
#[derive(Clone)]
pub struct TaskBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    handle: Handle,
    loop_thread: ThreadId,
    closed: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Single-assignment result of submitted work.
#[must_use = "dropping a TaskHandle detaches the task; its result is lost"]
pub struct TaskHandle<T> {
    rx: Receiver<BusResult<T>>,
    loop_thread: ThreadId,
}

impl TaskBridge {
    /// Start the event loop on a new thread named `name`.
    pub fn spawn(name: &str) -> BusResult<Self> {
        let (init_tx, init_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                let _ = init_tx.send(Ok((runtime.handle().clone(), thread::current().id())));

                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                tracing::debug!("event loop stopped");
            })?;

        let (handle, loop_thread) = init_rx.recv().map_err(|_| BusError::Closed)??;
        tracing::debug!(thread = name, "event loop started");

        Ok(Self {
            inner: Arc::new(BridgeInner {
                handle,
                loop_thread,
                closed: AtomicBool::new(false),
                stop_tx: Mutex::new(Some(stop_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Schedule `work` on the loop and return immediately.
    ///
    /// A panic inside `work` is reported through the handle as
    /// [`BusError::Task`]; it does not take the loop down.
    pub fn submit<F>(&self, work: F) -> BusResult<TaskHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        let task = self.inner.handle.spawn(work);
        self.inner.handle.spawn(async move {
            let outcome = task.await.map_err(|e| {
                if e.is_panic() {
                    BusError::Task("task panicked".to_string())
                } else {
                    BusError::Closed
                }
            });
            let _ = tx.send(outcome);
        });
        Ok(TaskHandle {
            rx,
            loop_thread: self.inner.loop_thread,
        })
    }

    /// Schedule `work` and forget about it. Used for long-running loops.
    pub fn spawn_detached<F>(&self, work: F) -> BusResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.inner.handle.spawn(work);
        Ok(())
    }

    /// `submit` and block for the result. Refused on the loop thread before
    /// anything is scheduled.
    pub fn call<F>(&self, work: F, timeout: Option<Duration>) -> BusResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_loop_thread() {
            return Err(BusError::WouldDeadlock);
        }
        self.submit(work)?.result(timeout)
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.loop_thread
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the loop, drop pending work and join the thread. Idempotent.
    ///
    /// Called from the loop thread itself the loop is stopped but not
    /// joined.
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

impl BridgeInner {
    fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread::current().id() == self.loop_thread {
                tracing::debug!("bridge stopped from its own loop, not joining");
                return;
            }
            if thread.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T> TaskHandle<T> {
    /// Block until the work resolves, or until `timeout` passes.
    ///
    /// A timeout does not cancel the work; it may still finish unobserved.
    pub fn result(self, timeout: Option<Duration>) -> BusResult<T> {
        if thread::current().id() == self.loop_thread {
            return Err(BusError::WouldDeadlock);
        }
        match timeout {
            None => self.rx.recv().map_err(|_| BusError::Closed)?,
            Some(limit) => match self.rx.recv_timeout(limit) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => Err(BusError::Timeout(limit)),
                Err(RecvTimeoutError::Disconnected) => Err(BusError::Closed),
            },
        }
    }
}
