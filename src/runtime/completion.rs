//! Completion handles for asynchronous device work

use crate::error::DeviceError;
use crate::runtime::DeviceResult;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observable state of a handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Work is still in flight
    Pending,
    /// All work finished successfully
    Ready,
    /// Work finished with an error
    Failed(DeviceError),
}

impl Status {
    /// True once the work has finished, successfully or not
    #[inline]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn into_result(self) -> DeviceResult<()> {
        match self {
            Self::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }
}

type Callback = Box<dyn FnOnce(&Status) + Send>;

struct State {
    status: Status,
    // Set after settle callbacks have run; observers only see the settled
    // status from this point on.
    published: bool,
    callbacks: Vec<Callback>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn new(status: Status) -> Arc<Self> {
        let published = status.is_settled();
        Arc::new(Self {
            state: Mutex::new(State {
                status,
                published,
                callbacks: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    fn settle(&self, status: Status) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.status.is_settled() {
                return;
            }
            state.status = status.clone();
            std::mem::take(&mut state.callbacks)
        };

        for callback in callbacks {
            callback(&status);
        }

        let mut state = self.state.lock();
        state.published = true;
        self.cond.notify_all();
    }
}

/// Token for in-flight work
///
/// Clones observe the same work. Dropping a handle never cancels or leaks
/// anything: resources tied to the work are released by whoever settles it.
#[derive(Clone)]
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

impl CompletionHandle {
    /// A handle for work that has already finished
    pub fn ready() -> Self {
        Self {
            shared: Shared::new(Status::Ready),
        }
    }

    /// A handle for work that has already failed
    pub fn failed(error: DeviceError) -> Self {
        Self {
            shared: Shared::new(Status::Failed(error)),
        }
    }

    /// A pending handle and the completer that settles it
    pub fn pending() -> (Self, Completer) {
        let shared = Shared::new(Status::Pending);
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// Current status, without blocking
    pub fn status(&self) -> Status {
        let state = self.shared.state.lock();
        if state.published {
            state.status.clone()
        } else {
            Status::Pending
        }
    }

    /// True once the work finished successfully
    pub fn is_ready(&self) -> bool {
        self.status() == Status::Ready
    }

    /// Block until the work settles
    pub fn wait(&self) -> DeviceResult<()> {
        let mut state = self.shared.state.lock();
        while !state.published {
            self.shared.cond.wait(&mut state);
        }
        state.status.clone().into_result()
    }

    /// Block until the work settles or `timeout` elapses
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DeviceResult<()>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.published {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() && !state.published {
                return None;
            }
        }
        Some(state.status.clone().into_result())
    }

    /// Run `callback` once the work settles
    ///
    /// Runs immediately on the calling thread if the work already settled,
    /// otherwise on the thread that settles it.
    pub fn on_settled(&self, callback: impl FnOnce(&Status) + Send + 'static) {
        let settled = {
            let mut state = self.shared.state.lock();
            if state.status.is_settled() {
                state.status.clone()
            } else {
                state.callbacks.push(Box::new(callback));
                return;
            }
        };
        callback(&settled);
    }

    /// A handle that settles when every handle in `handles` has settled
    ///
    /// Fails with the first failure observed; ready for an empty list.
    pub fn join(handles: Vec<CompletionHandle>) -> Self {
        match handles.len() {
            0 => return Self::ready(),
            1 => return handles.into_iter().next().unwrap_or_else(Self::ready),
            _ => {}
        }

        struct Join {
            remaining: usize,
            failure: Option<DeviceError>,
            completer: Option<Completer>,
        }

        let (joined, completer) = Self::pending();
        let join = Arc::new(Mutex::new(Join {
            remaining: handles.len(),
            failure: None,
            completer: Some(completer),
        }));

        for handle in handles {
            let join = Arc::clone(&join);
            handle.on_settled(move |status| {
                let finished = {
                    let mut join = join.lock();
                    if let Status::Failed(err) = status {
                        join.failure.get_or_insert_with(|| err.clone());
                    }
                    join.remaining -= 1;
                    if join.remaining == 0 {
                        join.completer.take().map(|c| (c, join.failure.take()))
                    } else {
                        None
                    }
                };
                match finished {
                    Some((completer, Some(err))) => completer.fail(err),
                    Some((completer, None)) => completer.complete(),
                    None => {}
                }
            });
        }

        joined
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionHandle").field(&self.status()).finish()
    }
}

/// Settles a pending [`CompletionHandle`] exactly once
///
/// Dropping a completer without settling fails the handle with
/// [`DeviceError::Abandoned`].
pub struct Completer {
    shared: Option<Arc<Shared>>,
}

impl Completer {
    /// Mark the work as finished
    pub fn complete(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Status::Ready);
        }
    }

    /// Mark the work as failed
    pub fn fail(mut self, error: DeviceError) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Status::Failed(error));
        }
    }

    /// Settle from a result
    pub fn finish(self, result: DeviceResult<()>) {
        match result {
            Ok(()) => self.complete(),
            Err(err) => self.fail(err),
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Status::Failed(DeviceError::Abandoned));
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("settled", &self.shared.is_none())
            .finish()
    }
}
