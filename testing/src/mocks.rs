//! In-memory stand-ins for the transport and the clock.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use relay_core::{Cancellable, Connection, Timer, TimerHandle, TransportError, WriteHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Attempts made by the `wait_for_*` helpers before giving up.
const WAIT_ROUNDS: usize = 10_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A response captured by [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenResponse {
    /// Status line
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl WrittenResponse {
    /// Body as UTF-8 text (lossy)
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Header value as a string, if present and visible ASCII
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[derive(Default)]
struct ConnectionState {
    open: bool,
    callbacks: Vec<CloseCallback>,
}

struct ConnectionInner {
    state: Mutex<ConnectionState>,
    writes: Mutex<Vec<WrittenResponse>>,
    fail_writes: AtomicBool,
}

/// Connection that records writes instead of sending them.
///
/// Clones share the same connection, so a test can keep one clone and hand
/// another to the dispatcher.
///
/// # Example
///
/// ```
/// use relay_testing::MockConnection;
/// use relay_core::Connection;
///
/// let connection = MockConnection::new();
/// assert!(connection.is_open());
///
/// connection.close();
/// assert!(!connection.is_open());
/// ```
#[derive(Clone)]
pub struct MockConnection {
    inner: Arc<ConnectionInner>,
}

impl MockConnection {
    /// An open connection
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                state: Mutex::new(ConnectionState {
                    open: true,
                    callbacks: Vec::new(),
                }),
                writes: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// A connection that is already closed
    #[must_use]
    pub fn closed() -> Self {
        let connection = Self::new();
        connection.close();
        connection
    }

    /// Make every later write report an I/O error (the write is still recorded)
    #[must_use]
    pub fn failing_writes(self) -> Self {
        self.inner.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    /// The connection as the dispatcher consumes it
    #[must_use]
    pub fn handle(&self) -> Arc<dyn Connection> {
        Arc::new(self.clone())
    }

    /// Close the connection and fire every registered close callback once
    pub fn close(&self) {
        let callbacks = {
            let mut state = lock(&self.inner.state);
            state.open = false;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Every response written so far, in write order
    #[must_use]
    pub fn writes(&self) -> Vec<WrittenResponse> {
        lock(&self.inner.writes).clone()
    }

    /// Number of responses written so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.inner.writes).len()
    }

    /// The most recent write
    #[must_use]
    pub fn last_write(&self) -> Option<WrittenResponse> {
        lock(&self.inner.writes).last().cloned()
    }

    /// Number of close callbacks still waiting for the close
    #[must_use]
    pub fn pending_close_callbacks(&self) -> usize {
        lock(&self.inner.state).callbacks.len()
    }

    /// Yield until at least `count` writes were recorded.
    ///
    /// Returns `false` if that did not happen within a bounded number of yields.
    pub async fn wait_for_writes(&self, count: usize) -> bool {
        for _ in 0..WAIT_ROUNDS {
            if self.write_count() >= count {
                return true;
            }
            tokio::task::yield_now().await;
        }
        self.write_count() >= count
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("open", &self.is_open())
            .field("writes", &self.write_count())
            .finish_non_exhaustive()
    }
}

impl Connection for MockConnection {
    fn is_open(&self) -> bool {
        lock(&self.inner.state).open
    }

    fn write(&self, response: http::Response<Bytes>) -> WriteHandle {
        let (parts, body) = response.into_parts();
        lock(&self.inner.writes).push(WrittenResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        });

        let result = if self.inner.fail_writes.load(Ordering::SeqCst) {
            Err(TransportError::Io("simulated write failure".to_string()))
        } else {
            Ok(())
        };
        Box::pin(futures::future::ready(result))
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut state = lock(&self.inner.state);
        if state.open {
            state.callbacks.push(callback);
        } else {
            drop(state);
            callback();
        }
    }
}

struct PendingTask {
    id: u64,
    due: Duration,
    task: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct TimerState {
    now: Duration,
    next_id: u64,
    pending: Vec<PendingTask>,
    scheduled: Vec<Duration>,
    cancelled: usize,
}

/// Timer driven by hand: tasks run only when the test advances time.
///
/// Cancelling a task drops it without running it.
///
/// # Example
///
/// ```
/// use relay_testing::ManualTimer;
/// use relay_core::Timer;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timer = ManualTimer::new();
/// let ran = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&ran);
/// timer.schedule(Duration::from_secs(5), Box::new(move || flag.store(true, Ordering::SeqCst)));
///
/// assert_eq!(timer.advance(Duration::from_secs(4)), 0);
/// assert_eq!(timer.advance(Duration::from_secs(1)), 1);
/// assert!(ran.load(Ordering::SeqCst));
/// ```
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<TimerState>>,
}

impl ManualTimer {
    /// A timer at time zero with nothing scheduled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward and run every task that became due, earliest first.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let due = {
            let mut state = lock(&self.state);
            state.now += by;
            let now = state.now;
            let (mut due, pending): (Vec<_>, Vec<_>) =
                state.pending.drain(..).partition(|task| task.due <= now);
            state.pending = pending;
            due.sort_by_key(|task| (task.due, task.id));
            due
        };

        let fired = due.len();
        for pending in due {
            (pending.task)();
        }
        fired
    }

    /// Run every pending task regardless of its delay
    pub fn fire_all(&self) -> usize {
        let furthest = lock(&self.state)
            .pending
            .iter()
            .map(|task| task.due)
            .max();
        match furthest {
            Some(due) => {
                let now = lock(&self.state).now;
                self.advance(due.saturating_sub(now))
            },
            None => 0,
        }
    }

    /// Tasks scheduled and neither run nor cancelled
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Number of tasks cancelled before running
    #[must_use]
    pub fn cancelled(&self) -> usize {
        lock(&self.state).cancelled
    }

    /// Delay of every task ever scheduled, in scheduling order
    #[must_use]
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        lock(&self.state).scheduled.clone()
    }

    /// Yield until at least `count` tasks are pending.
    ///
    /// Returns `false` if that did not happen within a bounded number of yields.
    pub async fn wait_for_pending(&self, count: usize) -> bool {
        for _ in 0..WAIT_ROUNDS {
            if self.pending() >= count {
                return true;
            }
            tokio::task::yield_now().await;
        }
        self.pending() >= count
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

struct ManualTask {
    id: u64,
    state: Arc<Mutex<TimerState>>,
}

impl Cancellable for ManualTask {
    fn cancel(&self) {
        let removed = {
            let mut state = lock(&self.state);
            let index = state.pending.iter().position(|task| task.id == self.id);
            let removed = index.map(|index| state.pending.remove(index));
            if removed.is_some() {
                state.cancelled += 1;
            }
            removed
        };
        drop(removed);
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        let due = state.now + delay;
        state.pending.push(PendingTask { id, due, task });
        state.scheduled.push(delay);

        TimerHandle::new(Arc::new(ManualTask {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}
