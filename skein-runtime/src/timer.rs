//! Timer Thread
//!
//! A single background thread owning a min-heap of deadlines. `sleep` and
//! timeouts register a callback here; the thread fires it once the deadline
//! passes. Cancelling removes the callback and leaves the heap entry to be
//! skipped when it surfaces.
//!
//! Callbacks run on the timer thread outside the state lock. They are
//! expected to be short: resuming a fiber only pushes it onto a run queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey(u64);

struct Entry {
    deadline: Instant,
    key: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the earliest deadline sits at the top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Entry>,
    callbacks: HashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Cloneable handle for scheduling and cancelling callbacks.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Run `callback` on the timer thread once `deadline` has passed.
    pub(crate) fn schedule(&self, deadline: Instant, callback: Callback) -> TimerKey {
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if state.shutdown {
            // Dropping the callback leaves the waiter to be abandoned at shutdown.
            return TimerKey(key);
        }
        let earliest = state
            .heap
            .peek()
            .map_or(true, |top| deadline < top.deadline);
        state.heap.push(Entry { deadline, key });
        state.callbacks.insert(key, callback);
        drop(state);
        if earliest {
            self.shared.wakeup.notify_one();
        }
        TimerKey(key)
    }

    /// Cancel a pending callback. Returns false if it already fired.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        self.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Number of callbacks still waiting to fire.
    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }
}

/// Owner of the timer thread.
pub(crate) struct Timer {
    handle: TimerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start the timer thread.
    pub(crate) fn start() -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let dispatch = tracing::dispatcher::get_default(Clone::clone);
        let thread = thread::Builder::new()
            .name("skein-timer".into())
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || run(&worker)))?;
        Ok(Self {
            handle: TimerHandle { shared },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn handle(&self) -> &TimerHandle {
        &self.handle
    }

    /// Stop the thread. Callbacks that have not fired are dropped.
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut state = self.handle.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            std::mem::take(&mut state.callbacks)
        };
        self.handle.shared.wakeup.notify_all();
        drop(dropped);
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

fn run(shared: &TimerShared) {
    debug!("timer thread started");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(top) = state.heap.peek() {
            if top.deadline > now {
                break;
            }
            let key = top.key;
            state.heap.pop();
            if let Some(callback) = state.callbacks.remove(&key) {
                due.push(callback);
            }
        }
        if !due.is_empty() {
            drop(state);
            for callback in due {
                callback();
            }
            state = shared.state.lock();
            continue;
        }
        match state.heap.peek().map(|top| top.deadline) {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
    debug!("timer thread stopped");
}
