//! Timer thread for sites that answer after a delay
//!
//! Pending answers sit in a min-heap ordered by deadline and are delivered
//! by one thread. A wait holds a heap entry rather than a worker, so any
//! number of waits run side by side. Entries whose calling token has been
//! cancelled are halted the next time the thread looks at the heap, which
//! is at most [`SWEEP_INTERVAL`] later, not at their deadline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::site::{ReturnHandle, SiteOutcome};

/// Longest the thread sleeps before rechecking for cancelled entries
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

struct TimerEntry {
    deadline: Instant,
    /// Insertion order, so equal deadlines fire first-come first-served
    seq: u64,
    ret: ReturnHandle,
    outcome: SiteOutcome,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and the earliest deadline must
        // be on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Delivers site answers at their deadlines from a dedicated thread
pub struct Timer {
    shared: Arc<TimerShared>,
    running: bool,
}

impl Timer {
    pub fn start() -> Self {
        let shared = Arc::new(TimerShared::default());
        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("braid-timer".into())
            .spawn(move || timer_loop(&worker));
        let running = match spawned {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn timer thread");
                false
            }
        };
        Self { shared, running }
    }

    /// Answer `ret` with `outcome` once `delay` has passed. If the thread
    /// could not be started the answer is given at once, so the caller is
    /// never stranded.
    pub fn schedule(&self, delay: Duration, ret: ReturnHandle, outcome: SiteOutcome) {
        if !self.running {
            ret.answer(outcome);
            return;
        }
        let Ok(mut state) = self.shared.state.lock() else {
            ret.answer(outcome);
            return;
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            ret,
            outcome,
        });
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Entries not yet delivered
    pub fn pending(&self) -> usize {
        self.shared.state.lock().map(|s| s.heap.len()).unwrap_or(0)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Not joined: the last reference can be dropped on the timer thread
        // itself, by a handle it has just answered.
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("running", &self.running)
            .field("pending", &self.pending())
            .finish()
    }
}

fn timer_loop(shared: &TimerShared) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    loop {
        if state.shutdown {
            // Remaining handles halt their callers as they drop.
            return;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        while state.heap.peek().map_or(false, |e| e.deadline <= now) {
            if let Some(entry) = state.heap.pop() {
                due.push(entry);
            }
        }
        let mut cancelled = Vec::new();
        if state.heap.iter().any(|e| e.ret.is_cancelled()) {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.heap)
                .into_vec()
                .into_iter()
                .partition(|e| e.ret.is_cancelled());
            state.heap = BinaryHeap::from(kept);
            cancelled = gone;
        }

        if !due.is_empty() || !cancelled.is_empty() {
            drop(state);
            for entry in cancelled {
                entry.ret.halt();
            }
            for entry in due {
                if entry.ret.is_cancelled() {
                    entry.ret.halt();
                } else {
                    entry.ret.answer(entry.outcome);
                }
            }
            state = match shared.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            continue;
        }

        let wait = state
            .heap
            .peek()
            .map(|e| e.deadline.saturating_duration_since(now).min(SWEEP_INTERVAL));
        state = match wait {
            Some(timeout) => match shared.wake.wait_timeout(state, timeout) {
                Ok((state, _)) => state,
                Err(_) => return,
            },
            None => match shared.wake.wait(state) {
                Ok(state) => state,
                Err(_) => return,
            },
        };
    }
}

/// A timer shared by an engine and every handle it gives out, started on
/// first use
#[derive(Clone, Default)]
pub struct SharedTimer {
    timer: Arc<OnceLock<Timer>>,
}

impl SharedTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> &Timer {
        self.timer.get_or_init(Timer::start)
    }

    pub fn is_started(&self) -> bool {
        self.timer.get().is_some()
    }
}

impl std::fmt::Debug for SharedTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTimer")
            .field("started", &self.is_started())
            .finish()
    }
}
