// Timer scheduler
//
// A min-heap of timers guarded by one mutex, driven by a 10 ms ticker
// task. Expired timers are pushed onto a bounded output channel that the
// executor drains; the scheduler never runs timer callbacks itself.

use super::clock::Clock;
use super::runner::Runner;
use super::timer::{HeapEntry, TimerNode};
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Tick granularity. A timer may fire up to one tick late.
pub const TIMER_PRECISION_MS: u64 = 10;
/// Capacity of the expired-timer channel.
pub const TIMER_CHAN_CAPACITY: usize = 128;
/// Ceiling on concurrently registered timers; id allocation scans below it.
pub const TIMER_CAPACITY: usize = u16::MAX as usize;

/// An expired timer handed to the executor.
pub struct ExpiredTimer {
    pub id: u32,
    pub runner: Arc<dyn Runner>,
}

struct SchedState {
    heap: BinaryHeap<HeapEntry>,
    refs: HashMap<u32, TimerNode>,
    next_id: u32,
}

impl SchedState {
    /// Allocate the next free timer id, scanning past live ids and
    /// wrapping. Callers check the capacity ceiling before calling.
    fn counter(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.refs.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }
}

pub struct Scheduler {
    state: Arc<Mutex<SchedState>>,
    clock: Clock,
    expired_tx: mpsc::Sender<ExpiredTimer>,
    expired_rx: Mutex<Option<mpsc::Receiver<ExpiredTimer>>>,
    done_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(clock: Clock) -> Self {
        let (expired_tx, expired_rx) = mpsc::channel(TIMER_CHAN_CAPACITY);
        let (done_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(SchedState {
                heap: BinaryHeap::with_capacity(16),
                refs: HashMap::with_capacity(16),
                next_id: 1000, // start above the ids tests tend to hardcode
            })),
            clock,
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
            done_tx,
            handle: Mutex::new(None),
        }
    }

    /// Take the expired-timer channel. The executor calls this exactly once.
    pub fn take_expired(&self) -> Option<mpsc::Receiver<ExpiredTimer>> {
        self.expired_rx.lock().take()
    }

    pub fn start(&self) {
        let state = Arc::clone(&self.state);
        let clock = self.clock.clone();
        let tx = self.expired_tx.clone();
        let mut done = self.done_tx.subscribe();
        let handle = tokio::spawn(async move {
            tracing::debug!("scheduler start serving");
            let mut ticker = tokio::time::interval(Duration::from_millis(TIMER_PRECISION_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = Self::pop_expired(&state, clock.now_ms());
                        for timer in expired {
                            if tx.send(timer).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = done.changed() => break,
                }
            }
            tracing::debug!("scheduler stop serving");
        });
        *self.handle.lock() = Some(handle);
    }

    fn pop_expired(state: &Mutex<SchedState>, now: i64) -> Vec<ExpiredTimer> {
        let mut expired = Vec::new();
        let mut guard = state.lock();
        let state = &mut *guard;
        while let Some(entry) = state.heap.peek().copied() {
            if entry.expire_at > now {
                break;
            }
            state.heap.pop();
            let stale = match state.refs.get(&entry.id) {
                Some(node) => node.expire_at != entry.expire_at,
                None => true, // cancelled
            };
            if stale {
                continue;
            }
            let node = state.refs.get_mut(&entry.id).expect("checked above");
            expired.push(ExpiredTimer {
                id: node.id,
                runner: Arc::clone(&node.runner),
            });
            if node.repeat != 0 {
                if node.repeat > 0 {
                    node.repeat -= 1;
                }
                node.expire_at = now + i64::from(node.interval);
                let next = HeapEntry {
                    expire_at: node.expire_at,
                    id: entry.id,
                };
                state.heap.push(next);
            } else {
                state.refs.remove(&entry.id);
            }
        }
        expired
    }

    fn schedule(&self, interval: i32, repeat: i32, runner: Arc<dyn Runner>) -> u32 {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        let id = state.counter();
        let node = TimerNode {
            expire_at: now + i64::from(interval),
            interval,
            repeat,
            id,
            runner,
        };
        state.heap.push(HeapEntry {
            expire_at: node.expire_at,
            id,
        });
        state.refs.insert(id, node);
        id
    }

    /// Run `runner` once, `delay_ms` milliseconds from now.
    pub fn run_after(&self, delay_ms: i32, runner: Arc<dyn Runner>) -> Option<u32> {
        let delay = delay_ms.max(0);
        if self.state.lock().refs.len() >= TIMER_CAPACITY {
            tracing::error!("run_after: timer capacity exhausted");
            return None;
        }
        Some(self.schedule(delay, 0, runner))
    }

    /// Run `runner` every `interval_ms` milliseconds until cancelled.
    pub fn run_every(&self, interval_ms: i32, runner: Arc<dyn Runner>) -> Option<u32> {
        let interval = if interval_ms <= 0 { 100 } else { interval_ms };
        if self.state.lock().refs.len() >= TIMER_CAPACITY {
            tracing::error!("run_every: timer capacity exhausted");
            return None;
        }
        Some(self.schedule(interval, -1, runner))
    }

    pub fn cancel(&self, id: u32) -> bool {
        self.state.lock().refs.remove(&id).is_some()
    }

    pub fn pending_timers(&self) -> usize {
        self.state.lock().refs.len()
    }

    pub async fn shutdown(&self) {
        let _ = self.done_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
