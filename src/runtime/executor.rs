// Runner executor
//
// A bounded queue of pending runnables plus the timer scheduler. With
// concurrency 1 a single worker selects over both; with more, one task
// drains timers into the runnable queue and N workers drain the queue.
// Panics inside a runner are recovered and counted without killing the
// worker.

use super::clock::Clock;
use super::runner::Runner;
use super::scheduler::{ExpiredTimer, Scheduler};
use super::stats::Stats;
use crate::error::{NetError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub const STAT_COMMIT: usize = 0;
pub const STAT_TIMER: usize = 1;
pub const STAT_EXEC: usize = 2;
pub const STAT_ERROR: usize = 3;
pub const STAT_DROPPED: usize = 4;
pub const NUM_EXECUTOR_STATS: usize = 5;

pub struct Executor {
    scheduler: Scheduler,
    bus_tx: mpsc::Sender<Arc<dyn Runner>>,
    bus_rx: Arc<AsyncMutex<mpsc::Receiver<Arc<dyn Runner>>>>,
    capacity: usize,
    concurrency: usize,
    closing: AtomicBool,
    stats: Arc<Stats>,
    done_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(queue_size: usize, concurrency: usize, clock: Clock) -> Self {
        let capacity = queue_size.max(1);
        let (bus_tx, bus_rx) = mpsc::channel(capacity);
        let (done_tx, _) = watch::channel(false);
        Self {
            scheduler: Scheduler::new(clock),
            bus_tx,
            bus_rx: Arc::new(AsyncMutex::new(bus_rx)),
            capacity,
            concurrency: concurrency.max(1),
            closing: AtomicBool::new(false),
            stats: Arc::new(Stats::new(NUM_EXECUTOR_STATS)),
            done_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Fraction of the runnable queue currently occupied.
    pub fn busyness(&self) -> f32 {
        let pending = self.capacity - self.bus_tx.capacity();
        pending as f32 / self.capacity as f32
    }

    pub fn start(&self) {
        self.scheduler.start();
        let timers = self
            .scheduler
            .take_expired()
            .expect("executor started twice");
        let mut handles = self.handles.lock();
        if self.concurrency <= 1 {
            handles.push(self.spawn_all_in_one(timers));
            return;
        }
        // All timers run on the same worker; runnables fan out over the rest.
        handles.push(self.spawn_timer_worker(timers));
        for idx in 1..=self.concurrency {
            handles.push(self.spawn_runner_worker(idx));
        }
    }

    fn spawn_all_in_one(&self, mut timers: mpsc::Receiver<ExpiredTimer>) -> JoinHandle<()> {
        let rx = Arc::clone(&self.bus_rx);
        let stats = Arc::clone(&self.stats);
        let mut done = self.done_tx.subscribe();
        let capacity = self.capacity;
        tokio::spawn(async move {
            tracing::debug!("executor start serving, capacity {}", capacity);
            let mut bus = rx.lock().await;
            loop {
                tokio::select! {
                    r = bus.recv() => match r {
                        Some(runner) => Self::run_one(&stats, runner),
                        None => break,
                    },
                    t = timers.recv() => match t {
                        Some(timer) => {
                            stats.add(STAT_TIMER, 1);
                            Self::run_one(&stats, timer.runner);
                        }
                        None => break,
                    },
                    _ = done.changed() => break,
                }
            }
            stats.add(STAT_DROPPED, bus.len() as i64);
            tracing::debug!("executor stop serving, {} runners left", bus.len());
        })
    }

    fn spawn_timer_worker(&self, mut timers: mpsc::Receiver<ExpiredTimer>) -> JoinHandle<()> {
        let bus_tx = self.bus_tx.clone();
        let stats = Arc::clone(&self.stats);
        let mut done = self.done_tx.subscribe();
        tokio::spawn(async move {
            tracing::debug!("executor start serving timers");
            loop {
                tokio::select! {
                    t = timers.recv() => match t {
                        Some(timer) => {
                            stats.add(STAT_TIMER, 1);
                            if bus_tx.send(timer.runner).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = done.changed() => break,
                }
            }
            tracing::debug!("executor stop serving timers");
        })
    }

    fn spawn_runner_worker(&self, idx: usize) -> JoinHandle<()> {
        let rx = Arc::clone(&self.bus_rx);
        let stats = Arc::clone(&self.stats);
        let mut done = self.done_tx.subscribe();
        tokio::spawn(async move {
            tracing::debug!("executor #{} start serving", idx);
            loop {
                let runner = {
                    let mut bus = rx.lock().await;
                    tokio::select! {
                        r = bus.recv() => r,
                        _ = done.changed() => None,
                    }
                };
                match runner {
                    Some(runner) => Self::run_one(&stats, runner),
                    None => break,
                }
            }
            tracing::debug!("executor #{} stop serving", idx);
        })
    }

    fn run_one(stats: &Stats, runner: Arc<dyn Runner>) {
        match catch_unwind(AssertUnwindSafe(|| runner.run())) {
            Ok(Ok(())) => {
                stats.add(STAT_EXEC, 1);
            }
            Ok(Err(err)) => {
                stats.add(STAT_ERROR, 1);
                tracing::error!("execute runner: {}", err);
            }
            Err(panic) => {
                stats.add(STAT_ERROR, 1);
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("runner panicked: {}", msg);
            }
        }
    }

    fn warn_pending(&self) {
        let pending = self.capacity - self.bus_tx.capacity();
        if pending * 2 >= self.capacity {
            tracing::warn!(
                "more than half of the runner queue is pending ({}/{})",
                pending,
                self.capacity
            );
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Submit a runner. Blocks when the queue is full; fails after shutdown.
    pub async fn execute(&self, runner: Arc<dyn Runner>) -> Result<()> {
        if self.is_closing() {
            return Err(NetError::ExecutorClosed);
        }
        self.stats.add(STAT_COMMIT, 1);
        self.warn_pending();
        self.bus_tx
            .send(runner)
            .await
            .map_err(|_| NetError::ExecutorClosed)
    }

    /// Submit from a context that must not block: enqueue immediately when
    /// there is room, otherwise hand the send to a detached task.
    pub fn spawn_execute(&self, runner: Arc<dyn Runner>) {
        if self.is_closing() {
            return;
        }
        self.stats.add(STAT_COMMIT, 1);
        self.warn_pending();
        match self.bus_tx.try_send(runner) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(runner)) => {
                let tx = self.bus_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(runner).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("spawn_execute after executor shutdown");
            }
        }
    }

    pub fn run_after(&self, delay_ms: i32, runner: Arc<dyn Runner>) -> Option<u32> {
        self.scheduler.run_after(delay_ms, runner)
    }

    pub fn run_every(&self, interval_ms: i32, runner: Arc<dyn Runner>) -> Option<u32> {
        self.scheduler.run_every(interval_ms, runner)
    }

    pub fn cancel(&self, timer_id: u32) -> bool {
        self.scheduler.cancel(timer_id)
    }

    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("start shutdown executor");
        self.scheduler.shutdown().await;
        let _ = self.done_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
