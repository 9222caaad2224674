//! Replay controller: drives the exchange with historical data in strict
//! timestamp order at a configurable speed.
//!
//! One cursor per source; each step picks the cursor with the smallest next
//! timestamp (stable tiebreak by registration order) via a priority queue,
//! advances the virtual clock to that timestamp, then invokes the registered
//! callbacks. Asynchronous modes run a dedicated emitter thread; every wait
//! it takes is bounded so `pause`/`stop` are observed within one tick.
//!
//! Callback panics are caught and logged — a bad subscriber never aborts the
//! run. A dry source is marked exhausted; the run completes when all are.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ReplayConfig;
use crate::time_manager::TimeManager;

/// Bounded wait used by the emitter and pool workers. Pause/stop latency is
/// at most one of these.
const WAIT_TICK: Duration = Duration::from_millis(100);
/// Worker count when `batch_callbacks` dispatches through the pool.
const POOL_WORKERS: usize = 4;

/// Replay pacing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayMode {
    /// As fast as consumers process; no wall-clock delays.
    Backtest,
    /// One item per explicit `step()` call.
    Stepped,
    /// Sleep the historical gap between items.
    Realtime,
    /// Sleep the historical gap divided by `speed_factor`.
    Accelerated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayStatus {
    Initialized,
    Running,
    Paused,
    Stopped,
    Completed,
}

/// OHLCV bar payload. Tick-oriented sources put the tick price in `close`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// One emitted item: timestamp, originating source, payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: i64,
    pub source_id: String,
    pub bar: Bar,
}

/// A lazily-producible, time-ordered sequence of bars.
pub trait ReplaySource: Send {
    /// Next `(timestamp_ms, bar)`, or `None` when exhausted. Timestamps must
    /// be non-decreasing within the source.
    fn next_point(&mut self) -> Option<(i64, Bar)>;

    /// Total item count when known (progress estimation).
    fn size_hint(&self) -> Option<usize> {
        None
    }

    /// Rewind to the beginning. Sources that cannot rewind return false, and
    /// `reset()` on the controller fails.
    fn rewind(&mut self) -> bool {
        false
    }
}

pub type ReplayCallback = Arc<dyn Fn(&DataPoint) + Send + Sync>;

struct SourceSlot {
    id: String,
    source: Box<dyn ReplaySource>,
    /// Peeked next item; refilled after each emission.
    pending: Option<(i64, Bar)>,
    exhausted: bool,
    last_ts: Option<i64>,
}

struct Sources {
    slots: Vec<SourceSlot>,
    /// Min-heap of (timestamp, slot index); stable for equal timestamps
    /// because the index is the registration order.
    heap: BinaryHeap<Reverse<(i64, usize)>>,
}

impl Sources {
    fn prime(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.exhausted || slot.pending.is_some() {
            return;
        }
        match slot.source.next_point() {
            Some((ts, bar)) => {
                if let Some(last) = slot.last_ts {
                    if ts < last {
                        warn!(
                            source = %slot.id,
                            ts,
                            last,
                            "source emitted non-monotonic timestamp; dropping point"
                        );
                        // Recurse at most once per bad point.
                        return self.prime(index);
                    }
                }
                slot.last_ts = Some(ts);
                slot.pending = Some((ts, bar));
                self.heap.push(Reverse((ts, index)));
            }
            None => {
                slot.exhausted = true;
                debug!(source = %slot.id, "source exhausted");
            }
        }
    }

    fn pop_next(&mut self) -> Option<DataPoint> {
        loop {
            let Reverse((ts, index)) = self.heap.pop()?;
            let slot = &mut self.slots[index];
            // Stale heap entries can exist after remove_source.
            let Some((pending_ts, bar)) = slot.pending.take() else {
                continue;
            };
            if pending_ts != ts {
                slot.pending = Some((pending_ts, bar));
                continue;
            }
            let point = DataPoint {
                timestamp: ts,
                source_id: slot.id.clone(),
                bar,
            };
            self.prime(index);
            return Some(point);
        }
    }

    fn all_exhausted(&self) -> bool {
        self.slots.iter().all(|s| s.exhausted && s.pending.is_none())
    }
}

struct Control {
    status: ReplayStatus,
    stop_requested: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplayProgress {
    pub emitted: u64,
    pub total_estimate: Option<u64>,
    pub elapsed_ms: u64,
    pub last_ts: Option<i64>,
}

struct Inner {
    clock: Arc<TimeManager>,
    config: ReplayConfig,
    sources: Mutex<Sources>,
    control: Mutex<Control>,
    condvar: Condvar,
    callbacks: RwLock<HashMap<u64, ReplayCallback>>,
    next_callback_id: AtomicU64,
    emitted: AtomicU64,
    last_ts: Mutex<Option<i64>>,
    started_at: Mutex<Option<Instant>>,
    /// Pool dispatcher when `batch_callbacks` is on.
    pool_tx: Mutex<Option<mpsc::Sender<DataPoint>>>,
}

#[derive(Clone)]
pub struct ReplayController {
    inner: Arc<Inner>,
}

impl ReplayController {
    pub fn new(clock: Arc<TimeManager>, config: ReplayConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                config,
                sources: Mutex::new(Sources {
                    slots: Vec::new(),
                    heap: BinaryHeap::new(),
                }),
                control: Mutex::new(Control {
                    status: ReplayStatus::Initialized,
                    stop_requested: false,
                }),
                condvar: Condvar::new(),
                callbacks: RwLock::new(HashMap::new()),
                next_callback_id: AtomicU64::new(1),
                emitted: AtomicU64::new(0),
                last_ts: Mutex::new(None),
                started_at: Mutex::new(None),
                pool_tx: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> ReplayMode {
        self.inner.config.mode
    }

    pub fn status(&self) -> ReplayStatus {
        self.inner.control.lock().expect("control lock").status
    }

    pub fn add_source(&self, id: impl Into<String>, source: Box<dyn ReplaySource>) {
        let mut sources = self.inner.sources.lock().expect("sources lock");
        let index = sources.slots.len();
        sources.slots.push(SourceSlot {
            id: id.into(),
            source,
            pending: None,
            exhausted: false,
            last_ts: None,
        });
        sources.prime(index);
    }

    /// Mark a source exhausted and drop its pending item. Slot order (and
    /// with it the equal-timestamp tiebreak of the others) is preserved.
    pub fn remove_source(&self, id: &str) -> bool {
        let mut sources = self.inner.sources.lock().expect("sources lock");
        let Some(slot) = sources.slots.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        slot.exhausted = true;
        slot.pending = None;
        true
    }

    pub fn register_callback(
        &self,
        callback: impl Fn(&DataPoint) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .write()
            .expect("callbacks lock")
            .insert(id, Arc::new(callback));
        id
    }

    pub fn unregister_callback(&self, id: u64) -> bool {
        self.inner
            .callbacks
            .write()
            .expect("callbacks lock")
            .remove(&id)
            .is_some()
    }

    /// Start an asynchronous run (all modes except STEPPED). Returns false if
    /// already running or completed.
    pub fn start(&self) -> bool {
        {
            let mut control = self.inner.control.lock().expect("control lock");
            match control.status {
                ReplayStatus::Running | ReplayStatus::Paused => return false,
                ReplayStatus::Completed => return false,
                _ => {}
            }
            control.status = ReplayStatus::Running;
            control.stop_requested = false;
        }
        *self.inner.started_at.lock().expect("started lock") = Some(Instant::now());
        if self.inner.config.mode == ReplayMode::Stepped {
            // Stepped mode emits only via step(); nothing to spawn.
            return true;
        }
        if self.inner.config.batch_callbacks {
            self.spawn_pool();
        }
        let inner = self.inner.clone();
        thread::Builder::new()
            .name("replay-emitter".into())
            .spawn(move || emitter_loop(inner))
            .expect("spawn replay emitter");
        info!(mode = ?self.inner.config.mode, speed = self.inner.config.speed_factor, "replay started");
        true
    }

    pub fn pause(&self) -> bool {
        let mut control = self.inner.control.lock().expect("control lock");
        if control.status != ReplayStatus::Running {
            return false;
        }
        control.status = ReplayStatus::Paused;
        self.inner.condvar.notify_all();
        true
    }

    pub fn resume(&self) -> bool {
        let mut control = self.inner.control.lock().expect("control lock");
        if control.status != ReplayStatus::Paused {
            return false;
        }
        control.status = ReplayStatus::Running;
        self.inner.condvar.notify_all();
        true
    }

    /// Request stop; the emitter observes it within one wait tick. In-flight
    /// callbacks finish.
    pub fn stop(&self) -> bool {
        let mut control = self.inner.control.lock().expect("control lock");
        if matches!(control.status, ReplayStatus::Stopped | ReplayStatus::Completed) {
            return false;
        }
        control.stop_requested = true;
        control.status = ReplayStatus::Stopped;
        self.inner.condvar.notify_all();
        true
    }

    /// Rewind all sources and counters. Fails when any source cannot rewind
    /// or a run is active.
    pub fn reset(&self) -> bool {
        {
            let control = self.inner.control.lock().expect("control lock");
            if matches!(control.status, ReplayStatus::Running | ReplayStatus::Paused) {
                return false;
            }
        }
        let mut sources = self.inner.sources.lock().expect("sources lock");
        for slot in &mut sources.slots {
            if !slot.source.rewind() {
                return false;
            }
            slot.pending = None;
            slot.exhausted = false;
            slot.last_ts = None;
        }
        sources.heap.clear();
        for index in 0..sources.slots.len() {
            sources.prime(index);
        }
        drop(sources);
        self.inner.emitted.store(0, Ordering::Relaxed);
        *self.inner.last_ts.lock().expect("last ts lock") = None;
        let mut control = self.inner.control.lock().expect("control lock");
        control.status = ReplayStatus::Initialized;
        control.stop_requested = false;
        true
    }

    /// Emit exactly one item synchronously (STEPPED mode, also usable before
    /// `start`). Must not be mixed with an active asynchronous run.
    pub fn step(&self) -> Option<DataPoint> {
        let point = {
            let mut sources = self.inner.sources.lock().expect("sources lock");
            sources.pop_next()
        };
        let point = match point {
            Some(p) => p,
            None => {
                let mut control = self.inner.control.lock().expect("control lock");
                control.status = ReplayStatus::Completed;
                return None;
            }
        };
        self.emit(&point);
        Some(point)
    }

    /// Drain every source synchronously in merged order and return the
    /// emitted points. No background threads involved.
    pub fn process_all_sync(&self) -> Vec<DataPoint> {
        let mut out = Vec::new();
        while let Some(point) = self.step() {
            out.push(point);
        }
        out
    }

    pub fn progress(&self) -> ReplayProgress {
        let total_estimate = {
            let sources = self.inner.sources.lock().expect("sources lock");
            sources
                .slots
                .iter()
                .map(|s| s.source.size_hint())
                .try_fold(0u64, |acc, h| h.map(|n| acc + n as u64))
        };
        let elapsed_ms = self
            .inner
            .started_at
            .lock()
            .expect("started lock")
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        ReplayProgress {
            emitted: self.inner.emitted.load(Ordering::Relaxed),
            total_estimate,
            elapsed_ms,
            last_ts: *self.inner.last_ts.lock().expect("last ts lock"),
        }
    }

    /// Block until the run leaves the Running/Paused states, polling with
    /// bounded waits. Test helper.
    pub fn join(&self) {
        loop {
            let control = self.inner.control.lock().expect("control lock");
            if !matches!(control.status, ReplayStatus::Running | ReplayStatus::Paused) {
                return;
            }
            drop(control);
            thread::sleep(WAIT_TICK);
        }
    }

    fn emit(&self, point: &DataPoint) {
        emit_point(&self.inner, point);
    }

    fn spawn_pool(&self) {
        let (tx, rx) = mpsc::channel::<DataPoint>();
        *self.inner.pool_tx.lock().expect("pool lock") = Some(tx);
        let rx = Arc::new(Mutex::new(rx));
        for n in 0..POOL_WORKERS {
            let rx = rx.clone();
            let inner = self.inner.clone();
            thread::Builder::new()
                .name(format!("replay-pool-{n}"))
                .spawn(move || loop {
                    let item = {
                        let guard = rx.lock().expect("pool rx lock");
                        guard.recv_timeout(WAIT_TICK)
                    };
                    match item {
                        Ok(point) => invoke_callbacks(&inner, &point),
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let control = inner.control.lock().expect("control lock");
                            if matches!(
                                control.status,
                                ReplayStatus::Stopped | ReplayStatus::Completed
                            ) {
                                return;
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                })
                .expect("spawn pool worker");
        }
    }
}

fn emitter_loop(inner: Arc<Inner>) {
    let mut prev_ts: Option<i64> = None;
    loop {
        // Honor pause/stop with bounded waits.
        {
            let mut control = inner.control.lock().expect("control lock");
            loop {
                if control.stop_requested {
                    info!("replay stopped");
                    return;
                }
                if control.status == ReplayStatus::Running {
                    break;
                }
                let (guard, _) = inner
                    .condvar
                    .wait_timeout(control, WAIT_TICK)
                    .expect("control wait");
                control = guard;
            }
        }

        let point = {
            let mut sources = inner.sources.lock().expect("sources lock");
            sources.pop_next()
        };
        let Some(point) = point else {
            let mut control = inner.control.lock().expect("control lock");
            control.status = ReplayStatus::Completed;
            info!("replay completed");
            return;
        };

        // Pace REALTIME/ACCELERATED by the historical gap, in bounded slices
        // so stop remains responsive.
        let delay_ms = match inner.config.mode {
            ReplayMode::Realtime => prev_ts.map(|p| (point.timestamp - p).max(0)),
            ReplayMode::Accelerated => prev_ts.map(|p| {
                let gap = (point.timestamp - p).max(0) as f64;
                (gap / inner.config.speed_factor.max(f64::MIN_POSITIVE)) as i64
            }),
            _ => None,
        };
        if let Some(mut remaining) = delay_ms {
            while remaining > 0 {
                let slice = remaining.min(WAIT_TICK.as_millis() as i64);
                thread::sleep(Duration::from_millis(slice as u64));
                remaining -= slice;
                let control = inner.control.lock().expect("control lock");
                if control.stop_requested {
                    return;
                }
            }
        }
        prev_ts = Some(point.timestamp);

        emit_point(&inner, &point);
    }
}

/// Advance the clock to the point's timestamp, then hand it to callbacks
/// (inline, or via the pool when batching).
fn emit_point(inner: &Inner, point: &DataPoint) {
    if let Err(e) = inner.clock.set_backtest_time(point.timestamp) {
        warn!(error = %e, ts = point.timestamp, "clock rejected replay timestamp");
        return;
    }
    inner.emitted.fetch_add(1, Ordering::Relaxed);
    *inner.last_ts.lock().expect("last ts lock") = Some(point.timestamp);

    let pool_tx = inner.pool_tx.lock().expect("pool lock");
    if let Some(tx) = pool_tx.as_ref() {
        if tx.send(point.clone()).is_ok() {
            return;
        }
        // Pool gone; fall back to inline.
    }
    drop(pool_tx);
    invoke_callbacks(inner, point);
}

fn invoke_callbacks(inner: &Inner, point: &DataPoint) {
    let callbacks: Vec<ReplayCallback> = {
        let guard = inner.callbacks.read().expect("callbacks lock");
        guard.values().cloned().collect()
    };
    for callback in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| callback(point)));
        if result.is_err() {
            warn!(source = %point.source_id, ts = point.timestamp, "replay callback panicked");
        }
    }
}
