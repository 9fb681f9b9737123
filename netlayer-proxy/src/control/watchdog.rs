//! Shared monitor enforcing time and throughput limits.
//!
//! Every controlled connection owns a [`ControlRecord`], which also holds the
//! lower stream. The [`Watchdog`] keeps only a `Weak` to it, so a connection
//! that is dropped without being closed simply disappears from the next
//! sweep. One OS thread per watchdog wakes every tick, evaluates all records,
//! removes the violators under the registry lock and force-closes them after
//! the lock is released. A force-close drops the lower stream itself, so an
//! idle connection is released even if its owner never polls it again.

use crate::control::params::ControlParameters;
use crate::error::ControlViolation;
use crate::layer::BoxedStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Monitor period of the process-wide watchdog
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

static GLOBAL: LazyLock<Watchdog> = LazyLock::new(|| Watchdog::with_tick(DEFAULT_TICK));

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a controlled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Active,
    /// A limit was violated; the close has not been delivered yet
    Flagged,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Counters {
    state: RecordState,
    transferred: u64,
    window_start: Instant,
    window_start_bytes: u64,
    failure: Option<ControlViolation>,
}

/// Outcome of evaluating one record during a sweep
#[derive(Debug)]
enum Verdict {
    Healthy,
    Finished,
    Violated(ControlViolation),
}

/// Per-connection state shared between a controlled stream and the watchdog
#[derive(Debug)]
pub struct ControlRecord {
    id: u64,
    params: ControlParameters,
    created: Instant,
    counters: Mutex<Counters>,
    /// The controlled lower connection; emptied on close
    lower: Mutex<Option<BoxedStream>>,
    closed: CancellationToken,
}

impl ControlRecord {
    pub fn new(params: ControlParameters) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            params,
            created: now,
            counters: Mutex::new(Counters {
                state: RecordState::Active,
                transferred: 0,
                window_start: now,
                window_start_bytes: 0,
                failure: None,
            }),
            lower: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn params(&self) -> &ControlParameters {
        &self.params
    }

    pub fn state(&self) -> RecordState {
        self.counters.lock().state
    }

    /// Cumulative bytes read plus written
    pub fn transferred(&self) -> u64 {
        self.counters.lock().transferred
    }

    /// Failure posted by the watchdog, if any
    pub fn failure(&self) -> Option<ControlViolation> {
        self.counters.lock().failure.clone()
    }

    /// Fires once the record is force-closed
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn attach(&self, stream: BoxedStream) {
        *self.lower.lock() = Some(stream);
    }

    /// Whether the lower connection is still held
    pub fn is_attached(&self) -> bool {
        self.lower.lock().is_some()
    }

    /// Poll the lower connection; `None` once it has been released
    pub(crate) fn poll_lower<T>(
        &self,
        poll: impl FnOnce(Pin<&mut BoxedStream>) -> Poll<io::Result<T>>,
    ) -> Option<Poll<io::Result<T>>> {
        self.lower.lock().as_mut().map(|stream| poll(Pin::new(stream)))
    }

    /// Drop the lower connection outside the slot lock
    pub(crate) fn release_lower(&self) {
        let stream = self.lower.lock().take();
        drop(stream);
    }

    pub(crate) fn add_transferred(&self, bytes: u64) {
        if bytes > 0 {
            self.counters.lock().transferred += bytes;
        }
    }

    /// Owner started closing the connection itself
    pub(crate) fn begin_close(&self) {
        let mut counters = self.counters.lock();
        if counters.state == RecordState::Active {
            counters.state = RecordState::Closing;
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.counters.lock().state = RecordState::Closed;
    }

    fn evaluate(&self, now: Instant) -> Verdict {
        let mut counters = self.counters.lock();
        if counters.state != RecordState::Active {
            return Verdict::Finished;
        }

        if let Some(limit) = self.params.overall_timeout() {
            let elapsed = now.saturating_duration_since(self.created);
            if elapsed >= limit {
                counters.state = RecordState::Flagged;
                return Verdict::Violated(ControlViolation::OverallTimeout { limit, elapsed });
            }
        }

        if let Some(window) = self.params.throughput_window() {
            if now.saturating_duration_since(counters.window_start) >= window {
                let delta = counters.transferred - counters.window_start_bytes;
                counters.window_start = now;
                counters.window_start_bytes = counters.transferred;

                let minimum = self.params.throughput_min_bytes_per_window;
                if delta < minimum {
                    counters.state = RecordState::Flagged;
                    return Verdict::Violated(ControlViolation::ThroughputTooLow {
                        window,
                        transferred: delta,
                        minimum,
                    });
                }
            }
        }

        Verdict::Healthy
    }

    /// Post the failure, release the lower connection, then wake the owner
    fn force_close(&self, violation: ControlViolation) {
        {
            let mut counters = self.counters.lock();
            counters.failure = Some(violation);
            counters.state = RecordState::Closing;
        }
        self.release_lower();
        self.mark_closed();
        self.closed.cancel();
    }
}

#[derive(Debug)]
struct WatchdogInner {
    tick: Duration,
    records: Mutex<HashMap<u64, Weak<ControlRecord>>>,
    forced_closes: AtomicU64,
    monitor_started: AtomicBool,
}

/// Registry of controlled connections plus the thread that polices them
#[derive(Debug, Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    /// The process-wide watchdog shared by all control layers by default
    pub fn global() -> Watchdog {
        GLOBAL.clone()
    }

    /// An isolated watchdog with its own monitor thread
    pub fn with_tick(tick: Duration) -> Watchdog {
        Watchdog {
            inner: Arc::new(WatchdogInner {
                tick,
                records: Mutex::new(HashMap::new()),
                forced_closes: AtomicU64::new(0),
                monitor_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// Create and register a record for a new connection
    pub fn register(&self, params: ControlParameters) -> Arc<ControlRecord> {
        let record = Arc::new(ControlRecord::new(params));
        self.inner
            .records
            .lock()
            .insert(record.id(), Arc::downgrade(&record));
        self.ensure_monitor();
        record
    }

    /// Remove a record; returns whether it was still registered
    pub fn deregister(&self, id: u64) -> bool {
        self.inner.records.lock().remove(&id).is_some()
    }

    /// Number of registered records, including ones whose connection is
    /// already gone but has not been swept yet
    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn forced_closes(&self) -> u64 {
        self.inner.forced_closes.load(Ordering::Relaxed)
    }

    /// Evaluate every record and remove the violators and the dead ones.
    ///
    /// Violators are returned, not closed: the caller closes them after the
    /// registry lock is released.
    pub fn sweep(&self, now: Instant) -> Vec<(Arc<ControlRecord>, ControlViolation)> {
        let mut flagged = Vec::new();
        self.inner.records.lock().retain(|_, weak| {
            let Some(record) = weak.upgrade() else {
                return false;
            };
            match record.evaluate(now) {
                Verdict::Healthy => true,
                Verdict::Finished => false,
                Verdict::Violated(violation) => {
                    flagged.push((record, violation));
                    false
                }
            }
        });
        flagged
    }

    /// One monitor pass: sweep, then force-close outside the registry lock
    pub fn enforce(&self, now: Instant) -> usize {
        let flagged = self.sweep(now);
        self.inner
            .forced_closes
            .fetch_add(flagged.len() as u64, Ordering::Relaxed);
        for (record, violation) in &flagged {
            warn!("Closing controlled connection {}: {}", record.id(), violation);
            record.force_close(violation.clone());
        }
        flagged.len()
    }

    fn ensure_monitor(&self) {
        if self.inner.monitor_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let tick = self.inner.tick;
        let spawned = std::thread::Builder::new()
            .name("netlayer-watchdog".to_string())
            .spawn(move || monitor_loop(weak, tick));

        match spawned {
            Ok(_) => debug!("Watchdog monitor started (tick {:?})", tick),
            Err(e) => {
                warn!("Failed to start watchdog monitor: {}", e);
                self.inner.monitor_started.store(false, Ordering::Release);
            }
        }
    }
}

fn monitor_loop(weak: Weak<WatchdogInner>, tick: Duration) {
    loop {
        std::thread::sleep(tick);
        let Some(inner) = weak.upgrade() else {
            break;
        };
        Watchdog { inner }.enforce(Instant::now());
    }
    debug!("Watchdog monitor exiting");
}
