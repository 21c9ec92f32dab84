use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

/// Default callback delivery interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Run time after which an ETA is reported.
pub const ETA_MIN_ELAPSED: Duration = Duration::from_secs(60);

/// A snapshot of transfer progress, emitted while a part is in flight and
/// when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// 1-based part number.
    pub part_number: u32,
    pub total_parts: u64,
    /// Archive size in bytes.
    pub total_bytes: u64,
    /// Bytes sent during this run: confirmed parts plus the in-flight part.
    pub bytes_transferred: u64,
    /// Archive offset reached, counting skipped parts and in-flight bytes.
    pub position: u64,
    /// Bytes of the current part sent so far.
    pub part_bytes_transferred: u64,
    pub part_length: u64,
    pub elapsed: Duration,
    pub part_elapsed: Duration,
    /// 1-based attempt number for the current part.
    pub attempt: u32,
}

impl ProgressEvent {
    pub fn part_finished(&self) -> bool {
        self.part_bytes_transferred >= self.part_length
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.position)
    }

    /// Archive progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.position as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Receives progress events. Observers must not influence the transfer.
pub trait ProgressObserver: Send + Sync {
    fn observe(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn observe(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Throughput figures derived from a [`ProgressEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressStats {
    pub event: ProgressEvent,
    /// Bytes/second over the recent sample window.
    pub instant_bps: f64,
    /// Bytes/second since the run started.
    pub average_bps: f64,
    /// Estimated time remaining; `None` until enough time has passed.
    pub eta: Option<Duration>,
}

/// Callback invoked with computed statistics.
pub type StatsCallback = Box<dyn Fn(&ProgressStats) + Send + Sync>;

// ---------------------------------------------------------------------------
// ProgressReporter
// ---------------------------------------------------------------------------

/// Turns raw progress events into throughput and ETA figures.
///
/// Callbacks are rate limited to one delivery per interval, except for
/// part-completion events which are always delivered.
pub struct ProgressReporter {
    callbacks: RwLock<Vec<StatsCallback>>,
    speed: SpeedCalculator,
    state: Mutex<ReporterState>,
    interval: Duration,
    eta_threshold: Duration,
}

#[derive(Default)]
struct ReporterState {
    last_bytes: u64,
    last_emit: Option<Instant>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProgressReporter {
    /// Creates a reporter with the given delivery interval.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            speed: SpeedCalculator::new(None, None),
            state: Mutex::new(ReporterState::default()),
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            eta_threshold: ETA_MIN_ELAPSED,
        }
    }

    /// Overrides the minimum run time before an ETA is produced.
    pub fn with_eta_threshold(mut self, threshold: Duration) -> Self {
        self.eta_threshold = threshold;
        self
    }

    /// Registers a statistics callback.
    pub fn on_stats(&self, callback: StatsCallback) {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.push(callback);
    }

    /// Computes statistics for `event` without recording a sample.
    pub fn stats(&self, event: &ProgressEvent) -> ProgressStats {
        let elapsed = event.elapsed.as_secs_f64();
        let average_bps = if elapsed > 0.0 {
            event.bytes_transferred as f64 / elapsed
        } else {
            0.0
        };
        let eta = if event.elapsed >= self.eta_threshold && average_bps > 0.0 {
            Some(Duration::from_secs_f64(
                event.bytes_remaining() as f64 / average_bps,
            ))
        } else {
            None
        };
        ProgressStats {
            event: event.clone(),
            instant_bps: self.speed.bytes_per_second(),
            average_bps,
            eta,
        }
    }
}

impl ProgressObserver for ProgressReporter {
    fn observe(&self, event: &ProgressEvent) {
        let deliver = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            // A retried part restarts its byte count; only forward motion is a sample.
            if event.bytes_transferred > state.last_bytes {
                self.speed
                    .add_sample(event.bytes_transferred - state.last_bytes);
            }
            state.last_bytes = event.bytes_transferred;

            let now = Instant::now();
            let due = state
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.interval);
            if due || event.part_finished() {
                state.last_emit = Some(now);
                true
            } else {
                false
            }
        };
        if !deliver {
            return;
        }

        let stats = self.stats(event);
        trace!(
            part = event.part_number,
            bytes = event.bytes_transferred,
            instant_bps = stats.instant_bps,
            "progress"
        );
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        for cb in callbacks.iter() {
            cb(&stats);
        }
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&self, bytes: u64, now: Instant) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// The oldest sample only marks where the interval starts; its bytes
    /// were sent before it. Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let [first, rest @ ..] = s.samples.as_slice() else {
            return 0.0;
        };
        let Some(last) = rest.last() else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = rest.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }
}
