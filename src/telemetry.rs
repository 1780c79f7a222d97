//! Lock-free counters shared between the audio thread, the worker and observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of frames the rolling latency average spans.
pub const LATENCY_WINDOW: usize = 64;

#[derive(Debug, Default)]
pub struct Telemetry {
    overflow_events: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    inference_failures: AtomicU64,
    frames_processed: AtomicU64,
    passthrough_frames: AtomicU64,
    rejected_reconstructions: AtomicU64,
    underrun_samples: AtomicU64,
    dropped_output_samples: AtomicU64,
    avg_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
}

/// Point-in-time copy of [`Telemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub overflow_events: u64,
    pub circuit_breaker_trips: u64,
    pub inference_failures: u64,
    pub frames_processed: u64,
    pub passthrough_frames: u64,
    pub rejected_reconstructions: u64,
    pub underrun_samples: u64,
    pub dropped_output_samples: u64,
    pub average_frame_latency: Duration,
    pub max_frame_latency: Duration,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror the ingest buffer's lifetime counters.
    pub fn set_ingest_counters(&self, overflow_events: u64, circuit_breaker_trips: u64) {
        self.overflow_events.store(overflow_events, Ordering::Relaxed);
        self.circuit_breaker_trips.store(circuit_breaker_trips, Ordering::Relaxed);
    }

    pub fn record_inference_failure(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self, passthrough: bool) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        if passthrough {
            self.passthrough_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected_reconstruction(&self) {
        self.rejected_reconstructions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self, samples: usize) {
        self.underrun_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_output(&self, samples: usize) {
        self.dropped_output_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    fn publish_latency(&self, average: Duration, sample: Duration) {
        let avg = average.as_nanos().min(u64::MAX as u128) as u64;
        let ns = sample.as_nanos().min(u64::MAX as u128) as u64;
        self.avg_latency_ns.store(avg, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn inference_failures(&self) -> u64 {
        self.inference_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            passthrough_frames: self.passthrough_frames.load(Ordering::Relaxed),
            rejected_reconstructions: self.rejected_reconstructions.load(Ordering::Relaxed),
            underrun_samples: self.underrun_samples.load(Ordering::Relaxed),
            dropped_output_samples: self.dropped_output_samples.load(Ordering::Relaxed),
            average_frame_latency: Duration::from_nanos(self.avg_latency_ns.load(Ordering::Relaxed)),
            max_frame_latency: Duration::from_nanos(self.max_latency_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Rolling mean of per-frame processing time. Owned by the frame worker.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: [u64; LATENCY_WINDOW],
    pos: usize,
    filled: usize,
    sum: u64,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self { samples: [0; LATENCY_WINDOW], pos: 0, filled: 0, sum: 0 }
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one measurement and publish the new average to `telemetry`.
    pub fn record(&mut self, elapsed: Duration, telemetry: &Telemetry) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.sum = self.sum - self.samples[self.pos] + ns;
        self.samples[self.pos] = ns;
        self.pos = (self.pos + 1) % LATENCY_WINDOW;
        self.filled = (self.filled + 1).min(LATENCY_WINDOW);
        telemetry.publish_latency(self.average(), elapsed);
    }

    pub fn average(&self) -> Duration {
        if self.filled == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.sum / self.filled as u64)
    }
}
