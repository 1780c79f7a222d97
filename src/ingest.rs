//! Bounded input buffering with overflow crossfade and a circuit breaker.
//!
//! Incoming blocks of any length are accumulated and handed out as overlapping
//! frames of `frame_size` samples that advance by `hop_size`. Capacity is fixed at
//! construction; the backing `VecDeque` never reallocates.
//!
//! When the consumer falls behind, the oldest pending samples are dropped to make
//! room and the newly admitted samples are faded in so the splice is inaudible. If
//! that keeps happening for more than `max_consecutive_overflows` calls in a row the
//! buffer trips: pending audio is discarded and input is refused until the
//! suspension timer runs out, after which it heals by itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{CrossfadeCurve, PipelineConfig};

/// Result of admitting one block.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A full frame was available and has been extracted.
    FrameReady(Vec<f32>),
    /// Samples buffered; no full frame yet.
    Accepted,
    /// Samples buffered after dropping the oldest pending audio.
    Overflow,
    /// The breaker is open. Carries the time until input is accepted again.
    CircuitBreakerTripped(Duration),
}

impl Outcome {
    pub fn is_tripped(&self) -> bool {
        matches!(self, Outcome::CircuitBreakerTripped(_))
    }
}

/// Counters accumulated by an [`IngestBuffer`] over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted_samples: u64,
    pub discarded_samples: u64,
    pub overflow_events: u64,
    pub circuit_breaker_trips: u64,
    pub frames_emitted: u64,
}

pub struct IngestBuffer {
    pending: VecDeque<f32>,
    capacity: usize,
    frame_size: usize,
    hop_size: usize,
    max_consecutive_overflows: u32,
    suspension: Duration,
    crossfade: CrossfadeCurve,
    consecutive_overflows: u32,
    suspended_until: Option<Instant>,
    stats: IngestStats,
}

impl IngestBuffer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(config.max_buffer_size),
            capacity: config.max_buffer_size,
            frame_size: config.frame_size,
            hop_size: config.hop_size,
            max_consecutive_overflows: config.max_consecutive_overflows,
            suspension: config.circuit_breaker_suspension,
            crossfade: config.crossfade,
            consecutive_overflows: 0,
            suspended_until: None,
            stats: IngestStats::default(),
        }
    }

    /// Append `block` and extract a frame if one is complete.
    pub fn append(&mut self, block: &[f32]) -> Outcome {
        self.append_at(block, Instant::now())
    }

    /// [`append`](Self::append) with an explicit clock reading.
    ///
    /// `FrameReady` is only reported for a clean append; after an `Overflow` the
    /// frames stay buffered and are drained with [`next_frame`](Self::next_frame).
    pub fn append_at(&mut self, block: &[f32], now: Instant) -> Outcome {
        match self.enqueue_at(block, now) {
            Outcome::Accepted => match self.next_frame() {
                Some(frame) => Outcome::FrameReady(frame),
                None => Outcome::Accepted,
            },
            other => other,
        }
    }

    /// Admit `block` without extracting frames. Never returns `FrameReady`.
    pub fn enqueue(&mut self, block: &[f32]) -> Outcome {
        self.enqueue_at(block, Instant::now())
    }

    /// [`enqueue`](Self::enqueue) with an explicit clock reading.
    pub fn enqueue_at(&mut self, block: &[f32], now: Instant) -> Outcome {
        if let Some(until) = self.suspended_until {
            if now < until {
                return Outcome::CircuitBreakerTripped(until.saturating_duration_since(now));
            }
            self.suspended_until = None;
            self.consecutive_overflows = 0;
            log::info!("ingest circuit breaker closed, accepting input again");
        }

        if block.is_empty() {
            return Outcome::Accepted;
        }

        // A block larger than the whole buffer only contributes its newest samples.
        let truncated = block.len().saturating_sub(self.capacity);
        let incoming = &block[truncated..];
        let excess = (self.pending.len() + block.len()).saturating_sub(self.capacity);

        if excess == 0 {
            self.pending.extend(incoming.iter().copied());
            self.consecutive_overflows = 0;
            self.stats.accepted_samples += incoming.len() as u64;
            return Outcome::Accepted;
        }

        self.consecutive_overflows = self.consecutive_overflows.saturating_add(1);
        self.stats.overflow_events += 1;

        if self.consecutive_overflows > self.max_consecutive_overflows && self.suspended_until.is_none() {
            self.stats.discarded_samples += (self.pending.len() + block.len()) as u64;
            self.pending.clear();
            self.suspended_until = Some(now + self.suspension);
            self.stats.circuit_breaker_trips += 1;
            log::warn!(
                "ingest circuit breaker tripped after {} consecutive overflows, suspending for {:?}",
                self.consecutive_overflows,
                self.suspension
            );
            return Outcome::CircuitBreakerTripped(self.suspension);
        }

        let dropped = (self.pending.len() + incoming.len()).saturating_sub(self.capacity);
        self.pending.drain(..dropped);

        let fade_len = excess.min(incoming.len());
        for (i, &s) in incoming.iter().enumerate() {
            let gain = if i < fade_len {
                self.crossfade.gain(i as f32 / fade_len as f32)
            } else {
                1.0
            };
            self.pending.push_back(s * gain);
        }

        self.stats.accepted_samples += incoming.len() as u64;
        self.stats.discarded_samples += (dropped + truncated) as u64;
        log::debug!("ingest overflow: dropped {} samples ({} consecutive)", dropped, self.consecutive_overflows);
        Outcome::Overflow
    }

    /// Extract the oldest complete frame, advancing by one hop.
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        let mut frame = vec![0.0f32; self.frame_size];
        if self.next_frame_into(&mut frame) {
            Some(frame)
        } else {
            None
        }
    }

    /// Allocation-free [`next_frame`](Self::next_frame). `out` must be `frame_size` long.
    pub fn next_frame_into(&mut self, out: &mut [f32]) -> bool {
        debug_assert_eq!(out.len(), self.frame_size);
        if self.pending.len() < self.frame_size || out.len() != self.frame_size {
            return false;
        }
        for (dst, &src) in out.iter_mut().zip(self.pending.iter()) {
            *dst = src;
        }
        self.pending.drain(..self.hop_size);
        self.stats.frames_emitted += 1;
        true
    }

    /// Pre-fill `samples` of silence (bounded by capacity).
    ///
    /// Priming with `frame_size - hop_size` samples makes every further hop of input
    /// complete one frame, so output blocks match input blocks in length.
    pub fn prime(&mut self, samples: usize) {
        self.pad(samples);
    }

    /// Append up to `samples` of silence outside the admission policy.
    ///
    /// Never overflows: the fill stops at capacity, and neither the overflow counter
    /// nor the breaker is touched. Returns the number of samples written.
    pub fn pad(&mut self, samples: usize) -> usize {
        let room = self.capacity - self.pending.len();
        let n = samples.min(room);
        self.pending.extend(std::iter::repeat(0.0f32).take(n));
        n
    }

    /// Drop all pending audio and close the breaker. Lifetime stats are kept.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.consecutive_overflows = 0;
        self.suspended_until = None;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Complete frames currently extractable.
    pub fn frames_available(&self) -> usize {
        if self.pending.len() < self.frame_size {
            0
        } else {
            (self.pending.len() - self.frame_size) / self.hop_size + 1
        }
    }

    pub fn consecutive_overflows(&self) -> u32 {
        self.consecutive_overflows
    }

    /// Whether the breaker is open at `now`. Does not close an expired breaker.
    pub fn is_suspended_at(&self, now: Instant) -> bool {
        self.suspended_until.is_some_and(|until| now < until)
    }

    pub fn suspended_until(&self) -> Option<Instant> {
        self.suspended_until
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            max_buffer_size: 64,
            max_consecutive_overflows: 3,
            circuit_breaker_suspension: Duration::from_millis(100),
            ..PipelineConfig::with_frame_size(16)
        }
    }

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32 * 0.001).collect()
    }

    #[test]
    fn test_accumulates_until_frame() {
        let mut buf = IngestBuffer::new(&small_config());
        assert_eq!(buf.append(&ramp(0, 10)), Outcome::Accepted);
        match buf.append(&ramp(10, 10)) {
            Outcome::FrameReady(frame) => {
                assert_eq!(frame.len(), 16);
                assert_eq!(frame, ramp(0, 16));
            }
            other => panic!("expected frame, got {:?}", other),
        }
        // One hop consumed, the overlapping half stays buffered.
        assert_eq!(buf.len(), 20 - 8);
    }

    #[test]
    fn test_frames_overlap_by_half() {
        let mut buf = IngestBuffer::new(&small_config());
        buf.enqueue(&ramp(0, 32));
        assert_eq!(buf.frames_available(), 3);
        let a = buf.next_frame().unwrap();
        let b = buf.next_frame().unwrap();
        assert_eq!(&a[8..], &b[..8]);
        assert_eq!(b, ramp(8, 16));
    }

    #[test]
    fn test_frame_alignment_never_exceeds_input() {
        let config = small_config();
        let mut buf = IngestBuffer::new(&config);
        let now = Instant::now();
        let mut appended = 0usize;
        let mut frames = 0usize;
        let sizes = [3usize, 17, 40, 1, 64, 90, 7, 31, 12, 5, 128, 9];
        for (round, &n) in sizes.iter().cycle().take(60).enumerate() {
            let block = ramp(appended, n);
            appended += n;
            let outcome = buf.append_at(&block, now + Duration::from_secs(round as u64));
            if let Outcome::FrameReady(frame) = outcome {
                assert_eq!(frame.len(), config.frame_size);
                frames += 1;
            }
            // Drain occasionally so both paths are exercised.
            if round % 3 == 0 {
                while let Some(frame) = buf.next_frame() {
                    assert_eq!(frame.len(), config.frame_size);
                    frames += 1;
                }
            }
            // Every emitted hop is a distinct admitted sample; the rest is pending or dropped.
            let stats = buf.stats();
            assert_eq!(stats.frames_emitted, frames as u64);
            let consumed = (frames * config.hop_size + buf.len()) as u64;
            assert!(consumed <= appended as u64 - stats.discarded_samples);
            assert!(buf.len() <= config.max_buffer_size);
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_fades_in() {
        let config = small_config();
        let mut buf = IngestBuffer::new(&config);
        buf.enqueue(&vec![1.0; 60]);
        let outcome = buf.enqueue(&vec![1.0; 10]);
        assert_eq!(outcome, Outcome::Overflow);
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.consecutive_overflows(), 1);
        assert_eq!(buf.stats().discarded_samples, 6);

        // Last 10 samples are the new block; the first 6 of them are faded in.
        let tail: Vec<f32> = buf.pending.iter().skip(54).copied().collect();
        assert_eq!(tail[0], 0.0);
        for w in tail[..6].windows(2) {
            assert!(w[1] > w[0]);
        }
        assert!(tail[6..].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_clean_append_resets_overflow_counter() {
        let mut buf = IngestBuffer::new(&small_config());
        buf.enqueue(&vec![0.1; 64]);
        assert_eq!(buf.enqueue(&[0.1; 8]), Outcome::Overflow);
        assert_eq!(buf.enqueue(&[0.1; 8]), Outcome::Overflow);
        while buf.next_frame().is_some() {}
        assert_eq!(buf.enqueue(&[0.1; 8]), Outcome::Accepted);
        assert_eq!(buf.consecutive_overflows(), 0);
    }

    #[test]
    fn test_oversized_block_keeps_newest_samples() {
        let mut buf = IngestBuffer::new(&small_config());
        let block = ramp(0, 100);
        assert_eq!(buf.enqueue(&block), Outcome::Overflow);
        assert_eq!(buf.consecutive_overflows(), 1);
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.stats().discarded_samples, 36);
        assert_eq!(buf.stats().overflow_events, 1);

        // The kept samples are faded in over the 36 dropped ones.
        assert_eq!(buf.pending.front().copied(), Some(0.0));
        assert!((buf.pending[36] - block[72]).abs() < 1e-7);
        assert_eq!(buf.pending.back().copied(), Some(block[99]));
    }

    #[test]
    fn test_repeated_oversized_blocks_trip_breaker() {
        let config = small_config();
        let mut buf = IngestBuffer::new(&config);
        let t0 = Instant::now();
        for _ in 0..config.max_consecutive_overflows {
            assert_eq!(buf.enqueue_at(&vec![0.1; 100], t0), Outcome::Overflow);
            while buf.next_frame().is_some() {}
        }
        assert!(buf.enqueue_at(&vec![0.1; 100], t0).is_tripped());
        assert_eq!(buf.stats().circuit_breaker_trips, 1);
    }

    #[test]
    fn test_oversized_block_into_partial_buffer_fades_in() {
        let mut buf = IngestBuffer::new(&small_config());
        buf.enqueue(&vec![0.5; 20]);
        assert_eq!(buf.enqueue(&vec![1.0; 100]), Outcome::Overflow);

        // All 20 pending samples and the oldest 36 of the block are gone.
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.stats().discarded_samples, 56);
        let kept: Vec<f32> = buf.pending.iter().copied().collect();
        assert_eq!(kept[0], 0.0);
        for w in kept[..56].windows(2) {
            assert!(w[1] > w[0]);
        }
        assert!(kept[56..].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_equal_power_crossfade_on_overflow() {
        let config = PipelineConfig { crossfade: CrossfadeCurve::EqualPower, ..small_config() };
        let mut buf = IngestBuffer::new(&config);
        buf.enqueue(&vec![1.0; 60]);
        assert_eq!(buf.enqueue(&vec![1.0; 10]), Outcome::Overflow);

        let tail: Vec<f32> = buf.pending.iter().skip(54).copied().collect();
        for (i, &s) in tail[..6].iter().enumerate() {
            let expected = (i as f32 / 6.0 * std::f32::consts::FRAC_PI_2).sin();
            assert!((s - expected).abs() < 1e-6, "sample {}: {} vs {}", i, s, expected);
        }
        // Equal-power rises faster than linear at the midpoint.
        assert!(tail[3] > 0.5 + 0.1);
        assert!(tail[6..].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_circuit_breaker_trips_and_heals() {
        let config = small_config();
        let mut buf = IngestBuffer::new(&config);
        let t0 = Instant::now();
        buf.enqueue_at(&vec![0.2; 64], t0);

        for _ in 0..config.max_consecutive_overflows {
            assert_eq!(buf.enqueue_at(&[0.2; 4], t0), Outcome::Overflow);
        }
        assert_eq!(
            buf.enqueue_at(&[0.2; 4], t0),
            Outcome::CircuitBreakerTripped(config.circuit_breaker_suspension)
        );
        assert!(buf.is_empty());
        assert!(buf.is_suspended_at(t0));

        // Refused while suspended, nothing is buffered.
        let later = t0 + Duration::from_millis(40);
        match buf.append_at(&[0.2; 4], later) {
            Outcome::CircuitBreakerTripped(remaining) => {
                assert_eq!(remaining, Duration::from_millis(60));
            }
            other => panic!("expected suspension, got {:?}", other),
        }
        assert!(buf.is_empty());
        assert_eq!(buf.stats().circuit_breaker_trips, 1);

        let healed = t0 + config.circuit_breaker_suspension;
        assert_eq!(buf.append_at(&[0.2; 4], healed), Outcome::Accepted);
        assert_eq!(buf.consecutive_overflows(), 0);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.stats().circuit_breaker_trips, 1);
    }

    #[test]
    fn test_prime_and_reset() {
        let config = small_config();
        let mut buf = IngestBuffer::new(&config);
        buf.prime(config.overlap());
        assert_eq!(buf.len(), 8);
        assert!(matches!(buf.append(&[0.5; 8]), Outcome::FrameReady(_)));
        buf.prime(1000);
        assert_eq!(buf.len(), config.max_buffer_size);
        assert_eq!(buf.pad(10), 0);
        assert_eq!(buf.consecutive_overflows(), 0);
        assert_eq!(buf.stats().overflow_events, 0);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.frames_available(), 0);
    }
}
