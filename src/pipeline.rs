//! Frame sequencing and the session state machine.
//!
//! [`PipelineOrchestrator`] turns one analysis frame into one hop of enhanced
//! output: forward transform, features, inference, reconstruction, overlap-add.
//! It exclusively owns the recurrent [`ModelState`] and never lets a failed frame
//! touch it. [`Pipeline`] pairs an orchestrator with an [`IngestBuffer`] for
//! callers that process audio synchronously, block by block.
//!
//! ```ignore
//! use enhance_rt::{Pipeline, PipelineConfig, ScriptedEngine, ModelShape};
//!
//! let config = PipelineConfig::default();
//! let mut pipeline = Pipeline::new(config.clone())?;
//! pipeline.start(Box::new(ScriptedEngine::transparent(ModelShape::from_config(&config))))?;
//!
//! let enhanced = pipeline.process_block(&input)?;
//! let tail = pipeline.flush()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::features::{ErbFilterbank, FeatureExtractor, FeatureSet};
use crate::inference::{InferenceAdapter, InferenceEngine, ModelInput, ModelShape, ModelState};
use crate::ingest::{IngestBuffer, IngestStats, Outcome};
use crate::reconstruct::{Reconstruction, SpectralReconstructor};
use crate::telemetry::{LatencyTracker, Telemetry, TelemetrySnapshot};
use crate::transform::{FrameTransform, OverlapTail, SpectralFrame};
use crate::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    MemoryPressure,
    CircuitBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Active,
    Suspended(SuspendReason),
    Stopped,
}

impl PipelineState {
    /// Started and not stopped.
    pub fn is_running(self) -> bool {
        matches!(self, PipelineState::Active | PipelineState::Suspended(_))
    }
}

/// Why a frame bypassed the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    InferenceFailed,
    Degraded,
    MemoryPressure,
    CircuitBreaker,
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The model ran; carries what the reconstructor did with its output.
    Reconstructed(Reconstruction),
    /// Attenuated input was emitted instead.
    Passthrough(PassthroughReason),
}

/// Reject blocks with non-finite samples or samples above `ceiling`.
pub fn validate_samples(block: &[f32], ceiling: f32) -> Result<()> {
    match block.iter().position(|x| !x.is_finite() || x.abs() > ceiling) {
        Some(index) => Err(PipelineError::InvalidSamples { index, value: block[index] }),
        None => Ok(()),
    }
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    state: PipelineState,
    transform: FrameTransform,
    tail: OverlapTail,
    extractor: FeatureExtractor,
    reconstructor: SpectralReconstructor,
    adapter: Option<InferenceAdapter>,
    model_state: Option<ModelState>,
    // Per-frame scratch
    spectrum: SpectralFrame,
    features: FeatureSet,
    enhanced: SpectralFrame,
    breaker_open: bool,
    memory_pressure: Arc<AtomicBool>,
    // Pressure as sampled at the last frame boundary
    pressured: bool,
    consecutive_failures: u32,
    degraded: bool,
    telemetry: Arc<Telemetry>,
    latency: LatencyTracker,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_telemetry(config, Arc::new(Telemetry::new()))
    }

    /// Build an orchestrator reporting into shared `telemetry`.
    pub fn with_telemetry(config: PipelineConfig, telemetry: Arc<Telemetry>) -> Result<Self> {
        config.validate()?;
        let filterbank = Arc::new(ErbFilterbank::new(&config));
        let transform = FrameTransform::new(config.frame_size);
        let tail = transform.new_tail();
        let bins = config.freq_size();
        let extractor = FeatureExtractor::new(&config, Arc::clone(&filterbank));
        Ok(Self {
            features: extractor.feature_set(),
            extractor,
            reconstructor: SpectralReconstructor::new(&config, filterbank),
            transform,
            tail,
            adapter: None,
            model_state: None,
            spectrum: SpectralFrame::zeros(bins),
            enhanced: SpectralFrame::zeros(bins),
            state: PipelineState::Uninitialized,
            breaker_open: false,
            memory_pressure: Arc::new(AtomicBool::new(false)),
            pressured: false,
            consecutive_failures: 0,
            degraded: false,
            telemetry,
            latency: LatencyTracker::new(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether repeated inference failures have switched the model off.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn model_state(&self) -> Option<&ModelState> {
        self.model_state.as_ref()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Flag read at the next frame boundary. Shareable with other threads.
    pub fn memory_pressure_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.memory_pressure)
    }

    pub fn set_memory_pressure(&self, pressured: bool) {
        self.memory_pressure.store(pressured, Ordering::Release);
    }

    /// Begin a session with `engine`. Valid from `Uninitialized` or `Stopped`.
    pub fn start(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        if self.state.is_running() {
            return Err(PipelineError::InvalidTransition { from: self.state, action: "start" });
        }
        let adapter = InferenceAdapter::new(engine, ModelShape::from_config(&self.config));
        let initial = adapter.initial_state()?;
        log::info!(
            "starting pipeline: engine '{}', {} state tensors, {:.1} ms algorithmic latency",
            adapter.engine_name(),
            initial.len(),
            self.config.latency_ms()
        );

        self.tail.reset();
        self.extractor.reset();
        self.reconstructor.reset();
        self.model_state = Some(initial);
        self.adapter = Some(adapter);
        self.consecutive_failures = 0;
        self.degraded = false;
        self.breaker_open = false;
        self.pressured = self.memory_pressure.load(Ordering::Acquire);
        self.state = PipelineState::Active;
        self.resolve_state();
        Ok(())
    }

    /// End the session. Drops the model state and the pending overlap.
    pub fn stop(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }
        self.model_state = None;
        self.adapter = None;
        self.tail.reset();
        self.reconstructor.reset();
        self.breaker_open = false;
        log::info!("pipeline stopped ({:?} -> Stopped)", self.state);
        self.state = PipelineState::Stopped;
    }

    /// Feed back the ingest buffer's counters and breaker state.
    pub fn observe_ingest(&mut self, stats: &IngestStats, breaker_open: bool) {
        self.telemetry.set_ingest_counters(stats.overflow_events, stats.circuit_breaker_trips);
        self.breaker_open = breaker_open;
        self.resolve_state();
    }

    fn resolve_state(&mut self) {
        if !self.state.is_running() {
            return;
        }
        let next = if self.breaker_open {
            PipelineState::Suspended(SuspendReason::CircuitBreaker)
        } else if self.pressured {
            PipelineState::Suspended(SuspendReason::MemoryPressure)
        } else {
            PipelineState::Active
        };
        if next != self.state {
            log::info!("pipeline state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Process one `frame_size` frame into `hop_size` output samples.
    pub fn process_frame(&mut self, frame: &[f32], out: &mut [f32]) -> Result<FrameOutcome> {
        if !self.state.is_running() {
            return Err(PipelineError::NotActive(self.state));
        }
        let started = Instant::now();
        self.pressured = self.memory_pressure.load(Ordering::Acquire);
        self.resolve_state();
        self.transform.forward_into(frame, &mut self.spectrum)?;

        let outcome = match self.state {
            PipelineState::Suspended(SuspendReason::MemoryPressure) => {
                self.passthrough(out, PassthroughReason::MemoryPressure)?
            }
            PipelineState::Suspended(SuspendReason::CircuitBreaker) => {
                self.passthrough(out, PassthroughReason::CircuitBreaker)?
            }
            _ if self.degraded => self.passthrough(out, PassthroughReason::Degraded)?,
            _ => self.enhance(out)?,
        };

        self.telemetry.record_frame(matches!(outcome, FrameOutcome::Passthrough(_)));
        self.latency.record(started.elapsed(), &self.telemetry);
        log::trace!("frame {:?}", outcome);
        Ok(outcome)
    }

    fn enhance(&mut self, out: &mut [f32]) -> Result<FrameOutcome> {
        self.extractor.extract_into(&self.spectrum, &mut self.features)?;
        let (adapter, state) = match (self.adapter.as_mut(), self.model_state.as_ref()) {
            (Some(adapter), Some(state)) => (adapter, state),
            _ => return Err(PipelineError::NotActive(self.state)),
        };
        let input = ModelInput {
            perceptual: &self.features.perceptual,
            spectral: &self.features.spectral,
            complex: &self.features.complex,
        };

        match adapter.infer(&input, state) {
            Ok(output) => {
                let result = self.reconstructor.apply(&self.spectrum, &output.coefficients, output.lsnr, &mut self.enhanced);
                if result == Reconstruction::Rejected {
                    self.telemetry.record_rejected_reconstruction();
                }
                self.transform.inverse_into(&self.enhanced, &mut self.tail, out)?;
                self.model_state = Some(output.state);
                self.consecutive_failures = 0;
                Ok(FrameOutcome::Reconstructed(result))
            }
            Err(e) => {
                self.telemetry.record_inference_failure();
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                log::debug!("inference failed, passing frame through: {}", e);
                if self.consecutive_failures > self.config.max_inference_failures {
                    self.degraded = true;
                    log::warn!(
                        "{} consecutive inference failures, bypassing the model until restart",
                        self.consecutive_failures
                    );
                }
                self.passthrough(out, PassthroughReason::InferenceFailed)
            }
        }
    }

    /// Emit the unmodified spectrum, attenuated, through the regular inverse path.
    fn passthrough(&mut self, out: &mut [f32], reason: PassthroughReason) -> Result<FrameOutcome> {
        self.reconstructor.observe(&self.spectrum);
        self.enhanced.copy_from(&self.spectrum)?;
        self.enhanced.scale(self.config.passthrough_attenuation);
        self.transform.inverse_into(&self.enhanced, &mut self.tail, out)?;
        Ok(FrameOutcome::Passthrough(reason))
    }
}

/// Synchronous pipeline: ingest plus orchestrator on the caller's thread.
///
/// Output is delayed by `frame_size - hop_size` samples; call
/// [`flush`](Self::flush) at the end of a stream for the remainder.
pub struct Pipeline {
    ingest: IngestBuffer,
    orchestrator: PipelineOrchestrator,
    frame: Vec<f32>,
    hop: Vec<f32>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let orchestrator = PipelineOrchestrator::new(config)?;
        let config = orchestrator.config();
        Ok(Self {
            ingest: IngestBuffer::new(config),
            frame: vec![0.0; config.frame_size],
            hop: vec![0.0; config.hop_size],
            orchestrator,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        self.orchestrator.config()
    }

    pub fn state(&self) -> PipelineState {
        self.orchestrator.state()
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn ingest(&self) -> &IngestBuffer {
        &self.ingest
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.orchestrator.telemetry().snapshot()
    }

    pub fn set_memory_pressure(&self, pressured: bool) {
        self.orchestrator.set_memory_pressure(pressured);
    }

    pub fn start(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        self.orchestrator.start(engine)?;
        self.ingest.reset();
        self.ingest.prime(self.orchestrator.config().overlap());
        Ok(())
    }

    pub fn stop(&mut self) {
        self.orchestrator.stop();
        self.ingest.reset();
    }

    /// Validate and buffer `block`, then process every complete frame.
    pub fn process_block(&mut self, block: &[f32]) -> Result<Vec<f32>> {
        self.process_block_at(block, Instant::now())
    }

    /// [`process_block`](Self::process_block) with an explicit clock reading.
    pub fn process_block_at(&mut self, block: &[f32], now: Instant) -> Result<Vec<f32>> {
        self.ensure_running()?;
        validate_samples(block, self.orchestrator.config().amplitude_ceiling)?;
        self.ingest.enqueue_at(block, now);
        self.orchestrator.observe_ingest(&self.ingest.stats(), self.ingest.is_suspended_at(now));

        let mut output = Vec::with_capacity(block.len() + self.hop.len());
        self.drain_into(&mut output)?;
        Ok(output)
    }

    /// Validate and buffer `block` without processing it.
    pub fn push(&mut self, block: &[f32]) -> Result<Outcome> {
        self.push_at(block, Instant::now())
    }

    /// [`push`](Self::push) with an explicit clock reading.
    pub fn push_at(&mut self, block: &[f32], now: Instant) -> Result<Outcome> {
        self.ensure_running()?;
        validate_samples(block, self.orchestrator.config().amplitude_ceiling)?;
        let outcome = self.ingest.enqueue_at(block, now);
        self.orchestrator.observe_ingest(&self.ingest.stats(), self.ingest.is_suspended_at(now));
        Ok(outcome)
    }

    /// Process every complete frame buffered so far.
    pub fn drain(&mut self) -> Result<Vec<f32>> {
        self.ensure_running()?;
        let mut output = Vec::new();
        self.drain_into(&mut output)?;
        Ok(output)
    }

    /// Pad the pending input with silence and return the rest of the stream.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        self.flush_at(Instant::now())
    }

    /// [`flush`](Self::flush) with an explicit clock reading.
    ///
    /// The padding bypasses admission, so flushing never counts as an overflow and
    /// cannot trip the breaker.
    pub fn flush_at(&mut self, now: Instant) -> Result<Vec<f32>> {
        self.ensure_running()?;
        let suspended = self.ingest.is_suspended_at(now);
        self.orchestrator.observe_ingest(&self.ingest.stats(), suspended);
        let remaining = self.ingest.len();
        if remaining == 0 || suspended {
            return Ok(Vec::new());
        }

        let frame_size = self.frame.len();
        let mut output = Vec::with_capacity(remaining + self.hop.len());
        self.drain_into(&mut output)?;
        while output.len() < remaining {
            let missing = frame_size - self.ingest.len();
            if self.ingest.pad(missing) < missing {
                break;
            }
            self.drain_into(&mut output)?;
        }
        output.truncate(remaining);
        Ok(output)
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.orchestrator.state();
        if state.is_running() {
            Ok(())
        } else {
            Err(PipelineError::NotActive(state))
        }
    }

    fn drain_into(&mut self, output: &mut Vec<f32>) -> Result<()> {
        while self.ingest.next_frame_into(&mut self.frame) {
            self.orchestrator.process_frame(&self.frame, &mut self.hop)?;
            output.extend_from_slice(&self.hop);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{FilterCoefficients, InferenceError, ScriptedEngine, ScriptedStep};
    use std::f32::consts::PI;
    use std::time::Duration;

    fn shape(config: &PipelineConfig) -> ModelShape {
        ModelShape::from_config(config)
    }

    fn started(config: PipelineConfig, engine: ScriptedEngine) -> Pipeline {
        let mut pipeline = Pipeline::new(config).unwrap();
        pipeline.start(Box::new(engine)).unwrap();
        pipeline
    }

    fn sine(len: usize) -> Vec<f32> {
        (0..len).map(|i| 0.3 * (2.0 * PI * 440.0 * i as f32 / 48_000.0).sin()).collect()
    }

    fn process_in_hops(pipeline: &mut Pipeline, input: &[f32]) -> Vec<f32> {
        let hop = pipeline.config().hop_size;
        let mut out = Vec::new();
        for block in input.chunks(hop) {
            out.extend(pipeline.process_block(block).unwrap());
        }
        out
    }

    #[test]
    fn test_silence_through_unity_engine() {
        let config = PipelineConfig::default();
        let mut pipeline = started(config.clone(), ScriptedEngine::unity(shape(&config)));

        let input = vec![0.0f32; 50 * config.hop_size];
        let output = process_in_hops(&mut pipeline, &input);

        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|x| x.abs() < 1e-9));
        let t = pipeline.telemetry();
        assert_eq!(t.frames_processed, 50);
        assert_eq!(t.overflow_events, 0);
        assert_eq!(t.circuit_breaker_trips, 0);
        assert_eq!(t.inference_failures, 0);
    }

    #[test]
    fn test_transparent_engine_reproduces_input() {
        let config = PipelineConfig::default();
        let overlap = config.overlap();
        let mut pipeline = started(config.clone(), ScriptedEngine::transparent(shape(&config)));

        let input = sine(40 * config.hop_size);
        let output = process_in_hops(&mut pipeline, &input);

        assert_eq!(output.len(), input.len());
        for j in overlap..output.len() {
            assert!(
                (output[j] - input[j - overlap]).abs() < 1e-4,
                "sample {}: {} vs {}",
                j,
                output[j],
                input[j - overlap]
            );
        }
    }

    #[test]
    fn test_flush_returns_rest_of_stream() {
        let config = PipelineConfig::default();
        let overlap = config.overlap();
        let mut pipeline = started(config.clone(), ScriptedEngine::transparent(shape(&config)));

        let input = sine(1000);
        let mut output = pipeline.process_block(&input).unwrap();
        output.extend(pipeline.flush().unwrap());

        assert_eq!(output.len(), input.len() + overlap);
        for j in overlap..output.len() {
            assert!((output[j] - input[j - overlap]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_flush_of_full_buffer_does_not_overflow() {
        let config = PipelineConfig { max_consecutive_overflows: 0, ..PipelineConfig::default() };
        let overlap = config.overlap();
        let mut pipeline = started(config.clone(), ScriptedEngine::transparent(shape(&config)));
        let t0 = Instant::now();

        // Fills the buffer exactly; any further admitted sample would trip the breaker.
        let input = sine(config.max_buffer_size - overlap);
        assert_eq!(pipeline.push_at(&input, t0).unwrap(), Outcome::Accepted);
        assert_eq!(pipeline.ingest().len(), pipeline.ingest().capacity());

        let output = pipeline.flush_at(t0).unwrap();
        assert_eq!(output.len(), input.len() + overlap);
        for j in overlap..output.len() {
            assert!((output[j] - input[j - overlap]).abs() < 1e-4);
        }

        let t = pipeline.telemetry();
        assert_eq!(t.overflow_events, 0);
        assert_eq!(t.circuit_breaker_trips, 0);
        assert_eq!(pipeline.ingest().consecutive_overflows(), 0);
        assert_eq!(pipeline.state(), PipelineState::Active);
    }

    #[test]
    fn test_overrun_trips_breaker_once() {
        let config = PipelineConfig::default();
        let max = config.max_consecutive_overflows as usize;
        let suspension = config.circuit_breaker_suspension;
        let mut pipeline = started(config.clone(), ScriptedEngine::unity(shape(&config)));
        let t0 = Instant::now();
        let block = vec![0.01f32; config.max_buffer_size / 2];

        assert_eq!(pipeline.push_at(&block, t0).unwrap(), Outcome::Accepted);
        for _ in 0..max {
            assert_eq!(pipeline.push_at(&block, t0).unwrap(), Outcome::Overflow);
        }
        assert_eq!(pipeline.push_at(&block, t0).unwrap(), Outcome::CircuitBreakerTripped(suspension));
        assert_eq!(pipeline.state(), PipelineState::Suspended(SuspendReason::CircuitBreaker));

        // Refused while suspended, and no second trip.
        let later = t0 + suspension / 2;
        assert!(pipeline.push_at(&block, later).unwrap().is_tripped());
        assert!(pipeline.drain().unwrap().is_empty());
        let t = pipeline.telemetry();
        assert_eq!(t.circuit_breaker_trips, 1);
        assert_eq!(t.overflow_events, max as u64 + 1);

        let resumed = t0 + suspension + Duration::from_millis(1);
        assert_eq!(pipeline.push_at(&block[..config.frame_size], resumed).unwrap(), Outcome::Accepted);
        assert_eq!(pipeline.state(), PipelineState::Active);
        assert_eq!(pipeline.drain().unwrap().len(), config.hop_size);
        assert_eq!(pipeline.telemetry().circuit_breaker_trips, 1);
    }

    #[test]
    fn test_failing_engine_passes_through_attenuated() {
        let config = PipelineConfig::default();
        let overlap = config.overlap();
        let engine = ScriptedEngine::failing(shape(&config), InferenceError::NumericFault("m".into()));
        let calls = engine.call_counter();
        let mut pipeline = started(config.clone(), engine);

        let input = sine(30 * config.hop_size);
        let mut output = Vec::new();
        let mut last_failures = 0;
        for block in input.chunks(config.hop_size) {
            output.extend(pipeline.process_block(block).unwrap());
            let failures = pipeline.telemetry().inference_failures;
            assert!(failures >= last_failures);
            last_failures = failures;
        }

        for j in overlap..output.len() {
            let expected = config.passthrough_attenuation * input[j - overlap];
            assert!((output[j] - expected).abs() < 1e-4);
        }
        let t = pipeline.telemetry();
        assert_eq!(t.passthrough_frames, 30);
        let threshold = config.max_inference_failures as u64 + 1;
        assert_eq!(t.inference_failures, threshold);
        assert_eq!(calls.load(Ordering::Relaxed), threshold);
        assert!(pipeline.orchestrator().is_degraded());
        assert_eq!(pipeline.state(), PipelineState::Active);
    }

    #[test]
    fn test_model_state_advances_only_on_success() {
        let config = PipelineConfig::default();
        let engine = ScriptedEngine::unity(shape(&config)).with_script([
            ScriptedStep::Respond(FilterCoefficients::unity(&shape(&config))),
            ScriptedStep::Fail(InferenceError::EngineUnavailable("busy".into())),
            ScriptedStep::WrongMaskLength,
        ]);
        let mut pipeline = started(config.clone(), engine);
        process_in_hops(&mut pipeline, &vec![0.0; 4 * config.hop_size]);

        let state = pipeline.orchestrator().model_state().unwrap();
        assert_eq!(state.get(ScriptedEngine::STATE_TENSOR).unwrap()[[0]], 2.0);
        assert_eq!(pipeline.telemetry().inference_failures, 2);
        assert!(!pipeline.orchestrator().is_degraded());
    }

    #[test]
    fn test_memory_pressure_applies_at_frame_boundary() {
        let config = PipelineConfig::default();
        let engine = ScriptedEngine::transparent(shape(&config));
        let calls = engine.call_counter();
        let mut pipeline = started(config.clone(), engine);
        let block = sine(config.hop_size);

        pipeline.process_block(&block).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        pipeline.set_memory_pressure(true);
        assert_eq!(pipeline.state(), PipelineState::Active);
        pipeline.process_block(&block).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Suspended(SuspendReason::MemoryPressure));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.telemetry().passthrough_frames, 1);

        pipeline.set_memory_pressure(false);
        pipeline.process_block(&block).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Active);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_stop_and_restart() {
        let config = PipelineConfig::default();
        let mut pipeline = Pipeline::new(config.clone()).unwrap();
        assert!(matches!(
            pipeline.process_block(&[0.0; 8]),
            Err(PipelineError::NotActive(PipelineState::Uninitialized))
        ));

        pipeline.start(Box::new(ScriptedEngine::unity(shape(&config)))).unwrap();
        assert!(matches!(
            pipeline.start(Box::new(ScriptedEngine::unity(shape(&config)))),
            Err(PipelineError::InvalidTransition { .. })
        ));
        process_in_hops(&mut pipeline, &sine(3 * config.hop_size));

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.orchestrator().model_state().is_none());
        assert!(pipeline.ingest().is_empty());
        assert!(matches!(pipeline.process_block(&[0.0; 8]), Err(PipelineError::NotActive(_))));

        pipeline.start(Box::new(ScriptedEngine::unity(shape(&config)))).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Active);
        let state = pipeline.orchestrator().model_state().unwrap();
        assert_eq!(state.get(ScriptedEngine::STATE_TENSOR).unwrap()[[0]], 0.0);
        assert_eq!(pipeline.process_block(&vec![0.0; config.hop_size]).unwrap().len(), config.hop_size);
    }

    #[test]
    fn test_invalid_samples_are_rejected() {
        let config = PipelineConfig::default();
        let mut pipeline = started(config.clone(), ScriptedEngine::unity(shape(&config)));
        let before = pipeline.ingest().len();

        let mut block = vec![0.1f32; 16];
        block[5] = f32::NAN;
        assert!(matches!(pipeline.process_block(&block), Err(PipelineError::InvalidSamples { index: 5, .. })));

        block[5] = config.amplitude_ceiling * 2.0;
        assert!(matches!(pipeline.push(&block), Err(PipelineError::InvalidSamples { index: 5, .. })));
        assert_eq!(pipeline.ingest().len(), before);
    }
}
