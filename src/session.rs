//! Threaded real-time session.
//!
//! Three parties share a session:
//!
//! ```text
//!   audio in ──push()──► [Mutex<IngestBuffer>] ──next_frame──► worker thread
//!                                                             (features, inference,
//!                                                              reconstruction)
//!   audio out ◄──pull()── [ArrayQueue<f32>] ◄──────────────────────┘
//! ```
//!
//! The producer only ever holds the ingest lock for one `enqueue` and never waits
//! for the worker; the worker releases the lock before running inference. Output is
//! a bounded lock-free queue: when the consumer falls behind, the oldest samples are
//! dropped, and when the worker falls behind, `pull` fills silence.
//!
//! The engine is created on the worker thread by a loader closure, so a slow model
//! load never blocks the caller and can be cancelled through a [`CancelToken`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::inference::{InferenceEngine, InferenceError};
use crate::ingest::{IngestBuffer, Outcome};
use crate::pipeline::{validate_samples, PipelineOrchestrator, PipelineState, SuspendReason};
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use crate::{PipelineError, Result};

/// Cooperative cancellation flag, cloned into the engine loader.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

fn encode_state(state: PipelineState) -> u8 {
    match state {
        PipelineState::Uninitialized => 0,
        PipelineState::Active => 1,
        PipelineState::Suspended(SuspendReason::MemoryPressure) => 2,
        PipelineState::Suspended(SuspendReason::CircuitBreaker) => 3,
        PipelineState::Stopped => 4,
    }
}

fn decode_state(raw: u8) -> PipelineState {
    match raw {
        0 => PipelineState::Uninitialized,
        1 => PipelineState::Active,
        2 => PipelineState::Suspended(SuspendReason::MemoryPressure),
        3 => PipelineState::Suspended(SuspendReason::CircuitBreaker),
        _ => PipelineState::Stopped,
    }
}

struct Shared {
    ingest: Mutex<IngestBuffer>,
    output: ArrayQueue<f32>,
    telemetry: Arc<Telemetry>,
    memory_pressure: Arc<AtomicBool>,
    state: AtomicU8,
    degraded: AtomicBool,
}

impl Shared {
    fn publish(&self, orchestrator: &PipelineOrchestrator) {
        self.state.store(encode_state(orchestrator.state()), Ordering::Release);
        self.degraded.store(orchestrator.is_degraded(), Ordering::Release);
    }

    fn state(&self) -> PipelineState {
        decode_state(self.state.load(Ordering::Acquire))
    }
}

/// Handle to a running session. Dropping it stops the worker.
pub struct RealtimeSession {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    amplitude_ceiling: f32,
}

impl RealtimeSession {
    /// Spawn the worker thread and load the engine on it.
    ///
    /// The session reports [`PipelineState::Uninitialized`] until `loader` returns,
    /// then `Active`, or `Stopped` if loading failed or was cancelled.
    pub fn spawn<F>(config: PipelineConfig, loader: F) -> Result<Self>
    where
        F: FnOnce(&CancelToken) -> std::result::Result<Box<dyn InferenceEngine>, InferenceError> + Send + 'static,
    {
        let telemetry = Arc::new(Telemetry::new());
        let orchestrator = PipelineOrchestrator::with_telemetry(config.clone(), Arc::clone(&telemetry))?;
        let shared = Arc::new(Shared {
            ingest: Mutex::new(IngestBuffer::new(&config)),
            output: ArrayQueue::new(config.output_queue_capacity),
            telemetry,
            memory_pressure: orchestrator.memory_pressure_flag(),
            state: AtomicU8::new(encode_state(PipelineState::Uninitialized)),
            degraded: AtomicBool::new(false),
        });
        // One pending wake-up is enough; the worker drains every ready frame.
        let (wake_tx, wake_rx) = crossbeam::channel::bounded(1);
        let cancel = CancelToken::new();

        let worker = Worker {
            shared: Arc::clone(&shared),
            wake_rx,
            cancel: cancel.clone(),
            frame: vec![0.0; config.frame_size],
            hop: vec![0.0; config.hop_size],
            idle_wait: config.hop_duration(),
            orchestrator,
        };
        let handle = thread::Builder::new()
            .name("enhance-worker".into())
            .spawn(move || worker.run(loader))
            .map_err(|e| PipelineError::Worker(format!("failed to spawn worker thread: {}", e)))?;

        Ok(Self {
            shared,
            wake_tx,
            cancel,
            worker: Some(handle),
            amplitude_ceiling: config.amplitude_ceiling,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.shared.telemetry.snapshot()
    }

    /// Token that aborts engine loading and, afterwards, the session.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request shutdown without waiting for the worker.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.wake_tx.try_send(());
    }

    /// Takes effect at the worker's next frame boundary.
    pub fn set_memory_pressure(&self, pressured: bool) {
        self.shared.memory_pressure.store(pressured, Ordering::Release);
    }

    /// Block until the engine is loaded, polling every millisecond.
    pub fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state();
            if state.is_running() {
                return Ok(());
            }
            if state == PipelineState::Stopped || Instant::now() >= deadline {
                return Err(PipelineError::NotActive(state));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Hand a block of input to the worker. Never blocks on processing.
    pub fn push(&self, block: &[f32]) -> Result<Outcome> {
        let state = self.state();
        if !state.is_running() {
            return Err(PipelineError::NotActive(state));
        }
        validate_samples(block, self.amplitude_ceiling)?;
        let outcome = self.shared.ingest.lock().enqueue(block);
        let _ = self.wake_tx.try_send(());
        Ok(outcome)
    }

    /// Fill `out` with enhanced samples; missing samples are zeroed.
    ///
    /// Returns how many samples came from the pipeline.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let mut filled = 0;
        for slot in out.iter_mut() {
            match self.shared.output.pop() {
                Some(s) => {
                    *slot = s;
                    filled += 1;
                }
                None => break,
            }
        }
        out[filled..].fill(0.0);
        if filled < out.len() && self.state().is_running() {
            self.shared.telemetry.record_underrun(out.len() - filled);
        }
        filled
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        self.cancel();
        handle.join().map_err(|_| PipelineError::Worker("worker thread panicked".to_string()))
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("session shutdown: {}", e);
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    orchestrator: PipelineOrchestrator,
    wake_rx: Receiver<()>,
    cancel: CancelToken,
    frame: Vec<f32>,
    hop: Vec<f32>,
    idle_wait: Duration,
}

impl Worker {
    fn run<F>(mut self, loader: F)
    where
        F: FnOnce(&CancelToken) -> std::result::Result<Box<dyn InferenceEngine>, InferenceError>,
    {
        let engine = match loader(&self.cancel) {
            Ok(engine) => engine,
            Err(e) => {
                log::error!("failed to load inference engine: {}", e);
                self.finish();
                return;
            }
        };
        if self.cancel.is_cancelled() {
            log::info!("session cancelled during initialization");
            self.finish();
            return;
        }
        if let Err(e) = self.orchestrator.start(engine) {
            log::error!("failed to start pipeline: {}", e);
            self.finish();
            return;
        }
        {
            let mut ingest = self.shared.ingest.lock();
            ingest.reset();
            ingest.prime(self.orchestrator.config().overlap());
        }
        self.shared.publish(&self.orchestrator);

        while !self.cancel.is_cancelled() {
            let (ready, stats, breaker_open) = {
                let mut ingest = self.shared.ingest.lock();
                let ready = ingest.next_frame_into(&mut self.frame);
                (ready, ingest.stats(), ingest.is_suspended_at(Instant::now()))
            };
            self.orchestrator.observe_ingest(&stats, breaker_open);

            if ready {
                if let Err(e) = self.orchestrator.process_frame(&self.frame, &mut self.hop) {
                    log::error!("frame processing failed, stopping session: {}", e);
                    break;
                }
                self.deliver();
                self.shared.publish(&self.orchestrator);
                continue;
            }

            self.shared.publish(&self.orchestrator);
            match self.wake_rx.recv_timeout(self.idle_wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.finish();
    }

    fn deliver(&self) {
        let mut dropped = 0;
        for &s in &self.hop {
            if self.shared.output.force_push(s).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.shared.telemetry.record_dropped_output(dropped);
        }
    }

    fn finish(&mut self) {
        self.orchestrator.stop();
        self.shared.ingest.lock().reset();
        self.shared.publish(&self.orchestrator);
        log::info!("session worker exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ModelShape, ScriptedEngine};
    use std::f32::consts::PI;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn transparent_loader(
        config: &PipelineConfig,
    ) -> impl FnOnce(&CancelToken) -> std::result::Result<Box<dyn InferenceEngine>, InferenceError> + Send + 'static
    {
        let shape = ModelShape::from_config(config);
        move |_: &CancelToken| Ok(Box::new(ScriptedEngine::transparent(shape)) as Box<dyn InferenceEngine>)
    }

    fn collect(session: &RealtimeSession, target: usize) -> Vec<f32> {
        let deadline = Instant::now() + TIMEOUT;
        let mut out = Vec::with_capacity(target);
        let mut buf = vec![0.0f32; 256];
        while out.len() < target && Instant::now() < deadline {
            let n = session.pull(&mut buf);
            out.extend_from_slice(&buf[..n]);
            if n == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        out
    }

    #[test]
    fn test_session_reproduces_input() {
        let config = PipelineConfig::default();
        let session = RealtimeSession::spawn(config.clone(), transparent_loader(&config)).unwrap();
        session.wait_until_running(TIMEOUT).unwrap();

        let input: Vec<f32> = (0..10 * config.hop_size)
            .map(|i| 0.25 * (2.0 * PI * 300.0 * i as f32 / 48_000.0).sin())
            .collect();
        for block in input.chunks(config.hop_size) {
            session.push(block).unwrap();
        }

        let output = collect(&session, input.len());
        assert_eq!(output.len(), input.len());
        let overlap = config.overlap();
        for j in overlap..output.len() {
            assert!((output[j] - input[j - overlap]).abs() < 1e-4, "sample {}", j);
        }
        assert_eq!(session.telemetry().frames_processed, 10);
        session.stop().unwrap();
    }

    #[test]
    fn test_cancel_during_initialization() {
        let config = PipelineConfig::default();
        let shape = ModelShape::from_config(&config);
        let session = RealtimeSession::spawn(config, move |cancel: &CancelToken| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(Box::new(ScriptedEngine::unity(shape)) as Box<dyn InferenceEngine>)
        })
        .unwrap();

        assert_eq!(session.state(), PipelineState::Uninitialized);
        assert!(matches!(session.push(&[0.0; 16]), Err(PipelineError::NotActive(_))));
        session.cancel();
        assert!(session.wait_until_running(TIMEOUT).is_err());
        assert_eq!(session.state(), PipelineState::Stopped);
        session.stop().unwrap();
    }

    #[test]
    fn test_loader_failure_stops_session() {
        let config = PipelineConfig::default();
        let session = RealtimeSession::spawn(config, |_: &CancelToken| {
            Err(InferenceError::EngineUnavailable("no model".into()))
        })
        .unwrap();
        assert!(matches!(
            session.wait_until_running(TIMEOUT),
            Err(PipelineError::NotActive(PipelineState::Stopped))
        ));
    }

    #[test]
    fn test_pull_underrun_fills_silence() {
        let config = PipelineConfig::default();
        let session = RealtimeSession::spawn(config.clone(), transparent_loader(&config)).unwrap();
        session.wait_until_running(TIMEOUT).unwrap();

        let mut out = [1.0f32; 64];
        assert_eq!(session.pull(&mut out), 0);
        assert!(out.iter().all(|&x| x == 0.0));
        assert_eq!(session.telemetry().underrun_samples, 64);
    }

    #[test]
    fn test_memory_pressure_passes_through() {
        let config = PipelineConfig::default();
        let session = RealtimeSession::spawn(config.clone(), transparent_loader(&config)).unwrap();
        session.wait_until_running(TIMEOUT).unwrap();
        session.set_memory_pressure(true);

        for _ in 0..4 {
            session.push(&vec![0.1; config.hop_size]).unwrap();
        }
        collect(&session, 4 * config.hop_size);
        assert_eq!(session.state(), PipelineState::Suspended(SuspendReason::MemoryPressure));
        assert_eq!(session.telemetry().passthrough_frames, 4);
        session.stop().unwrap();
    }

    #[test]
    fn test_push_rejects_invalid_samples() {
        let config = PipelineConfig::default();
        let session = RealtimeSession::spawn(config.clone(), transparent_loader(&config)).unwrap();
        session.wait_until_running(TIMEOUT).unwrap();
        assert!(matches!(
            session.push(&[0.0, f32::INFINITY]),
            Err(PipelineError::InvalidSamples { index: 1, .. })
        ));
    }
}
