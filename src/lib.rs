//! # enhance-rt
//!
//! Real-time speech enhancement: a streaming spectral pipeline around a pluggable
//! neural inference engine.
//!
//! Incoming audio is cut into 50 % overlapping frames, transformed with a
//! Hann-windowed real FFT, summarized into perceptual (ERB band) and spectral
//! features, and handed to an inference engine. The engine predicts a per-band
//! gain mask plus a short complex deep-filter FIR for the low bins; those are
//! applied to the noisy spectrum and the result is resynthesized with
//! overlap-add.
//!
//! ## Quick Start
//!
//! Use [`Pipeline`] to process audio on the calling thread:
//!
//! ```ignore
//! use enhance_rt::{ModelShape, Pipeline, PipelineConfig, ScriptedEngine};
//!
//! let config = PipelineConfig::default();
//! let mut pipeline = Pipeline::new(config.clone())?;
//! pipeline.start(Box::new(ScriptedEngine::transparent(ModelShape::from_config(&config))))?;
//!
//! // Any block length (48kHz mono f32)
//! let enhanced = pipeline.process_block(&input_samples)?;
//! let rest = pipeline.flush()?;
//! ```
//!
//! ## API Levels
//!
//! - [`RealtimeSession`] - Threaded API for audio callbacks. `push` input from the
//!   capture callback, `pull` output from the playback callback; inference runs on
//!   a dedicated worker and neither call ever waits for it.
//!
//! - [`Pipeline`] - Synchronous streaming API. Handles buffering internally.
//!
//! - [`PipelineOrchestrator`] - Frame API. You feed `frame_size` frames and get
//!   `hop_size` samples back.
//!
//! ## Inference Engines
//!
//! Anything implementing [`InferenceEngine`] can drive the pipeline. The crate ships
//! [`ScriptedEngine`], a deterministic engine for tests and demos, and, with the
//! `onnx` feature, `onnx::OnnxEngine` for DeepFilterNet-style ONNX exports:
//!
//! ```toml
//! enhance-rt = { path = "...", features = ["onnx"] }
//!
//! # Hardware acceleration (implies onnx)
//! enhance-rt = { path = "...", features = ["cuda"] }   # NVIDIA
//! enhance-rt = { path = "...", features = ["coreml"] } # iOS/macOS
//! enhance-rt = { path = "...", features = ["nnapi"] }  # Android
//! ```
//!
//! ## Failure Handling
//!
//! Only caller mistakes are errors: malformed frames, non-finite or out-of-range
//! input samples, invalid configuration. Everything the stream itself can throw at
//! the pipeline is absorbed:
//!
//! - Input arriving faster than it is processed drops the oldest audio and fades
//!   the new audio in. Persistent overload opens a circuit breaker that refuses
//!   input for a while and then heals on its own.
//! - A failed inference emits the input, attenuated, for that frame. Too many
//!   failures in a row switch the model off until the next `start`.
//! - A reconstruction that produces NaN or Inf is replaced by the input spectrum.
//!
//! Counters for all of this are available through [`TelemetrySnapshot`].
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Configure any logger in your application, e.g.
//! `env_logger::init()`. Per-frame messages are only emitted at `debug`/`trace`.
//!
//! ## Thread Safety
//!
//! [`Pipeline`], [`PipelineOrchestrator`] and [`RealtimeSession`] are `Send`.
//! Separate instances share no state.

use thiserror::Error;

pub mod config;
pub mod features;
pub mod inference;
pub mod ingest;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod reconstruct;
pub mod session;
pub mod telemetry;
pub mod transform;

pub use config::{
    ConfigError, CrossfadeCurve, PipelineConfig, DEFAULT_DF_ORDER, DEFAULT_FRAME_SIZE, DEFAULT_NB_DF,
    DEFAULT_NB_ERB, DEFAULT_NORM_ALPHA, DEFAULT_SAMPLE_RATE,
};
pub use features::{ErbFilterbank, FeatureExtractor, FeatureSet, FeatureVector};
pub use inference::{
    FilterCoefficients, InferenceAdapter, InferenceEngine, InferenceError, ModelInput, ModelOutput, ModelShape,
    ModelState, ScriptedEngine, ScriptedStep,
};
pub use ingest::{IngestBuffer, IngestStats, Outcome};
pub use pipeline::{FrameOutcome, PassthroughReason, Pipeline, PipelineOrchestrator, PipelineState, SuspendReason};
pub use reconstruct::{Reconstruction, SpectralReconstructor};
pub use session::{CancelToken, RealtimeSession};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use transform::{FrameTransform, OverlapTail, SpectralFrame, TransformError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Inference engine error: {0}")]
    Inference(#[from] InferenceError),
    #[error("Invalid input sample {value} at index {index}")]
    InvalidSamples { index: usize, value: f32 },
    #[error("Pipeline is not running ({0:?})")]
    NotActive(PipelineState),
    #[error("Cannot {action} from state {from:?}")]
    InvalidTransition { from: PipelineState, action: &'static str },
    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// Compile-time check that the processing types can move to a worker thread.
fn _assert_send<T: Send>() {}
fn _assert_pipeline_is_send() {
    _assert_send::<Pipeline>();
    _assert_send::<PipelineOrchestrator>();
    _assert_send::<RealtimeSession>();
}
