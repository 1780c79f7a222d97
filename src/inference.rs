//! Boundary to the external inference engine.
//!
//! The model itself is a black box behind [`InferenceEngine`]: features and the
//! previous recurrent state go in, a new state plus filter coefficients come out.
//! [`InferenceAdapter`] wraps an engine and owns nothing but the contract checks:
//! input and output shapes, state layout, and finiteness. The previous
//! [`ModelState`] is only ever lent out immutably, so a failing engine cannot leave
//! it half-updated.
//!
//! [`ScriptedEngine`] is a deterministic engine for tests and demos. The ONNX Runtime
//! engine lives in [`crate::onnx`] behind the `onnx` feature.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex32;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::features::FeatureVector;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("shape mismatch in {what}: expected {expected}, got {got}")]
    ShapeMismatch { what: String, expected: String, got: String },
    #[error("non-finite values in {0}")]
    NumericFault(String),
    #[error("inference engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl InferenceError {
    fn shape(what: &str, expected: impl ToString, got: impl ToString) -> Self {
        InferenceError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

/// Recurrent model state: named tensors, replaced as a whole after every frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelState {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ModelState {
    /// State of a stateless model.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_tensor(mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Zero-filled tensor of `shape` under `name`.
    pub fn with_zeros(self, name: impl Into<String>, shape: &[usize]) -> Self {
        self.with_tensor(name, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.tensors.values().all(|t| t.iter().all(|v| v.is_finite()))
    }

    /// Check that `next` has the same tensor names and shapes as `self`.
    fn check_layout(&self, next: &ModelState) -> Result<(), InferenceError> {
        let names = |s: &ModelState| s.tensors.keys().cloned().collect::<Vec<_>>().join(",");
        if self.tensors.len() != next.tensors.len() || !self.tensors.keys().eq(next.tensors.keys()) {
            return Err(InferenceError::shape("model state tensors", names(self), names(next)));
        }
        for (name, tensor) in &self.tensors {
            if let Some(other) = next.tensors.get(name) {
                if tensor.shape() != other.shape() {
                    return Err(InferenceError::shape(
                        &format!("model state `{}`", name),
                        format!("{:?}", tensor.shape()),
                        format!("{:?}", other.shape()),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Filter predicted for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCoefficients {
    /// One gain per perceptual band.
    pub mask: Vec<f32>,
    /// Complex taps, `[bin][tap][re, im]` flattened; tap 0 weights the oldest frame.
    pub fir: Vec<f32>,
}

impl FilterCoefficients {
    /// Unity mask, zero FIR.
    pub fn unity(shape: &ModelShape) -> Self {
        Self { mask: vec![1.0; shape.perceptual_bands], fir: vec![0.0; shape.fir_len()] }
    }

    /// Unity mask and an FIR that passes the newest frame through unchanged.
    pub fn identity(shape: &ModelShape) -> Self {
        let mut coefs = Self::unity(shape);
        let newest = shape.df_order - 1;
        for bin in 0..shape.df_bands {
            coefs.fir[(bin * shape.df_order + newest) * 2] = 1.0;
        }
        coefs
    }

    /// Complex tap `tap` of `bin`.
    #[inline]
    pub fn tap(&self, df_order: usize, bin: usize, tap: usize) -> Complex32 {
        let base = (bin * df_order + tap) * 2;
        Complex32::new(self.fir[base], self.fir[base + 1])
    }

    pub fn is_finite(&self) -> bool {
        self.mask.iter().chain(self.fir.iter()).all(|v| v.is_finite())
    }
}

/// Sizes the engine must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub perceptual_bands: usize,
    pub df_bands: usize,
    pub df_order: usize,
}

impl ModelShape {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            perceptual_bands: config.perceptual_band_count,
            df_bands: config.df_bands,
            df_order: config.df_order,
        }
    }

    pub fn fir_len(&self) -> usize {
        self.df_bands * self.df_order * 2
    }
}

/// Features of one frame as handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct ModelInput<'a> {
    pub perceptual: &'a FeatureVector,
    pub spectral: &'a FeatureVector,
    /// Unit-normalized low bins, for engines that take complex input.
    pub complex: &'a [Complex32],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub state: ModelState,
    pub coefficients: FilterCoefficients,
    /// Local SNR estimate in dB, if the model produces one.
    pub lsnr: Option<f32>,
}

/// An inference engine: tensors in, tensors out.
///
/// Implementations are driven from a single worker thread, one frame at a time,
/// in stream order.
pub trait InferenceEngine: Send {
    fn name(&self) -> &str;

    /// Recurrent state for the first frame of a session.
    fn initial_state(&self) -> ModelState;

    /// Run one frame. Must not keep references to `state`.
    fn infer(&mut self, input: &ModelInput<'_>, state: &ModelState) -> Result<ModelOutput, InferenceError>;
}

/// Contract checks around an [`InferenceEngine`].
pub struct InferenceAdapter {
    engine: Box<dyn InferenceEngine>,
    shape: ModelShape,
}

impl InferenceAdapter {
    pub fn new(engine: Box<dyn InferenceEngine>, shape: ModelShape) -> Self {
        Self { engine, shape }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    pub fn initial_state(&self) -> Result<ModelState, InferenceError> {
        let state = self.engine.initial_state();
        if !state.is_finite() {
            return Err(InferenceError::NumericFault("initial model state".to_string()));
        }
        Ok(state)
    }

    /// Run the engine on one frame and validate everything it returns.
    pub fn infer(&mut self, input: &ModelInput<'_>, state: &ModelState) -> Result<ModelOutput, InferenceError> {
        let shape = self.shape;
        if input.perceptual.len() != shape.perceptual_bands {
            return Err(InferenceError::shape("perceptual features", shape.perceptual_bands, input.perceptual.len()));
        }
        if input.spectral.len() != shape.df_bands {
            return Err(InferenceError::shape("spectral features", shape.df_bands, input.spectral.len()));
        }
        if input.complex.len() != shape.df_bands {
            return Err(InferenceError::shape("complex features", shape.df_bands, input.complex.len()));
        }

        let output = self.engine.infer(input, state)?;

        if output.coefficients.mask.len() != shape.perceptual_bands {
            return Err(InferenceError::shape("mask", shape.perceptual_bands, output.coefficients.mask.len()));
        }
        if output.coefficients.fir.len() != shape.fir_len() {
            return Err(InferenceError::shape("deep filter coefficients", shape.fir_len(), output.coefficients.fir.len()));
        }
        state.check_layout(&output.state)?;
        if !output.coefficients.is_finite() {
            return Err(InferenceError::NumericFault("filter coefficients".to_string()));
        }
        if !output.state.is_finite() {
            return Err(InferenceError::NumericFault("model state".to_string()));
        }
        if output.lsnr.is_some_and(|l| !l.is_finite()) {
            return Err(InferenceError::NumericFault("lsnr".to_string()));
        }
        Ok(output)
    }
}

// ─────────────────────────── ScriptedEngine ───────────────────────────

/// What a [`ScriptedEngine`] does for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedStep {
    /// Return these coefficients (and no lsnr).
    Respond(FilterCoefficients),
    /// Return these coefficients with a local SNR estimate.
    RespondWithLsnr(FilterCoefficients, f32),
    /// Fail with this error.
    Fail(InferenceError),
    /// Return a mask with the wrong number of bands.
    WrongMaskLength,
    /// Return a NaN in the mask.
    NonFinite,
}

/// Deterministic engine returning canned outputs.
///
/// Its state is a single `frames` tensor counting successful calls, which makes
/// state hand-over observable from tests.
pub struct ScriptedEngine {
    shape: ModelShape,
    script: VecDeque<ScriptedStep>,
    fallback: ScriptedStep,
    calls: Arc<AtomicU64>,
}

impl ScriptedEngine {
    /// Name of the state tensor.
    pub const STATE_TENSOR: &'static str = "frames";

    /// Runs `fallback` for every call once the script is exhausted.
    pub fn new(shape: ModelShape, fallback: ScriptedStep) -> Self {
        Self { shape, script: VecDeque::new(), fallback, calls: Arc::new(AtomicU64::new(0)) }
    }

    /// Unity mask and zero FIR for every frame.
    pub fn unity(shape: ModelShape) -> Self {
        Self::new(shape, ScriptedStep::Respond(FilterCoefficients::unity(&shape)))
    }

    /// Coefficients that leave the spectrum untouched.
    pub fn transparent(shape: ModelShape) -> Self {
        Self::new(shape, ScriptedStep::Respond(FilterCoefficients::identity(&shape)))
    }

    /// Fails every call with `error`.
    pub fn failing(shape: ModelShape, error: InferenceError) -> Self {
        Self::new(shape, ScriptedStep::Fail(error))
    }

    /// Queue steps that run before the fallback.
    pub fn with_script(mut self, steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        self.script.extend(steps);
        self
    }

    /// Shared counter of `infer` calls; stays readable after the engine is moved.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.calls)
    }

    fn next_state(state: &ModelState) -> ModelState {
        let mut next = state.clone();
        if let Some(t) = state.get(Self::STATE_TENSOR) {
            next.insert(Self::STATE_TENSOR, t.mapv(|v| v + 1.0));
        }
        next
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn initial_state(&self) -> ModelState {
        ModelState::empty().with_zeros(Self::STATE_TENSOR, &[1])
    }

    fn infer(&mut self, _input: &ModelInput<'_>, state: &ModelState) -> Result<ModelOutput, InferenceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let step = self.script.pop_front().unwrap_or_else(|| self.fallback.clone());
        let (coefficients, lsnr) = match step {
            ScriptedStep::Respond(c) => (c, None),
            ScriptedStep::RespondWithLsnr(c, lsnr) => (c, Some(lsnr)),
            ScriptedStep::Fail(e) => return Err(e),
            ScriptedStep::WrongMaskLength => {
                let mut c = FilterCoefficients::unity(&self.shape);
                c.mask.push(1.0);
                (c, None)
            }
            ScriptedStep::NonFinite => {
                let mut c = FilterCoefficients::unity(&self.shape);
                c.mask[0] = f32::NAN;
                (c, None)
            }
        };
        Ok(ModelOutput { state: Self::next_state(state), coefficients, lsnr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ModelShape {
        ModelShape { perceptual_bands: 4, df_bands: 3, df_order: 2 }
    }

    fn features(shape: &ModelShape) -> (FeatureVector, FeatureVector, Vec<Complex32>) {
        (
            FeatureVector::zeros(shape.perceptual_bands),
            FeatureVector::zeros(shape.df_bands),
            vec![Complex32::new(0.0, 0.0); shape.df_bands],
        )
    }

    fn run(adapter: &mut InferenceAdapter, state: &ModelState) -> Result<ModelOutput, InferenceError> {
        let (p, s, c) = features(&adapter.shape());
        adapter.infer(&ModelInput { perceptual: &p, spectral: &s, complex: &c }, state)
    }

    #[test]
    fn test_identity_fir_layout() {
        let c = FilterCoefficients::identity(&shape());
        assert_eq!(c.fir.len(), 3 * 2 * 2);
        for bin in 0..3 {
            assert_eq!(c.tap(2, bin, 0), Complex32::new(0.0, 0.0));
            assert_eq!(c.tap(2, bin, 1), Complex32::new(1.0, 0.0));
        }
    }

    #[test]
    fn test_state_is_replaced_not_mutated() {
        let mut adapter = InferenceAdapter::new(Box::new(ScriptedEngine::unity(shape())), shape());
        let state = adapter.initial_state().unwrap();
        let out = run(&mut adapter, &state).unwrap();
        assert_eq!(state.get("frames").unwrap()[[0]], 0.0);
        assert_eq!(out.state.get("frames").unwrap()[[0]], 1.0);
    }

    #[test]
    fn test_surfaces_engine_failures() {
        let engine = ScriptedEngine::unity(shape()).with_script([
            ScriptedStep::Fail(InferenceError::EngineUnavailable("gpu lost".into())),
            ScriptedStep::WrongMaskLength,
            ScriptedStep::NonFinite,
        ]);
        let calls = engine.call_counter();
        let mut adapter = InferenceAdapter::new(Box::new(engine), shape());
        let state = adapter.initial_state().unwrap();

        assert!(matches!(run(&mut adapter, &state), Err(InferenceError::EngineUnavailable(_))));
        assert!(matches!(run(&mut adapter, &state), Err(InferenceError::ShapeMismatch { .. })));
        assert!(matches!(run(&mut adapter, &state), Err(InferenceError::NumericFault(_))));
        assert!(run(&mut adapter, &state).is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_rejects_wrong_input_shape() {
        let mut adapter = InferenceAdapter::new(Box::new(ScriptedEngine::unity(shape())), shape());
        let state = adapter.initial_state().unwrap();
        let p = FeatureVector::zeros(5);
        let s = FeatureVector::zeros(3);
        let c = vec![Complex32::new(0.0, 0.0); 3];
        let err = adapter.infer(&ModelInput { perceptual: &p, spectral: &s, complex: &c }, &state);
        assert!(matches!(err, Err(InferenceError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_rejects_state_layout_change() {
        struct Forgetful;
        impl InferenceEngine for Forgetful {
            fn name(&self) -> &str {
                "forgetful"
            }
            fn initial_state(&self) -> ModelState {
                ModelState::empty().with_zeros("h0", &[1, 1, 8])
            }
            fn infer(&mut self, _: &ModelInput<'_>, _: &ModelState) -> Result<ModelOutput, InferenceError> {
                Ok(ModelOutput {
                    state: ModelState::empty().with_zeros("h0", &[1, 1, 4]),
                    coefficients: FilterCoefficients::unity(&shape()),
                    lsnr: None,
                })
            }
        }

        let mut adapter = InferenceAdapter::new(Box::new(Forgetful), shape());
        let state = adapter.initial_state().unwrap();
        assert!(matches!(run(&mut adapter, &state), Err(InferenceError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_rejects_non_finite_lsnr() {
        let engine = ScriptedEngine::new(
            shape(),
            ScriptedStep::RespondWithLsnr(FilterCoefficients::unity(&shape()), f32::INFINITY),
        );
        let mut adapter = InferenceAdapter::new(Box::new(engine), shape());
        let state = adapter.initial_state().unwrap();
        assert!(matches!(run(&mut adapter, &state), Err(InferenceError::NumericFault(_))));
    }
}
