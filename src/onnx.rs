//! ONNX Runtime inference engine for DeepFilterNet-style streaming graphs.
//!
//! The graph is expected to take `feat_erb` `[1, 1, 1, NB_ERB]`, `feat_spec`
//! `[1, 2, 1, NB_DF]` (planar real/imaginary) and, for stateful exports, `h0`;
//! and to produce `m` (band mask), `coefs` (deep-filter taps), `lsnr` and `h1`.
//! Models exported with a time window larger than one frame are fed the newest
//! frame only and the last frame of each output is used.

use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::inference::{FilterCoefficients, InferenceEngine, InferenceError, ModelInput, ModelOutput, ModelShape, ModelState};

/// Name of the recurrent state input.
pub const STATE_INPUT: &str = "h0";
/// Name of the recurrent state output.
pub const STATE_OUTPUT: &str = "h1";

fn unavailable(e: ort::Error) -> InferenceError {
    InferenceError::EngineUnavailable(e.to_string())
}

/// Session options for [`OnnxEngine::from_file`].
#[derive(Debug, Clone, Copy)]
pub struct OnnxOptions {
    /// ONNX Runtime intra-op threads; `None` lets the runtime choose.
    /// Use 1-2 for real-time audio to keep latency jitter low.
    pub intra_threads: Option<usize>,
    /// Width of the recurrent state for stateful graphs (`emb_hidden_dim`).
    pub hidden_dim: usize,
}

impl Default for OnnxOptions {
    fn default() -> Self {
        Self { intra_threads: Some(1), hidden_dim: 256 }
    }
}

pub struct OnnxEngine {
    session: Session,
    shape: ModelShape,
    stateful: bool,
    hidden_dim: usize,
    name: String,
}

impl OnnxEngine {
    /// Load `path` with the execution providers enabled at build time.
    pub fn from_file(path: &Path, shape: ModelShape, options: OnnxOptions) -> Result<Self, InferenceError> {
        let mut builder = Session::builder()
            .map_err(unavailable)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(unavailable)?;

        if let Some(threads) = options.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(unavailable)?;
        }

        #[cfg(feature = "nnapi")]
        {
            use ort::execution_providers::NNAPIExecutionProvider;
            builder = builder
                .with_execution_providers([NNAPIExecutionProvider::default().build()])
                .map_err(unavailable)?;
            log::info!("NNAPI execution provider registered");
        }

        #[cfg(feature = "coreml")]
        {
            use ort::execution_providers::CoreMLExecutionProvider;
            builder = builder
                .with_execution_providers([CoreMLExecutionProvider::default().build()])
                .map_err(unavailable)?;
            log::info!("CoreML execution provider registered");
        }

        #[cfg(feature = "cuda")]
        {
            use ort::execution_providers::CUDAExecutionProvider;
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(unavailable)?;
            log::info!("CUDA execution provider registered");
        }

        let session = builder.commit_from_file(path).map_err(unavailable)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        Ok(Self::from_session(session, shape, options.hidden_dim, name))
    }

    /// Wrap an already configured session.
    pub fn from_session(session: Session, shape: ModelShape, hidden_dim: usize, name: impl Into<String>) -> Self {
        let stateful = session.inputs().iter().any(|i| i.name() == STATE_INPUT);
        let name = name.into();
        log::info!(
            "loaded ONNX model '{}' ({}, hidden dim {})",
            name,
            if stateful { "stateful" } else { "stateless" },
            hidden_dim
        );
        Self { session, shape, stateful, hidden_dim, name }
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// Copy the newest `len` values of an output, which may span several frames.
    fn last_frame(data: &[f32], len: usize, what: &str) -> Result<Vec<f32>, InferenceError> {
        if data.len() < len || len == 0 {
            return Err(InferenceError::ShapeMismatch {
                what: what.to_string(),
                expected: format!("at least {} values", len),
                got: data.len().to_string(),
            });
        }
        Ok(data[data.len() - len..].to_vec())
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn initial_state(&self) -> ModelState {
        if self.stateful {
            ModelState::empty().with_zeros(STATE_INPUT, &[1, 1, self.hidden_dim])
        } else {
            ModelState::empty()
        }
    }

    fn infer(&mut self, input: &ModelInput<'_>, state: &ModelState) -> Result<ModelOutput, InferenceError> {
        let nb_erb = self.shape.perceptual_bands;
        let nb_df = self.shape.df_bands;

        let erb_tensor = Tensor::from_array(([1usize, 1, 1, nb_erb], input.perceptual.to_vec())).map_err(unavailable)?;
        let mut spec = Vec::with_capacity(2 * nb_df);
        spec.extend(input.complex.iter().map(|c| c.re));
        spec.extend(input.complex.iter().map(|c| c.im));
        let spec_tensor = Tensor::from_array(([1usize, 2, 1, nb_df], spec)).map_err(unavailable)?;

        let outputs = if self.stateful {
            let h0 = state.get(STATE_INPUT).ok_or_else(|| InferenceError::ShapeMismatch {
                what: "model state".to_string(),
                expected: STATE_INPUT.to_string(),
                got: "no such tensor".to_string(),
            })?;
            let h0_tensor = Tensor::from_array(([1usize, 1, self.hidden_dim], h0.iter().copied().collect::<Vec<f32>>()))
                .map_err(unavailable)?;
            self.session
                .run(ort::inputs![
                    "feat_erb" => erb_tensor,
                    "feat_spec" => spec_tensor,
                    "h0" => h0_tensor,
                ])
                .map_err(unavailable)?
        } else {
            self.session
                .run(ort::inputs![
                    "feat_erb" => erb_tensor,
                    "feat_spec" => spec_tensor,
                ])
                .map_err(unavailable)?
        };

        let (_, mask_data) = outputs["m"].try_extract_tensor::<f32>().map_err(unavailable)?;
        let mask = Self::last_frame(mask_data, nb_erb, "m")?;
        let (_, coefs_data) = outputs["coefs"].try_extract_tensor::<f32>().map_err(unavailable)?;
        let fir = Self::last_frame(coefs_data, self.shape.fir_len(), "coefs")?;
        let (_, lsnr_data) = outputs["lsnr"].try_extract_tensor::<f32>().map_err(unavailable)?;
        let lsnr = lsnr_data.last().copied();

        let next_state = if self.stateful {
            let (_, h1_data) = outputs[STATE_OUTPUT].try_extract_tensor::<f32>().map_err(unavailable)?;
            let h1 = Self::last_frame(h1_data, self.hidden_dim, STATE_OUTPUT)?;
            let tensor = ArrayD::from_shape_vec(IxDyn(&[1, 1, self.hidden_dim]), h1).map_err(|e| {
                InferenceError::ShapeMismatch {
                    what: STATE_OUTPUT.to_string(),
                    expected: format!("[1, 1, {}]", self.hidden_dim),
                    got: e.to_string(),
                }
            })?;
            ModelState::empty().with_tensor(STATE_INPUT, tensor)
        } else {
            ModelState::empty()
        };

        Ok(ModelOutput { state: next_state, coefficients: FilterCoefficients { mask, fir }, lsnr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_frame_takes_newest_values() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(OnnxEngine::last_frame(&data, 2, "m").unwrap(), vec![5.0, 6.0]);
        assert!(matches!(
            OnnxEngine::last_frame(&data, 7, "m"),
            Err(InferenceError::ShapeMismatch { .. })
        ));
    }
}
