//! Session configuration.
//!
//! Every value is fixed at session start. [`PipelineConfig::validate`] is run by
//! every constructor that consumes a config, so a component never sees
//! inconsistent sizes.
//!
//! Configs can be loaded from the same flat `key = value` INI layout DeepFilterNet
//! model folders ship as `config.ini`. Unknown keys are ignored, which lets a model's
//! own `config.ini` be fed in directly (`nb_erb`, `nb_df`, `df_order`, `fft_size`,
//! `hop_size`, `sr` and `norm_tau` are understood).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Default sample rate of DeepFilterNet models.
pub const DEFAULT_SAMPLE_RATE: usize = 48_000;
/// Default FFT size (20ms at 48kHz).
pub const DEFAULT_FRAME_SIZE: usize = 960;
/// Default number of ERB bands.
pub const DEFAULT_NB_ERB: usize = 32;
/// Default number of deep-filtered bins.
pub const DEFAULT_NB_DF: usize = 96;
/// Default deep filter order.
pub const DEFAULT_DF_ORDER: usize = 5;
/// Default normalization smoothing factor.
pub const DEFAULT_NORM_ALPHA: f32 = 0.99;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("could not parse `{key}` from {value:?}")]
    Parse { key: String, value: String },
    #[error("could not read config file: {0}")]
    Io(String),
}

/// Shape of the fade-in applied to samples admitted during a buffer overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeCurve {
    /// Gain ramps linearly from 0 to 1.
    #[default]
    Linear,
    /// `sin(π/2 · t)`: constant power against the dropped material.
    EqualPower,
}

impl CrossfadeCurve {
    /// Gain at normalized position `t ∈ [0, 1]`.
    #[inline]
    pub fn gain(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            CrossfadeCurve::Linear => t,
            CrossfadeCurve::EqualPower => (t * std::f32::consts::FRAC_PI_2).sin(),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "linear" => Some(CrossfadeCurve::Linear),
            "equal_power" | "equal-power" | "equalpower" => Some(CrossfadeCurve::EqualPower),
            _ => None,
        }
    }
}

/// All tunables of one pipeline session.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// FFT size in samples. Must be even.
    pub frame_size: usize,
    /// Samples advanced between frames. Always `frame_size / 2`.
    pub hop_size: usize,
    pub sample_rate: usize,
    /// Number of ERB bands the model's mask covers.
    pub perceptual_band_count: usize,
    /// Lowest bins refined by the deep filter.
    pub df_bands: usize,
    /// Deep filter order (frames of history per tap set).
    pub df_order: usize,
    /// Minimum number of FFT bins per ERB band.
    pub min_band_bins: usize,
    /// Capacity of the ingest buffer in samples.
    pub max_buffer_size: usize,
    pub max_consecutive_overflows: u32,
    pub circuit_breaker_suspension: Duration,
    /// Upper bound on any per-bin gain, mask or deep filter.
    pub max_gain: f32,
    /// Smoothing factor of the running feature statistics, in `(0, 1]`.
    pub normalization_alpha: f32,
    /// Largest accepted absolute sample value.
    pub amplitude_ceiling: f32,
    pub crossfade: CrossfadeCurve,
    /// Gain applied to passthrough audio when inference is bypassed.
    pub passthrough_attenuation: f32,
    /// Consecutive inference failures before the session degrades to passthrough.
    pub max_inference_failures: u32,
    /// Local SNR (dB) below which a frame is treated as pure noise.
    pub min_db_thresh: f32,
    /// Local SNR (dB) above which the band mask is skipped.
    pub max_db_erb_thresh: f32,
    /// Local SNR (dB) above which deep filtering is skipped.
    pub max_db_df_thresh: f32,
    /// Enhanced samples the realtime session buffers for playback.
    pub output_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            hop_size: DEFAULT_FRAME_SIZE / 2,
            sample_rate: DEFAULT_SAMPLE_RATE,
            perceptual_band_count: DEFAULT_NB_ERB,
            df_bands: DEFAULT_NB_DF,
            df_order: DEFAULT_DF_ORDER,
            min_band_bins: 2,
            max_buffer_size: DEFAULT_FRAME_SIZE * 10,
            max_consecutive_overflows: 8,
            circuit_breaker_suspension: Duration::from_millis(500),
            max_gain: 1.0,
            normalization_alpha: DEFAULT_NORM_ALPHA,
            amplitude_ceiling: 10.0,
            crossfade: CrossfadeCurve::Linear,
            passthrough_attenuation: 0.5,
            max_inference_failures: 16,
            min_db_thresh: -15.0,
            max_db_erb_thresh: 35.0,
            max_db_df_thresh: 35.0,
            output_queue_capacity: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl PipelineConfig {
    /// Config for a given FFT size, keeping every other default.
    pub fn with_frame_size(frame_size: usize) -> Self {
        Self {
            frame_size,
            hop_size: frame_size / 2,
            max_buffer_size: frame_size * 10,
            ..Self::default()
        }
    }

    /// Number of non-negative frequency bins: `frame_size / 2 + 1`.
    pub fn freq_size(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Samples kept between inverse transforms: `frame_size - hop_size`.
    pub fn overlap(&self) -> usize {
        self.frame_size - self.hop_size
    }

    /// Length of one frame's interleaved FIR kernel: `df_bands * df_order * 2`.
    pub fn fir_len(&self) -> usize {
        self.df_bands * self.df_order * 2
    }

    /// Wall-clock duration of one hop.
    pub fn hop_duration(&self) -> Duration {
        Duration::from_secs_f64(self.hop_size as f64 / self.sample_rate as f64)
    }

    /// Algorithmic delay of the transform in milliseconds.
    pub fn latency_ms(&self) -> f32 {
        self.overlap() as f32 / self.sample_rate as f32 * 1000.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { key, reason: reason.into() }
        }

        if self.frame_size < 4 || self.frame_size % 2 != 0 {
            return Err(invalid("frame_size", format!("{} is not an even size >= 4", self.frame_size)));
        }
        if self.hop_size * 2 != self.frame_size {
            return Err(invalid(
                "hop_size",
                format!("{} must be frame_size / 2 = {}", self.hop_size, self.frame_size / 2),
            ));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        let freq_size = self.freq_size();
        if self.perceptual_band_count == 0 || self.perceptual_band_count > freq_size {
            return Err(invalid(
                "perceptual_band_count",
                format!("{} not in 1..={}", self.perceptual_band_count, freq_size),
            ));
        }
        if self.min_band_bins == 0 || self.min_band_bins * self.perceptual_band_count > freq_size {
            return Err(invalid(
                "min_band_bins",
                format!(
                    "{} bands of at least {} bins do not fit into {} bins",
                    self.perceptual_band_count, self.min_band_bins, freq_size
                ),
            ));
        }
        if self.df_bands == 0 || self.df_bands > freq_size {
            return Err(invalid("df_bands", format!("{} not in 1..={}", self.df_bands, freq_size)));
        }
        if self.df_order == 0 {
            return Err(invalid("df_order", "must be at least 1"));
        }
        if self.max_buffer_size < self.frame_size {
            return Err(invalid(
                "max_buffer_size",
                format!("{} is smaller than one frame ({})", self.max_buffer_size, self.frame_size),
            ));
        }
        if !(self.max_gain.is_finite() && self.max_gain > 0.0) {
            return Err(invalid("max_gain", format!("{} must be finite and positive", self.max_gain)));
        }
        if !(self.normalization_alpha > 0.0 && self.normalization_alpha <= 1.0) {
            return Err(invalid(
                "normalization_alpha",
                format!("{} not in (0, 1]", self.normalization_alpha),
            ));
        }
        if !(self.amplitude_ceiling.is_finite() && self.amplitude_ceiling > 0.0) {
            return Err(invalid("amplitude_ceiling", "must be finite and positive"));
        }
        if !(0.0..=1.0).contains(&self.passthrough_attenuation) {
            return Err(invalid(
                "passthrough_attenuation",
                format!("{} not in [0, 1]", self.passthrough_attenuation),
            ));
        }
        if self.output_queue_capacity < self.hop_size {
            return Err(invalid("output_queue_capacity", "must hold at least one hop"));
        }
        Ok(())
    }

    /// Parse a config from INI text, starting from the defaults.
    pub fn from_ini_str(content: &str) -> Result<Self, ConfigError> {
        let params = parse_ini(content);
        let mut config = Self::default();

        if let Some(fft) = get_parsed::<usize>(&params, &["frame_size", "fft_size"])? {
            config.frame_size = fft;
            config.hop_size = fft / 2;
            config.max_buffer_size = config.max_buffer_size.max(fft);
        }
        if let Some(hop) = get_parsed(&params, &["hop_size"])? {
            config.hop_size = hop;
        }
        if let Some(sr) = get_parsed(&params, &["sample_rate", "sr"])? {
            config.sample_rate = sr;
        }
        if let Some(v) = get_parsed(&params, &["perceptual_band_count", "nb_erb"])? {
            config.perceptual_band_count = v;
        }
        if let Some(v) = get_parsed(&params, &["df_bands", "nb_df"])? {
            config.df_bands = v;
        }
        if let Some(v) = get_parsed(&params, &["df_order"])? {
            config.df_order = v;
        }
        if let Some(v) = get_parsed(&params, &["min_band_bins", "min_nb_erb_freqs"])? {
            config.min_band_bins = v;
        }
        if let Some(v) = get_parsed(&params, &["max_buffer_size"])? {
            config.max_buffer_size = v;
        }
        if let Some(v) = get_parsed(&params, &["max_consecutive_overflows"])? {
            config.max_consecutive_overflows = v;
        }
        if let Some(secs) = get_parsed::<f64>(&params, &["circuit_breaker_suspension_seconds"])? {
            if !(secs.is_finite() && secs >= 0.0) {
                return Err(ConfigError::Invalid {
                    key: "circuit_breaker_suspension_seconds",
                    reason: format!("{} is not a non-negative duration", secs),
                });
            }
            config.circuit_breaker_suspension = Duration::from_secs_f64(secs);
        }
        if let Some(v) = get_parsed(&params, &["max_gain"])? {
            config.max_gain = v;
        }
        if let Some(v) = get_parsed(&params, &["normalization_alpha"])? {
            config.normalization_alpha = v;
        } else if let Some(tau) = get_parsed::<f32>(&params, &["norm_tau"])? {
            config.normalization_alpha = norm_alpha_from_tau(tau, config.hop_size, config.sample_rate);
        }
        if let Some(v) = get_parsed(&params, &["amplitude_ceiling"])? {
            config.amplitude_ceiling = v;
        }
        if let Some(raw) = params.get("crossfade") {
            config.crossfade = CrossfadeCurve::parse(raw).ok_or_else(|| ConfigError::Parse {
                key: "crossfade".to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(v) = get_parsed(&params, &["passthrough_attenuation"])? {
            config.passthrough_attenuation = v;
        }
        if let Some(v) = get_parsed(&params, &["max_inference_failures"])? {
            config.max_inference_failures = v;
        }
        if let Some(v) = get_parsed(&params, &["min_db_thresh"])? {
            config.min_db_thresh = v;
        }
        if let Some(v) = get_parsed(&params, &["max_db_erb_thresh"])? {
            config.max_db_erb_thresh = v;
        }
        if let Some(v) = get_parsed(&params, &["max_db_df_thresh"])? {
            config.max_db_df_thresh = v;
        }
        if let Some(v) = get_parsed(&params, &["output_queue_capacity"])? {
            config.output_queue_capacity = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config from an INI file (for example a model folder's `config.ini`).
    pub fn from_ini_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_ini_str(&content)
    }
}

/// Convert a normalization time constant to a per-hop smoothing factor.
///
/// Rounds like DeepFilterNet's python `get_norm_alpha`: the fewest decimals that
/// keep the value strictly below 1.
pub fn norm_alpha_from_tau(tau: f32, hop_size: usize, sample_rate: usize) -> f32 {
    if !(tau.is_finite() && tau > 0.0) || sample_rate == 0 {
        return DEFAULT_NORM_ALPHA;
    }
    let dt = hop_size as f32 / sample_rate as f32;
    let a = f32::exp(-dt / tau);
    let mut precision: i32 = 3;
    let mut rounded = 1.0f32;
    while rounded >= 1.0 && precision < 10 {
        let scale = 10f32.powi(precision);
        rounded = (a * scale).round() / scale;
        precision += 1;
    }
    if rounded >= 1.0 || rounded <= 0.0 {
        DEFAULT_NORM_ALPHA
    } else {
        rounded
    }
}

/// Simple INI parser: flat `key = value` pairs, sections and `#`/`;` comments ignored.
fn parse_ini(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') || line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    map
}

/// First of `keys` present in `params`, parsed as `T`.
fn get_parsed<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    keys: &[&str],
) -> Result<Option<T>, ConfigError> {
    for key in keys {
        if let Some(raw) = params.get(*key) {
            return raw.parse::<T>().map(Some).map_err(|_| ConfigError::Parse {
                key: (*key).to_string(),
                value: raw.clone(),
            });
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.freq_size(), 481);
        assert_eq!(config.overlap(), 480);
        assert_eq!(config.fir_len(), 96 * 5 * 2);
        assert!((config.latency_ms() - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_hop_not_half_frame() {
        let config = PipelineConfig { hop_size: 240, ..PipelineConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { key: "hop_size", .. })));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let base = PipelineConfig::default();
        let cases = [
            PipelineConfig { normalization_alpha: 0.0, ..base.clone() },
            PipelineConfig { normalization_alpha: 1.5, ..base.clone() },
            PipelineConfig { max_gain: f32::NAN, ..base.clone() },
            PipelineConfig { df_bands: 1000, ..base.clone() },
            PipelineConfig { df_order: 0, ..base.clone() },
            PipelineConfig { max_buffer_size: 100, ..base.clone() },
            PipelineConfig { passthrough_attenuation: 2.0, ..base.clone() },
            PipelineConfig { perceptual_band_count: 300, ..base.clone() },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }
    }

    #[test]
    fn test_from_ini_model_config() {
        let ini = "\
[df]
sr = 48000
fft_size = 960
hop_size = 480
nb_erb = 32
nb_df = 96
df_order = 5
norm_tau = 1
# comment
[pipeline]
max_consecutive_overflows = 4
circuit_breaker_suspension_seconds = 0.25
crossfade = equal_power
";
        let config = PipelineConfig::from_ini_str(ini).unwrap();
        assert_eq!(config.frame_size, 960);
        assert_eq!(config.max_consecutive_overflows, 4);
        assert_eq!(config.circuit_breaker_suspension, Duration::from_millis(250));
        assert_eq!(config.crossfade, CrossfadeCurve::EqualPower);
        // exp(-0.01) = 0.99005 -> rounded to 3 decimals
        assert!((config.normalization_alpha - 0.99).abs() < 1e-6);
    }

    #[test]
    fn test_from_ini_parse_error() {
        let err = PipelineConfig::from_ini_str("max_gain = loud").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_crossfade_curves() {
        assert_eq!(CrossfadeCurve::Linear.gain(0.0), 0.0);
        assert_eq!(CrossfadeCurve::Linear.gain(0.5), 0.5);
        assert!((CrossfadeCurve::EqualPower.gain(1.0) - 1.0).abs() < 1e-6);
        assert!(CrossfadeCurve::EqualPower.gain(0.5) > 0.5);
    }
}
