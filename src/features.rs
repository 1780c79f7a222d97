//! Per-frame model features.
//!
//! Two feature sets feed the model: a perceptual one (ERB band energies, log
//! compressed, normalized with exponentially-weighted running mean/variance) and a
//! spectral one (log power of the lowest `df_bands` bins, normalized the same way).
//! A third, complex unit-normalized view of the same low bins is what
//! DeepFilterNet-style graphs take as their `feat_spec` input.
//!
//! Running statistics are the only state carried between frames. The `extract_*`
//! calls take `&mut self` and return freshly owned values; the worker path uses
//! [`FeatureExtractor::extract_into`] with a [`FeatureSet`] it keeps across frames. Degenerate statistics (zero, negative or NaN variance) are
//! replaced by [`VARIANCE_EPSILON`]; every input frame produces exactly one output.

use std::ops::{Deref, Range};
use std::sync::Arc;

use ndarray::linalg::general_mat_vec_mul;
use ndarray::{Array1, Array2};
use num_complex::Complex32;

use crate::config::PipelineConfig;
use crate::transform::{SpectralFrame, TransformError};

/// Substitute for invalid running variances.
pub const VARIANCE_EPSILON: f32 = 1e-6;
/// Power floor before log compression.
const POWER_FLOOR: f32 = 1e-10;
/// Value used for a non-finite log feature (`10·log10(POWER_FLOOR)`).
const LOG_FLOOR_DB: f32 = -100.0;

// Initial running statistics, matching DeepFilterNet's normalization state.
const MEAN_NORM_INIT: [f32; 2] = [-60.0, -90.0];
const UNIT_NORM_INIT: [f32; 2] = [0.001, 0.0001];
/// Initial variance: a 40 dB spread, the scale DeepFilterNet divides by.
const VAR_NORM_INIT: f32 = 1600.0;

// Glasberg-Moore ERB scale.
const ERB_A: f32 = 24.7;
const ERB_Q: f32 = 9.265;

#[inline]
fn freq2erb(freq_hz: f32) -> f32 {
    ERB_Q * (1.0 + freq_hz / (ERB_A * ERB_Q)).ln()
}

#[inline]
fn erb2freq(n_erb: f32) -> f32 {
    ERB_A * ERB_Q * ((n_erb / ERB_Q).exp() - 1.0)
}

/// Number of FFT bins per ERB band; sums to `fft_size / 2 + 1`.
pub fn erb_band_widths(sample_rate: usize, fft_size: usize, nb_bands: usize, min_nb_freqs: usize) -> Vec<usize> {
    let nyquist = sample_rate as f32 / 2.0;
    let freq_width = sample_rate as f32 / fft_size as f32;
    let n_freqs = fft_size / 2 + 1;

    let erb_low = freq2erb(0.0);
    let erb_high = freq2erb(nyquist);
    let step = (erb_high - erb_low) / nb_bands as f32;

    let mut widths = vec![0usize; nb_bands];
    let mut prev_freq_bin = 0i64;
    let mut freq_over = 0i64;
    for i in 1..=nb_bands {
        let f = erb2freq(erb_low + i as f32 * step);
        let fb = (f / freq_width).round() as i64;
        let mut nb_freqs = fb - prev_freq_bin - freq_over;
        if nb_freqs < min_nb_freqs as i64 {
            freq_over = min_nb_freqs as i64 - nb_freqs;
            nb_freqs = min_nb_freqs as i64;
        } else {
            freq_over = 0;
        }
        widths[i - 1] = nb_freqs.max(0) as usize;
        prev_freq_bin = fb;
    }

    // DC bin goes to the last band, then fix up the total.
    widths[nb_bands - 1] += 1;
    let total: usize = widths.iter().sum();
    if total > n_freqs {
        let mut excess = total - n_freqs;
        for w in widths.iter_mut().rev() {
            let take = excess.min(w.saturating_sub(1));
            *w -= take;
            excess -= take;
            if excess == 0 {
                break;
            }
        }
    } else if total < n_freqs {
        widths[nb_bands - 1] += n_freqs - total;
    }
    widths
}

/// Perceptual filterbank: contiguous ERB bands over the non-negative bins.
#[derive(Debug, Clone)]
pub struct ErbFilterbank {
    widths: Vec<usize>,
    offsets: Vec<usize>,
    /// `[bands, freq_size]`, each row averages its band's bins.
    weights: Array2<f32>,
}

impl ErbFilterbank {
    pub fn new(config: &PipelineConfig) -> Self {
        let widths = erb_band_widths(
            config.sample_rate,
            config.frame_size,
            config.perceptual_band_count,
            config.min_band_bins,
        );
        Self::from_widths(&widths, config.freq_size())
    }

    /// Filterbank from explicit band widths. Bins past `freq_size` are ignored.
    pub fn from_widths(widths: &[usize], freq_size: usize) -> Self {
        let mut offsets = Vec::with_capacity(widths.len());
        let mut weights = Array2::<f32>::zeros((widths.len(), freq_size));
        let mut start = 0usize;
        for (band, &width) in widths.iter().enumerate() {
            offsets.push(start.min(freq_size));
            let end = (start + width).min(freq_size);
            if end > start {
                let k = 1.0 / (end - start) as f32;
                for bin in start..end {
                    weights[[band, bin]] = k;
                }
            }
            start += width;
        }
        Self { widths: widths.to_vec(), offsets, weights }
    }

    pub fn bands(&self) -> usize {
        self.widths.len()
    }

    pub fn freq_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Bins covered by `band`.
    pub fn band_range(&self, band: usize) -> Range<usize> {
        let start = self.offsets[band];
        let end = (start + self.widths[band]).min(self.freq_size());
        start..end
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    /// Mean power per band.
    pub fn band_energies(&self, power: &Array1<f32>) -> Array1<f32> {
        self.weights.dot(power)
    }

    /// [`band_energies`](Self::band_energies) into a `bands` long buffer.
    pub fn band_energies_into(&self, power: &Array1<f32>, energies: &mut Array1<f32>) {
        general_mat_vec_mul(1.0, &self.weights, power, 0.0, energies);
    }
}

/// Fixed-length feature values of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn zeros(len: usize) -> Self {
        Self { values: vec![0.0; len] }
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.values
    }

    fn resized(&mut self, len: usize) -> &mut [f32] {
        self.values.resize(len, 0.0);
        &mut self.values
    }
}

impl Deref for FeatureVector {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.values
    }
}

/// Everything extracted from one frame.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub perceptual: FeatureVector,
    pub spectral: FeatureVector,
    /// Unit-normalized low bins, `df_bands` long.
    pub complex: Vec<Complex32>,
}

impl FeatureSet {
    pub fn zeros(bands: usize, df_bands: usize) -> Self {
        Self {
            perceptual: FeatureVector::zeros(bands),
            spectral: FeatureVector::zeros(df_bands),
            complex: vec![Complex32::new(0.0, 0.0); df_bands],
        }
    }
}

/// Exponentially-weighted running mean and variance per feature.
#[derive(Debug, Clone)]
struct RunningStats {
    mean: Vec<f32>,
    var: Vec<f32>,
    init_mean: Vec<f32>,
}

impl RunningStats {
    fn new(len: usize) -> Self {
        let init_mean = linspace(MEAN_NORM_INIT, len);
        Self { mean: init_mean.clone(), var: vec![VAR_NORM_INIT; len], init_mean }
    }

    fn normalize(&mut self, values: &mut [f32], alpha: f32) {
        for ((x, mean), var) in values.iter_mut().zip(self.mean.iter_mut()).zip(self.var.iter_mut()) {
            if !x.is_finite() {
                *x = LOG_FLOOR_DB;
            }
            *mean = *x * (1.0 - alpha) + *mean * alpha;
            let d = *x - *mean;
            *var = d * d * (1.0 - alpha) + *var * alpha;
            if !(*var > VARIANCE_EPSILON) {
                *var = VARIANCE_EPSILON;
            }
            *x = d / var.sqrt();
        }
    }

    fn reset(&mut self) {
        self.mean.copy_from_slice(&self.init_mean);
        self.var.fill(VAR_NORM_INIT);
    }
}

fn linspace(range: [f32; 2], len: usize) -> Vec<f32> {
    let step = if len > 1 { (range[1] - range[0]) / (len - 1) as f32 } else { 0.0 };
    (0..len).map(|i| range[0] + i as f32 * step).collect()
}

pub struct FeatureExtractor {
    filterbank: Arc<ErbFilterbank>,
    df_bands: usize,
    alpha: f32,
    erb_stats: RunningStats,
    spec_stats: RunningStats,
    unit_state: Vec<f32>,
    power: Array1<f32>,
    energies: Array1<f32>,
}

impl FeatureExtractor {
    pub fn new(config: &PipelineConfig, filterbank: Arc<ErbFilterbank>) -> Self {
        let bands = filterbank.bands();
        let freq_size = filterbank.freq_size();
        Self {
            filterbank,
            df_bands: config.df_bands,
            alpha: config.normalization_alpha,
            erb_stats: RunningStats::new(bands),
            spec_stats: RunningStats::new(config.df_bands),
            unit_state: linspace(UNIT_NORM_INIT, config.df_bands),
            power: Array1::zeros(freq_size),
            energies: Array1::zeros(bands),
        }
    }

    pub fn filterbank(&self) -> &Arc<ErbFilterbank> {
        &self.filterbank
    }

    /// A feature set sized for this extractor.
    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet::zeros(self.filterbank.bands(), self.df_bands)
    }

    fn check_bins(&self, spectrum: &SpectralFrame) -> Result<(), TransformError> {
        let expected = self.filterbank.freq_size();
        if spectrum.len() != expected {
            return Err(TransformError::SpectrumLength { expected, got: spectrum.len() });
        }
        Ok(())
    }

    /// ERB band features, one value per perceptual band.
    pub fn extract_perceptual_features(&mut self, spectrum: &SpectralFrame) -> Result<FeatureVector, TransformError> {
        self.check_bins(spectrum)?;
        let mut values = vec![0.0; self.filterbank.bands()];
        self.perceptual_into(spectrum, &mut values);
        Ok(FeatureVector::new(values))
    }

    /// Log power features of the lowest `df_bands` bins.
    pub fn extract_spectral_features(&mut self, spectrum: &SpectralFrame) -> Result<FeatureVector, TransformError> {
        self.check_bins(spectrum)?;
        let mut values = vec![0.0; self.df_bands];
        self.spectral_into(spectrum, &mut values);
        Ok(FeatureVector::new(values))
    }

    /// Lowest `df_bands` bins divided by the square root of their running mean magnitude.
    pub fn extract_complex_features(&mut self, spectrum: &SpectralFrame) -> Result<Vec<Complex32>, TransformError> {
        self.check_bins(spectrum)?;
        let mut out = vec![Complex32::new(0.0, 0.0); self.df_bands];
        self.complex_into(spectrum, &mut out);
        Ok(out)
    }

    /// All three feature sets of one frame.
    pub fn extract(&mut self, spectrum: &SpectralFrame) -> Result<FeatureSet, TransformError> {
        let mut features = self.feature_set();
        self.extract_into(spectrum, &mut features)?;
        Ok(features)
    }

    /// [`extract`](Self::extract) into an existing set. Allocation-free once `out` is sized.
    pub fn extract_into(&mut self, spectrum: &SpectralFrame, out: &mut FeatureSet) -> Result<(), TransformError> {
        self.check_bins(spectrum)?;
        let bands = self.filterbank.bands();
        self.perceptual_into(spectrum, out.perceptual.resized(bands));
        let df_bands = self.df_bands;
        self.spectral_into(spectrum, out.spectral.resized(df_bands));
        out.complex.resize(df_bands, Complex32::new(0.0, 0.0));
        self.complex_into(spectrum, &mut out.complex);
        Ok(())
    }

    fn perceptual_into(&mut self, spectrum: &SpectralFrame, values: &mut [f32]) {
        for (k, p) in self.power.iter_mut().enumerate() {
            *p = spectrum.power(k);
        }
        self.filterbank.band_energies_into(&self.power, &mut self.energies);
        for (v, &e) in values.iter_mut().zip(self.energies.iter()) {
            *v = (e + POWER_FLOOR).log10() * 10.0;
        }
        self.erb_stats.normalize(values, self.alpha);
    }

    fn spectral_into(&mut self, spectrum: &SpectralFrame, values: &mut [f32]) {
        for (k, v) in values.iter_mut().enumerate() {
            *v = (spectrum.power(k) + POWER_FLOOR).log10() * 10.0;
        }
        self.spec_stats.normalize(values, self.alpha);
    }

    fn complex_into(&mut self, spectrum: &SpectralFrame, out: &mut [Complex32]) {
        let alpha = self.alpha;
        for ((k, s), dst) in self.unit_state.iter_mut().enumerate().zip(out.iter_mut()) {
            let x = spectrum.bin(k);
            let mag = if x.is_finite() { x.norm() } else { 0.0 };
            *s = mag * (1.0 - alpha) + *s * alpha;
            if !(*s > VARIANCE_EPSILON) {
                *s = VARIANCE_EPSILON;
            }
            *dst = if x.is_finite() { x / s.sqrt() } else { Complex32::new(0.0, 0.0) };
        }
    }

    /// Restore the initial normalization statistics.
    pub fn reset(&mut self) {
        self.erb_stats.reset();
        self.spec_stats.reset();
        self.unit_state = linspace(UNIT_NORM_INIT, self.df_bands);
    }
}
