//! Applies predicted filters to the noisy spectrum.
//!
//! Two stages run per frame. The band mask scales every bin of a perceptual band
//! by that band's gain. The deep filter then replaces the lowest `df_bands` bins
//! with a complex FIR over the last `df_order` noisy spectra, which can correct
//! phase as well as magnitude. Both stages are bounded: band gains are clamped to
//! `[0, max_gain]` and every filtered bin to `max_gain` times the input magnitude.
//!
//! A local SNR estimate from the model, when present, gates the stages: very noisy
//! frames are muted, clean frames skip filtering.

use std::collections::VecDeque;
use std::sync::Arc;

use num_complex::Complex32;

use crate::config::PipelineConfig;
use crate::features::ErbFilterbank;
use crate::inference::FilterCoefficients;
use crate::transform::SpectralFrame;

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconstruction {
    /// Filters applied.
    Enhanced,
    /// Local SNR below the floor; the frame was muted.
    Muted,
    /// Local SNR above both ceilings; the input was kept.
    Bypassed,
    /// Filtering produced non-finite values or the coefficients had the wrong
    /// size; the input was substituted.
    Rejected,
}

/// Which stages to run for a given local SNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gating {
    zero: bool,
    mask: bool,
    deep_filter: bool,
}

pub struct SpectralReconstructor {
    filterbank: Arc<ErbFilterbank>,
    df_bands: usize,
    df_order: usize,
    max_gain: f32,
    min_db_thresh: f32,
    max_db_erb_thresh: f32,
    max_db_df_thresh: f32,
    /// Last `df_order` input spectra, oldest first.
    history: VecDeque<SpectralFrame>,
    rejected: u64,
}

impl SpectralReconstructor {
    pub fn new(config: &PipelineConfig, filterbank: Arc<ErbFilterbank>) -> Self {
        let bins = config.freq_size();
        let history = (0..config.df_order).map(|_| SpectralFrame::zeros(bins)).collect();
        Self {
            filterbank,
            df_bands: config.df_bands,
            df_order: config.df_order,
            max_gain: config.max_gain,
            min_db_thresh: config.min_db_thresh,
            max_db_erb_thresh: config.max_db_erb_thresh,
            max_db_df_thresh: config.max_db_df_thresh,
            history,
            rejected: 0,
        }
    }

    /// Number of frames whose filtered output was replaced by the input.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }

    /// Clear the FIR history, e.g. on session restart.
    pub fn reset(&mut self) {
        for frame in &mut self.history {
            frame.fill_zero();
        }
    }

    /// Apply `mask` and `fir` to `spectrum` and return the enhanced spectrum.
    pub fn reconstruct(&mut self, spectrum: &SpectralFrame, mask: &[f32], fir: &[f32]) -> SpectralFrame {
        let mut out = SpectralFrame::zeros(spectrum.len());
        self.reconstruct_into(spectrum, mask, fir, None, &mut out);
        out
    }

    /// Like [`reconstruct`](Self::reconstruct) with coefficients and local SNR
    /// from the model, writing into a preallocated frame.
    pub fn apply(
        &mut self,
        spectrum: &SpectralFrame,
        coefficients: &FilterCoefficients,
        lsnr: Option<f32>,
        out: &mut SpectralFrame,
    ) -> Reconstruction {
        self.reconstruct_into(spectrum, &coefficients.mask, &coefficients.fir, lsnr, out)
    }

    fn gating(&self, lsnr: Option<f32>) -> Gating {
        match lsnr {
            None => Gating { zero: false, mask: true, deep_filter: true },
            Some(l) if l < self.min_db_thresh => Gating { zero: true, mask: false, deep_filter: false },
            Some(l) => Gating {
                zero: false,
                mask: l <= self.max_db_erb_thresh,
                deep_filter: l <= self.max_db_df_thresh,
            },
        }
    }

    /// Record `spectrum` in the FIR history without filtering it.
    pub fn observe(&mut self, spectrum: &SpectralFrame) {
        if let Some(mut oldest) = self.history.pop_front() {
            if oldest.copy_from(spectrum).is_err() {
                oldest = spectrum.clone();
            }
            self.history.push_back(oldest);
        }
    }

    fn reconstruct_into(
        &mut self,
        spectrum: &SpectralFrame,
        mask: &[f32],
        fir: &[f32],
        lsnr: Option<f32>,
        out: &mut SpectralFrame,
    ) -> Reconstruction {
        self.observe(spectrum);
        if out.copy_from(spectrum).is_err() {
            *out = spectrum.clone();
        }

        let fits = mask.len() == self.filterbank.bands()
            && fir.len() == self.df_bands * self.df_order * 2
            && spectrum.len() == self.filterbank.freq_size();
        if !fits {
            log::debug!(
                "coefficient size mismatch: mask {} fir {} for {} bins",
                mask.len(),
                fir.len(),
                spectrum.len()
            );
            self.rejected += 1;
            return Reconstruction::Rejected;
        }

        let gating = self.gating(lsnr);
        if gating.zero {
            out.fill_zero();
            return Reconstruction::Muted;
        }
        if !gating.mask && !gating.deep_filter {
            return Reconstruction::Bypassed;
        }

        if gating.mask {
            self.apply_band_gains(mask, out);
        }
        if gating.deep_filter {
            self.apply_deep_filter(spectrum, fir, out);
        }

        if !out.is_finite() {
            log::debug!("non-finite reconstruction, substituting input spectrum");
            // Same length, checked above.
            let _ = out.copy_from(spectrum);
            self.rejected += 1;
            return Reconstruction::Rejected;
        }
        Reconstruction::Enhanced
    }

    fn apply_band_gains(&self, mask: &[f32], out: &mut SpectralFrame) {
        let (re, im) = out.parts_mut();
        for (band, &gain) in mask.iter().enumerate() {
            // NaN survives the clamp and is caught by the finiteness check.
            let g = gain.clamp(0.0, self.max_gain);
            for k in self.filterbank.band_range(band) {
                re[k] *= g;
                im[k] *= g;
            }
        }
    }

    fn apply_deep_filter(&self, spectrum: &SpectralFrame, fir: &[f32], out: &mut SpectralFrame) {
        let bins = self.df_bands.min(spectrum.len());
        for k in 0..bins {
            let mut acc = Complex32::new(0.0, 0.0);
            for (tap, frame) in self.history.iter().enumerate() {
                let base = (k * self.df_order + tap) * 2;
                acc += frame.bin(k) * Complex32::new(fir[base], fir[base + 1]);
            }
            let limit = self.max_gain * spectrum.magnitude(k);
            let norm = acc.norm();
            if norm > limit {
                acc = if norm > 0.0 { acc * (limit / norm) } else { Complex32::new(0.0, 0.0) };
            }
            out.set_bin(k, acc);
        }
    }
}
