//! Windowed forward/inverse spectral transform with overlap-add reconstruction.
//!
//! [`FrameTransform::forward`] takes one full frame (`frame_size` samples, consecutive
//! frames advancing by `hop_size`) and returns its non-negative frequency bins.
//! [`FrameTransform::inverse`] turns a spectrum back into `hop_size` finished output
//! samples, carrying the not-yet-complete remainder in an [`OverlapTail`].
//!
//! Analysis and synthesis both use a periodic Hann window. Instead of relying on the
//! window pair summing to a constant, the tail also carries the accumulated
//! window-square weight of every pending sample and the output is divided by it,
//! so an unmodified spectrum reconstructs the input exactly (up to float error).
//!
//! All FFT plans and scratch buffers are allocated once per transform; the `_into`
//! variants perform zero heap allocations.

use std::sync::Arc;

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use thiserror::Error;

/// Floor for the overlap-add normalization weight.
pub const COLA_EPSILON: f32 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("frame has {got} samples, expected {expected}")]
    FrameLength { expected: usize, got: usize },
    #[error("spectrum has {re} real and {im} imaginary bins")]
    BinCountMismatch { re: usize, im: usize },
    #[error("spectrum has {got} bins, expected {expected}")]
    SpectrumLength { expected: usize, got: usize },
    #[error("overlap tail holds {got} samples, expected {expected}")]
    TailLength { expected: usize, got: usize },
    #[error("output buffer has {got} samples, expected {expected}")]
    OutputLength { expected: usize, got: usize },
    #[error("FFT failed: {0}")]
    Fft(String),
}

/// Non-negative frequency bins of one frame, stored as separate real and
/// imaginary planes of equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    re: Vec<f32>,
    im: Vec<f32>,
}

impl SpectralFrame {
    pub fn zeros(bins: usize) -> Self {
        Self { re: vec![0.0; bins], im: vec![0.0; bins] }
    }

    pub fn new(re: Vec<f32>, im: Vec<f32>) -> Result<Self, TransformError> {
        if re.len() != im.len() {
            return Err(TransformError::BinCountMismatch { re: re.len(), im: im.len() });
        }
        Ok(Self { re, im })
    }

    pub fn from_complex(bins: &[Complex32]) -> Self {
        Self {
            re: bins.iter().map(|c| c.re).collect(),
            im: bins.iter().map(|c| c.im).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.re.len()
    }

    pub fn is_empty(&self) -> bool {
        self.re.is_empty()
    }

    pub fn re(&self) -> &[f32] {
        &self.re
    }

    pub fn im(&self) -> &[f32] {
        &self.im
    }

    /// Both planes, mutably. Lengths cannot be changed through slices.
    pub fn parts_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.re, &mut self.im)
    }

    #[inline]
    pub fn bin(&self, k: usize) -> Complex32 {
        Complex32::new(self.re[k], self.im[k])
    }

    #[inline]
    pub fn set_bin(&mut self, k: usize, value: Complex32) {
        self.re[k] = value.re;
        self.im[k] = value.im;
    }

    #[inline]
    pub fn power(&self, k: usize) -> f32 {
        self.re[k] * self.re[k] + self.im[k] * self.im[k]
    }

    #[inline]
    pub fn magnitude(&self, k: usize) -> f32 {
        self.power(k).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.re.iter().chain(self.im.iter()).all(|v| v.is_finite())
    }

    pub fn scale(&mut self, gain: f32) {
        for v in self.re.iter_mut().chain(self.im.iter_mut()) {
            *v *= gain;
        }
    }

    pub fn fill_zero(&mut self) {
        self.re.fill(0.0);
        self.im.fill(0.0);
    }

    /// Overwrite with `other`, which must have the same bin count.
    pub fn copy_from(&mut self, other: &SpectralFrame) -> Result<(), TransformError> {
        if other.len() != self.len() {
            return Err(TransformError::SpectrumLength { expected: self.len(), got: other.len() });
        }
        self.re.copy_from_slice(&other.re);
        self.im.copy_from_slice(&other.im);
        Ok(())
    }

    /// Write the bins as complex values into `out` (up to the shorter length).
    pub fn write_complex(&self, out: &mut [Complex32]) {
        for ((o, &re), &im) in out.iter_mut().zip(&self.re).zip(&self.im) {
            *o = Complex32::new(re, im);
        }
    }

    fn read_complex(&mut self, bins: &[Complex32]) {
        for ((c, re), im) in bins.iter().zip(self.re.iter_mut()).zip(self.im.iter_mut()) {
            *re = c.re;
            *im = c.im;
        }
    }
}

/// Output samples still waiting for the next frame's overlap, with their
/// accumulated window-square weights.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapTail {
    samples: Vec<f32>,
    weights: Vec<f32>,
}

impl OverlapTail {
    /// Empty tail of `overlap` samples (`frame_size - hop_size`).
    pub fn new(overlap: usize) -> Self {
        Self { samples: vec![0.0; overlap], weights: vec![0.0; overlap] }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn reset(&mut self) {
        self.samples.fill(0.0);
        self.weights.fill(0.0);
    }
}

/// Forward/inverse transform for one frame size.
pub struct FrameTransform {
    frame_size: usize,
    hop_size: usize,
    /// Periodic Hann window, used for analysis and synthesis.
    window: Vec<f32>,
    window_sq: Vec<f32>,
    /// Forward gain; the inverse undoes it.
    wnorm: f32,
    fft_forward: Arc<dyn RealToComplex<f32>>,
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
    fft_buf: Vec<f32>,
    fft_scratch: Vec<Complex32>,
    spec_buf: Vec<Complex32>,
    ifft_buf: Vec<f32>,
    ifft_scratch: Vec<Complex32>,
    norm_buf: Vec<f32>,
}

impl FrameTransform {
    /// Transform for `frame_size` samples per frame and a hop of `frame_size / 2`.
    ///
    /// # Panics
    /// If `frame_size` is odd or smaller than 4; configs are validated before this.
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size >= 4 && frame_size % 2 == 0, "frame size must be even and >= 4");
        let hop_size = frame_size / 2;

        let mut planner = RealFftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(frame_size);
        let fft_inverse = planner.plan_fft_inverse(frame_size);
        let fft_scratch = fft_forward.make_scratch_vec();
        let ifft_scratch = fft_inverse.make_scratch_vec();
        let spec_buf = fft_forward.make_output_vec();
        let ifft_buf = fft_inverse.make_output_vec();

        let window = hann_window(frame_size);
        let window_sq = window.iter().map(|w| w * w).collect();
        let wnorm = 1.0 / (frame_size.pow(2) as f32 / (2 * hop_size) as f32);

        Self {
            frame_size,
            hop_size,
            window,
            window_sq,
            wnorm,
            fft_forward,
            fft_inverse,
            fft_buf: vec![0.0; frame_size],
            fft_scratch,
            spec_buf,
            ifft_buf,
            ifft_scratch,
            norm_buf: vec![0.0; frame_size],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn freq_size(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Tail sized for this transform.
    pub fn new_tail(&self) -> OverlapTail {
        OverlapTail::new(self.frame_size - self.hop_size)
    }

    pub fn forward(&mut self, frame: &[f32]) -> Result<SpectralFrame, TransformError> {
        let mut spectrum = SpectralFrame::zeros(self.freq_size());
        self.forward_into(frame, &mut spectrum)?;
        Ok(spectrum)
    }

    /// Allocation-free [`forward`](Self::forward).
    pub fn forward_into(&mut self, frame: &[f32], spectrum: &mut SpectralFrame) -> Result<(), TransformError> {
        if frame.len() != self.frame_size {
            return Err(TransformError::FrameLength { expected: self.frame_size, got: frame.len() });
        }
        if spectrum.len() != self.freq_size() {
            return Err(TransformError::SpectrumLength { expected: self.freq_size(), got: spectrum.len() });
        }

        for ((buf, &x), &w) in self.fft_buf.iter_mut().zip(frame).zip(&self.window) {
            *buf = x * w;
        }
        self.fft_forward
            .process_with_scratch(&mut self.fft_buf, &mut self.spec_buf, &mut self.fft_scratch)
            .map_err(|e| TransformError::Fft(e.to_string()))?;
        for x in self.spec_buf.iter_mut() {
            *x *= self.wnorm;
        }
        spectrum.read_complex(&self.spec_buf);
        Ok(())
    }

    pub fn inverse(&mut self, spectrum: &SpectralFrame, tail: &mut OverlapTail) -> Result<Vec<f32>, TransformError> {
        let mut out = vec![0.0f32; self.hop_size];
        self.inverse_into(spectrum, tail, &mut out)?;
        Ok(out)
    }

    /// Allocation-free [`inverse`](Self::inverse). `out` must hold `hop_size` samples.
    ///
    /// On error neither `tail` nor `out` is modified.
    pub fn inverse_into(
        &mut self,
        spectrum: &SpectralFrame,
        tail: &mut OverlapTail,
        out: &mut [f32],
    ) -> Result<(), TransformError> {
        let freq_size = self.freq_size();
        let overlap = self.frame_size - self.hop_size;
        if spectrum.re.len() != spectrum.im.len() {
            return Err(TransformError::BinCountMismatch { re: spectrum.re.len(), im: spectrum.im.len() });
        }
        if spectrum.len() != freq_size {
            return Err(TransformError::SpectrumLength { expected: freq_size, got: spectrum.len() });
        }
        if tail.len() != overlap {
            return Err(TransformError::TailLength { expected: overlap, got: tail.len() });
        }
        if out.len() != self.hop_size {
            return Err(TransformError::OutputLength { expected: self.hop_size, got: out.len() });
        }

        spectrum.write_complex(&mut self.spec_buf);
        // A real signal has purely real DC and Nyquist bins.
        self.spec_buf[0].im = 0.0;
        self.spec_buf[freq_size - 1].im = 0.0;
        self.fft_inverse
            .process_with_scratch(&mut self.spec_buf, &mut self.ifft_buf, &mut self.ifft_scratch)
            .map_err(|e| TransformError::Fft(e.to_string()))?;

        let scale = 1.0 / (self.frame_size as f32 * self.wnorm);
        for (((x, norm), &w), &wsq) in self
            .ifft_buf
            .iter_mut()
            .zip(self.norm_buf.iter_mut())
            .zip(&self.window)
            .zip(&self.window_sq)
        {
            *x *= scale * w;
            *norm = wsq;
        }

        // Overlap-add with the pending tail.
        for (i, (&s, &wt)) in tail.samples.iter().zip(&tail.weights).enumerate() {
            self.ifft_buf[i] += s;
            self.norm_buf[i] += wt;
        }

        for ((o, &x), &norm) in out.iter_mut().zip(&self.ifft_buf).zip(&self.norm_buf) {
            *o = x / norm.max(COLA_EPSILON);
        }
        tail.samples.copy_from_slice(&self.ifft_buf[self.hop_size..]);
        tail.weights.copy_from_slice(&self.norm_buf[self.hop_size..]);
        Ok(())
    }
}

/// Periodic Hann window: `0.5 - 0.5·cos(2πn/N)`.
fn hann_window(size: usize) -> Vec<f32> {
    let pi = std::f64::consts::PI;
    (0..size)
        .map(|n| (0.5 - 0.5 * (2.0 * pi * n as f64 / size as f64).cos()) as f32)
        .collect()
}
