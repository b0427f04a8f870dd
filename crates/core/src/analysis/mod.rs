use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{LightsError, PipelineConfig, Result};

/// Taper applied to each analysis window before the transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    #[default]
    Hann,
    Hamming,
    Blackman,
    Rectangular,
}

impl WindowFunction {
    /// Symmetric window coefficients of length `len`.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        (0..len).map(|index| self.value(index, len)).collect()
    }

    fn value(self, index: usize, len: usize) -> f32 {
        match self {
            Self::Hann => hann_value(index, len),
            Self::Hamming => cosine_sum(index, len, &[0.54, 0.46]),
            Self::Blackman => cosine_sum(index, len, &[0.42, 0.5, 0.08]),
            Self::Rectangular => 1.0,
        }
    }
}

/// Magnitude spectrum of one analysis window, restricted to non-negative
/// frequencies.
///
/// The frequency axis is shared between every spectrum an analyzer produces;
/// only the magnitudes change from frame to frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    frequencies: Arc<[f32]>,
    magnitudes: Vec<f32>,
}

impl Spectrum {
    /// Builds a spectrum from a frequency axis and matching magnitudes.
    /// Missing magnitudes are treated as zero, extra ones are dropped.
    pub fn new(frequencies: Arc<[f32]>, mut magnitudes: Vec<f32>) -> Self {
        magnitudes.resize(frequencies.len(), 0.0);
        Self {
            frequencies,
            magnitudes,
        }
    }

    fn silent(frequencies: Arc<[f32]>) -> Self {
        let magnitudes = vec![0.0; frequencies.len()];
        Self {
            frequencies,
            magnitudes,
        }
    }

    pub fn frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    /// `(frequency, magnitude)` pairs in ascending frequency order.
    pub fn bins(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.frequencies
            .iter()
            .copied()
            .zip(self.magnitudes.iter().copied())
    }

    /// Bin with the largest magnitude, if the spectrum is not silent.
    pub fn peak(&self) -> Option<(f32, f32)> {
        self.bins()
            .filter(|(_, magnitude)| *magnitude > 0.0)
            .fold(None, |best, bin| match best {
                Some((_, best_mag)) if best_mag >= bin.1 => best,
                _ => Some(bin),
            })
    }
}

/// Windowed real FFT stage.
///
/// Every block is (optionally) prefixed with the retained tail of the previous
/// block, tapered by the precomputed window, zero-padded to the transform
/// length and reduced to magnitudes.
pub struct SpectralAnalyzer {
    sample_rate: u32,
    block_len: usize,
    window_function: WindowFunction,
    window: Vec<f32>,
    history: Vec<f32>,
    magnitude_scale: f32,
    resolution_hz: f32,
    fft: FftResources,
    spectrum: Spectrum,
}

impl SpectralAnalyzer {
    /// Builds an analyzer for the block, overlap and transform settings of a
    /// validated configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.audio.sample_rate,
            config.audio.block_len,
            config.analysis.retained_len(config.audio.block_len),
            config.transform_len(),
            config.analysis.window,
        )
    }

    /// Builds an analyzer that keeps `retained` trailing samples of every
    /// block and transforms windows of `block_len + retained` samples
    /// zero-padded to `transform_len`.
    pub fn new(
        sample_rate: u32,
        block_len: usize,
        retained: usize,
        transform_len: usize,
        window_function: WindowFunction,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(LightsError::config("sample rate must be positive"));
        }
        if block_len < 2 || retained >= block_len {
            return Err(LightsError::config(format!(
                "cannot retain {retained} samples of {block_len}-sample blocks"
            )));
        }
        let window_len = block_len + retained;
        if transform_len < window_len {
            return Err(LightsError::config(format!(
                "transform length {transform_len} is shorter than the {window_len}-sample window"
            )));
        }

        let window = window_function.coefficients(window_len);
        let window_sum: f32 = window.iter().sum();
        let magnitude_scale = if window_sum > f32::EPSILON {
            2.0 / window_sum
        } else {
            1.0
        };

        let resolution_hz = sample_rate as f32 / transform_len as f32;
        let fft = FftResources::new(transform_len);
        let frequencies: Arc<[f32]> = (0..fft.spectrum.len())
            .map(|bin| bin as f32 * resolution_hz)
            .collect();

        tracing::debug!(
            sample_rate,
            block_len,
            window_len,
            transform_len,
            bins = frequencies.len(),
            resolution_hz,
            window = ?window_function,
            "spectral analyzer configured"
        );

        Ok(Self {
            sample_rate,
            block_len,
            window_function,
            window,
            history: vec![0.0; retained],
            magnitude_scale,
            resolution_hz,
            fft,
            spectrum: Spectrum::silent(frequencies),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn transform_len(&self) -> usize {
        self.fft.size
    }

    /// Number of non-negative frequency bins, `transform_len / 2 + 1`.
    pub fn bin_count(&self) -> usize {
        self.spectrum.len()
    }

    /// Spacing between bins in Hz, fixed at construction.
    pub fn resolution_hz(&self) -> f32 {
        self.resolution_hz
    }

    /// Shared frequency axis of every spectrum this analyzer produces.
    pub fn frequencies(&self) -> Arc<[f32]> {
        Arc::clone(&self.spectrum.frequencies)
    }

    /// Forgets the retained tail, as on a stream restart.
    pub fn reset(&mut self) {
        self.history.fill(0.0);
    }

    /// Transforms one block. The returned spectrum is overwritten by the next
    /// call.
    pub fn analyze(&mut self, block: &[f32]) -> Result<&Spectrum> {
        if block.len() != self.block_len {
            return Err(LightsError::BlockLength {
                expected: self.block_len,
                actual: block.len(),
            });
        }

        if block.iter().all(|sample| *sample == 0.0) {
            self.spectrum.magnitudes.fill(0.0);
            self.retain_tail(block);
            return Ok(&self.spectrum);
        }

        let retained = self.history.len();
        let input = &mut self.fft.input;
        for (slot, (sample, coefficient)) in input
            .iter_mut()
            .zip(self.history.iter().chain(block).zip(&self.window))
        {
            *slot = sample * coefficient;
        }
        input[retained + block.len()..].fill(0.0);

        self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.spectrum,
            &mut self.fft.scratch,
        )?;

        for (magnitude, bin) in self
            .spectrum
            .magnitudes
            .iter_mut()
            .zip(&self.fft.spectrum)
        {
            *magnitude = bin.norm() * self.magnitude_scale;
        }

        self.retain_tail(block);
        Ok(&self.spectrum)
    }

    fn retain_tail(&mut self, block: &[f32]) {
        let retained = self.history.len();
        if retained > 0 {
            self.history
                .copy_from_slice(&block[block.len() - retained..]);
        }
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        Self {
            size,
            plan,
            scratch,
            spectrum,
            input,
        }
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("block_len", &self.block_len)
            .field("window", &self.window_function)
            .field("window_len", &self.window.len())
            .field("resolution_hz", &self.resolution_hz)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

fn cosine_sum(index: usize, len: usize, terms: &[f32]) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    let phase = (2.0 * PI * index as f32) / (len as f32 - 1.0);
    terms
        .iter()
        .enumerate()
        .map(|(k, a)| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            sign * a * (phase * k as f32).cos()
        })
        .sum()
}
