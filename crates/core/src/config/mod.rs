use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BandTable, ColorScheme, LightsError, PixelFormat, Result, WindowFunction};

/// Top-level configuration structure for the pipeline.
///
/// Every section falls back to its defaults when omitted, so a JSON file only
/// needs to carry the values it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub audio: AudioConfig,
    pub analysis: AnalysisConfig,
    pub bands: BandTable,
    pub features: FeatureConfig,
    pub smoothing: SmoothingConfig,
    pub color: ColorConfig,
    pub output: OutputConfig,
    pub driver: DriverConfig,
}

impl PipelineConfig {
    /// Parses a configuration from JSON and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Nyquist frequency for the configured sample rate.
    pub fn nyquist_hz(&self) -> f32 {
        self.audio.sample_rate as f32 * 0.5
    }

    /// Number of samples in one analysis window: the current block plus the
    /// retained tail of the previous one.
    pub fn window_len(&self) -> usize {
        self.audio.block_len + self.analysis.retained_len(self.audio.block_len)
    }

    /// Length of the frequency transform, including zero padding.
    pub fn transform_len(&self) -> usize {
        self.analysis
            .transform_len
            .unwrap_or_else(|| self.window_len() * 2)
    }

    /// Total number of addressable output positions.
    pub fn total_positions(&self) -> usize {
        self.output.strips * self.output.leds_per_strip
    }

    /// Checks every configuration-time invariant. Nothing is processed until
    /// this passes.
    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.analysis.validate()?;

        let window_len = self.window_len();
        let transform_len = self.transform_len();
        if transform_len < window_len {
            return Err(LightsError::config(format!(
                "transform length {transform_len} is shorter than the analysis window ({window_len} samples)"
            )));
        }

        self.bands.validate(self.nyquist_hz())?;
        self.features.validate()?;
        self.smoothing.validate()?;
        self.color.validate()?;
        self.output.validate()?;
        self.driver.validate()
    }
}

/// Configuration specific to the audio input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_len: usize,
    /// Linear gain applied to every sample before analysis.
    pub input_gain: f32,
    /// Blocks whose RMS (after gain) falls below this level are analysed as
    /// silence.
    pub noise_gate: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_len: 1024,
            input_gain: 1.0,
            noise_gate: 0.0005,
        }
    }
}

impl AudioConfig {
    /// Duration of one block in seconds.
    pub fn block_seconds(&self) -> f32 {
        self.block_len as f32 / self.sample_rate.max(1) as f32
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(LightsError::config("sample rate must be positive"));
        }
        if self.block_len < 2 {
            return Err(LightsError::config(
                "blocks must hold at least two samples",
            ));
        }
        if !(self.input_gain.is_finite() && self.input_gain > 0.0) {
            return Err(LightsError::config("input gain must be positive"));
        }
        if !(self.noise_gate.is_finite() && self.noise_gate >= 0.0) {
            return Err(LightsError::config("noise gate must be non-negative"));
        }
        Ok(())
    }
}

/// Windowing and transform settings for the spectral analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub window: WindowFunction,
    /// Fraction of each block retained and prepended to the next window.
    pub overlap: f32,
    /// Transform length; defaults to twice the analysis window.
    pub transform_len: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window: WindowFunction::Hann,
            overlap: 0.5,
            transform_len: None,
        }
    }
}

impl AnalysisConfig {
    /// Number of trailing samples of each block kept for the next window.
    pub fn retained_len(&self, block_len: usize) -> usize {
        (block_len as f32 * self.overlap.clamp(0.0, 1.0)).floor() as usize
    }

    fn validate(&self) -> Result<()> {
        if !(self.overlap.is_finite() && (0.0..1.0).contains(&self.overlap)) {
            return Err(LightsError::config(format!(
                "overlap {} must lie in [0, 1)",
                self.overlap
            )));
        }
        Ok(())
    }
}

/// How summed band magnitudes are scaled into [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BandReference {
    /// Divide by a constant.
    Fixed { reference: f32 },
    /// Divide by a running peak shared across all bands. The peak decays by
    /// `decay` every frame but never drops below `floor`.
    Adaptive { decay: f32, floor: f32 },
}

impl Default for BandReference {
    fn default() -> Self {
        Self::Adaptive {
            decay: 0.95,
            floor: 0.1,
        }
    }
}

/// Normalisation settings for extracted features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// RMS level that maps to full loudness.
    pub loudness_reference: f32,
    pub band_reference: BandReference,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            loudness_reference: 0.5,
            band_reference: BandReference::default(),
        }
    }
}

impl FeatureConfig {
    fn validate(&self) -> Result<()> {
        if !(self.loudness_reference.is_finite() && self.loudness_reference > 0.0) {
            return Err(LightsError::config("loudness reference must be positive"));
        }
        match self.band_reference {
            BandReference::Fixed { reference } => {
                if !(reference.is_finite() && reference > 0.0) {
                    return Err(LightsError::config("band reference must be positive"));
                }
            }
            BandReference::Adaptive { decay, floor } => {
                if !(decay.is_finite() && decay > 0.0 && decay <= 1.0) {
                    return Err(LightsError::config("band reference decay must lie in (0, 1]"));
                }
                if !(floor.is_finite() && floor > 0.0) {
                    return Err(LightsError::config("band reference floor must be positive"));
                }
            }
        }
        Ok(())
    }
}

/// Per-channel exponential smoothing factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub loudness_alpha: f32,
    pub band_alpha: f32,
    /// Used for the centroid and bandwidth channels.
    pub spectral_alpha: f32,
    /// Optional faster factor applied to loudness and band channels while
    /// their value rises.
    pub onset_alpha: Option<f32>,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            loudness_alpha: 0.5,
            band_alpha: 0.35,
            spectral_alpha: 0.2,
            onset_alpha: None,
        }
    }
}

impl SmoothingConfig {
    fn validate(&self) -> Result<()> {
        let factors = [
            ("loudness_alpha", Some(self.loudness_alpha)),
            ("band_alpha", Some(self.band_alpha)),
            ("spectral_alpha", Some(self.spectral_alpha)),
            ("onset_alpha", self.onset_alpha),
        ];
        for (name, value) in factors {
            if let Some(alpha) = value {
                if !(alpha.is_finite() && alpha > 0.0 && alpha <= 1.0) {
                    return Err(LightsError::config(format!(
                        "{name} must lie in (0, 1], got {alpha}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Color mapping policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub scheme: ColorScheme,
    pub low_hz: f32,
    pub mid_hz: f32,
    pub high_hz: f32,
    /// Hues in degrees at the low, mid and high anchors.
    pub low_hue: f32,
    pub mid_hue: f32,
    pub high_hue: f32,
    pub min_brightness: f32,
    pub max_brightness: f32,
    pub gamma: f32,
    /// Bandwidth that produces the full spread effect.
    pub bandwidth_reference_hz: f32,
    /// Hue offset, in degrees, reached at either edge under full spread.
    pub spread_hue_span: f32,
    /// Saturation removed at the edges under full spread.
    pub edge_desaturation: f32,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            scheme: ColorScheme::Centroid,
            low_hz: 20.0,
            mid_hz: 1000.0,
            high_hz: 20_000.0,
            low_hue: 0.0,
            mid_hue: 120.0,
            high_hue: 240.0,
            min_brightness: 0.0,
            max_brightness: 0.3,
            gamma: 1.0,
            bandwidth_reference_hz: 2000.0,
            spread_hue_span: 60.0,
            edge_desaturation: 0.5,
        }
    }
}

impl ColorConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let freqs_ok = self.low_hz.is_finite()
            && self.high_hz.is_finite()
            && self.low_hz > 0.0
            && self.low_hz < self.mid_hz
            && self.mid_hz < self.high_hz;
        if !freqs_ok {
            return Err(LightsError::config(
                "color bounds must satisfy 0 < low_hz < mid_hz < high_hz",
            ));
        }
        let brightness_ok = (0.0..=1.0).contains(&self.min_brightness)
            && (0.0..=1.0).contains(&self.max_brightness)
            && self.min_brightness <= self.max_brightness;
        if !brightness_ok {
            return Err(LightsError::config(
                "brightness bounds must satisfy 0 <= min <= max <= 1",
            ));
        }
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(LightsError::config("gamma must be positive"));
        }
        if !(self.bandwidth_reference_hz.is_finite() && self.bandwidth_reference_hz > 0.0) {
            return Err(LightsError::config("bandwidth reference must be positive"));
        }
        if !(0.0..=1.0).contains(&self.edge_desaturation) {
            return Err(LightsError::config("edge desaturation must lie in [0, 1]"));
        }
        let hues = [self.low_hue, self.mid_hue, self.high_hue, self.spread_hue_span];
        if hues.iter().any(|hue| !hue.is_finite()) {
            return Err(LightsError::config("hues must be finite"));
        }
        Ok(())
    }
}

/// Physical layout of the addressable output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub strips: usize,
    pub leds_per_strip: usize,
    pub format: PixelFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            strips: 3,
            leds_per_strip: 144,
            format: PixelFormat::Rgb,
        }
    }
}

impl OutputConfig {
    fn validate(&self) -> Result<()> {
        if self.strips == 0 || self.leds_per_strip == 0 {
            return Err(LightsError::config(
                "output must have at least one addressable position",
            ));
        }
        Ok(())
    }
}

/// Concurrency and cadence settings of the pipeline driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub queue_capacity: usize,
    /// Upper bound on frames handed to the sink per second.
    pub max_fps: Option<u32>,
    /// How long the consumer may wait for audio before flagging a stall.
    pub stall_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 3,
            max_fps: Some(30),
            stall_timeout_ms: 2000,
        }
    }
}

impl DriverConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(LightsError::config("queue capacity must be at least one"));
        }
        if self.max_fps == Some(0) {
            return Err(LightsError::config("max_fps must be positive when set"));
        }
        if self.stall_timeout_ms == 0 {
            return Err(LightsError::config("stall timeout must be positive"));
        }
        Ok(())
    }
}
