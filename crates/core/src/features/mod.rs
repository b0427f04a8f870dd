//! Reduction of a magnitude spectrum to the per-frame feature vector.

use std::{collections::HashSet, ops::Range, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{BandReference, FeatureConfig, LightsError, PipelineConfig, Result, Spectrum};

/// One frequency band, covering `[low_hz, high_hz)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub low_hz: f32,
    pub high_hz: f32,
    pub label: Arc<str>,
}

impl Band {
    pub fn new(low_hz: f32, high_hz: f32, label: &str) -> Self {
        Self {
            low_hz,
            high_hz,
            label: Arc::from(label),
        }
    }

    /// Half-open membership test: the low edge belongs to the band, the high
    /// edge to its upper neighbour.
    pub fn contains(&self, frequency_hz: f32) -> bool {
        frequency_hz >= self.low_hz && frequency_hz < self.high_hz
    }

    /// Geometric center of the band.
    pub fn center_hz(&self) -> f32 {
        (self.low_hz.max(1.0) * self.high_hz.max(1.0)).sqrt()
    }
}

/// Ordered table of bands that energy is aggregated into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandTable {
    pub bands: Vec<Band>,
    /// Permit intentionally overlapping bands.
    pub allow_overlap: bool,
}

impl Default for BandTable {
    fn default() -> Self {
        Self::new(vec![
            Band::new(20.0, 90.0, "sub_bass"),
            Band::new(90.0, 250.0, "bass"),
            Band::new(250.0, 1000.0, "low_mid"),
            Band::new(1000.0, 4000.0, "mid_high"),
            Band::new(4000.0, 20_000.0, "treble"),
        ])
    }
}

impl BandTable {
    /// Creates a table of disjoint bands.
    pub fn new(bands: Vec<Band>) -> Self {
        Self {
            bands,
            allow_overlap: false,
        }
    }

    /// Builds a disjoint table from `(low, high, label)` triples.
    pub fn from_triples(triples: &[(f32, f32, &str)]) -> Self {
        Self::new(
            triples
                .iter()
                .map(|&(low, high, label)| Band::new(low, high, label))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Band> {
        self.bands.iter()
    }

    /// Checks bounds, labels and (unless allowed) disjointness.
    pub fn validate(&self, nyquist_hz: f32) -> Result<()> {
        if self.bands.is_empty() {
            return Err(LightsError::config("band table is empty"));
        }

        let mut labels = HashSet::new();
        for band in &self.bands {
            if band.label.trim().is_empty() {
                return Err(LightsError::config("band labels must not be empty"));
            }
            if !labels.insert(band.label.as_ref()) {
                return Err(LightsError::config(format!(
                    "duplicate band label {:?}",
                    band.label
                )));
            }
            let bounds_ok = band.low_hz.is_finite()
                && band.high_hz.is_finite()
                && band.low_hz >= 0.0
                && band.low_hz < band.high_hz;
            if !bounds_ok {
                return Err(LightsError::config(format!(
                    "band {:?} must satisfy 0 <= low < high",
                    band.label
                )));
            }
            if band.high_hz > nyquist_hz {
                return Err(LightsError::config(format!(
                    "band {:?} reaches {} Hz, above the {} Hz Nyquist limit",
                    band.label, band.high_hz, nyquist_hz
                )));
            }
        }

        if !self.allow_overlap {
            let mut sorted: Vec<&Band> = self.bands.iter().collect();
            sorted.sort_by(|a, b| a.low_hz.total_cmp(&b.low_hz));
            for pair in sorted.windows(2) {
                if pair[0].high_hz > pair[1].low_hz {
                    return Err(LightsError::config(format!(
                        "bands {:?} and {:?} overlap",
                        pair[0].label, pair[1].label
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Normalised energy of one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandEnergy {
    pub label: Arc<str>,
    pub energy: f32,
}

/// Features of one analysed frame.
///
/// `loudness` and every band energy lie in [0, 1]; `centroid_hz` and
/// `bandwidth_hz` lie in [0, Nyquist].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub loudness: f32,
    pub band_energies: Vec<BandEnergy>,
    pub centroid_hz: f32,
    pub bandwidth_hz: f32,
}

impl FeatureVector {
    /// All-zero vector with one entry per band.
    pub fn silent(bands: &BandTable) -> Self {
        Self {
            loudness: 0.0,
            band_energies: bands
                .iter()
                .map(|band| BandEnergy {
                    label: Arc::clone(&band.label),
                    energy: 0.0,
                })
                .collect(),
            centroid_hz: 0.0,
            bandwidth_hz: 0.0,
        }
    }

    /// Energy of the band with the given label.
    pub fn band(&self, label: &str) -> Option<f32> {
        self.band_energies
            .iter()
            .find(|band| band.label.as_ref() == label)
            .map(|band| band.energy)
    }

    /// Band with the highest energy; ties resolve to the lower band.
    pub fn dominant_band(&self) -> Option<&BandEnergy> {
        self.band_energies.iter().fold(None, |best, band| match best {
            Some(current) if current.energy >= band.energy => Some(current),
            _ => Some(band),
        })
    }

    /// Forces every channel into its declared range. NaN becomes zero.
    pub fn clamp_to_range(&mut self, nyquist_hz: f32) {
        self.loudness = unit(self.loudness);
        for band in &mut self.band_energies {
            band.energy = unit(band.energy);
        }
        self.centroid_hz = finite_or_zero(self.centroid_hz).clamp(0.0, nyquist_hz);
        self.bandwidth_hz = finite_or_zero(self.bandwidth_hz).clamp(0.0, nyquist_hz);
    }
}

/// Stateful spectrum-to-features reducer.
///
/// Band bin ranges are resolved once against the analyzer's fixed frequency
/// axis. The only per-stream state is the running band reference.
#[derive(Debug)]
pub struct FeatureExtractor {
    bands: BandTable,
    bins: Vec<Range<usize>>,
    nyquist_hz: f32,
    loudness_reference: f32,
    band_reference: BandReference,
    running_peak: f32,
    zero_guard_hits: u64,
}

impl FeatureExtractor {
    pub fn from_config(config: &PipelineConfig, frequencies: &[f32]) -> Self {
        Self::new(
            &config.features,
            config.bands.clone(),
            frequencies,
            config.nyquist_hz(),
        )
    }

    pub fn new(
        config: &FeatureConfig,
        bands: BandTable,
        frequencies: &[f32],
        nyquist_hz: f32,
    ) -> Self {
        let bins: Vec<Range<usize>> = bands
            .iter()
            .map(|band| {
                let start = frequencies.partition_point(|f| *f < band.low_hz);
                let end = frequencies.partition_point(|f| *f < band.high_hz);
                start..end.max(start)
            })
            .collect();

        for (band, range) in bands.iter().zip(&bins) {
            tracing::debug!(
                band = %band.label,
                low_hz = band.low_hz,
                high_hz = band.high_hz,
                bins = range.len(),
                "band resolved"
            );
            if range.is_empty() {
                tracing::warn!(band = %band.label, "band contains no spectrum bins");
            }
        }

        Self {
            bands,
            bins,
            nyquist_hz,
            loudness_reference: config.loudness_reference,
            band_reference: config.band_reference,
            running_peak: initial_peak(config.band_reference),
            zero_guard_hits: 0,
        }
    }

    pub fn bands(&self) -> &BandTable {
        &self.bands
    }

    /// Frames whose spectrum carried no energy, so centroid and bandwidth
    /// fell back to zero.
    pub fn zero_guard_hits(&self) -> u64 {
        self.zero_guard_hits
    }

    /// Clears the running band reference, as on a stream restart.
    pub fn reset(&mut self) {
        self.running_peak = initial_peak(self.band_reference);
        self.zero_guard_hits = 0;
    }

    /// Computes the clamped feature vector of one frame. `block` is the
    /// time-domain input the spectrum was derived from.
    pub fn extract(&mut self, block: &[f32], spectrum: &Spectrum) -> FeatureVector {
        let loudness = rms(block) / self.loudness_reference;

        let magnitudes = spectrum.magnitudes();
        let sums: Vec<f32> = self
            .bins
            .iter()
            .map(|range| {
                magnitudes
                    .get(range.clone())
                    .map(|bins| bins.iter().sum())
                    .unwrap_or(0.0)
            })
            .collect();
        let reference = self.band_reference_for(&sums);

        let band_energies = self
            .bands
            .iter()
            .zip(sums)
            .map(|(band, sum)| BandEnergy {
                label: Arc::clone(&band.label),
                energy: if reference > 0.0 { sum / reference } else { 0.0 },
            })
            .collect();

        let (centroid_hz, bandwidth_hz) = match spectral_moments(spectrum) {
            Some(moments) => moments,
            None => {
                self.zero_guard_hits += 1;
                (0.0, 0.0)
            }
        };

        let mut features = FeatureVector {
            loudness,
            band_energies,
            centroid_hz,
            bandwidth_hz,
        };
        features.clamp_to_range(self.nyquist_hz);
        features
    }

    fn band_reference_for(&mut self, sums: &[f32]) -> f32 {
        match self.band_reference {
            BandReference::Fixed { reference } => reference,
            BandReference::Adaptive { decay, floor } => {
                let loudest = sums.iter().copied().fold(0.0_f32, f32::max);
                self.running_peak = loudest.max(self.running_peak * decay).max(floor);
                self.running_peak
            }
        }
    }
}

/// Magnitude-weighted mean frequency and standard deviation around it.
/// `None` when the spectrum carries no energy.
pub fn spectral_moments(spectrum: &Spectrum) -> Option<(f32, f32)> {
    let (total, weighted) = spectrum
        .bins()
        .fold((0.0_f64, 0.0_f64), |(total, weighted), (f, m)| {
            (total + m as f64, weighted + f as f64 * m as f64)
        });
    if !(total.is_finite() && total > f64::from(f32::EPSILON)) {
        return None;
    }

    let centroid = weighted / total;
    let variance = spectrum
        .bins()
        .map(|(f, m)| {
            let delta = f as f64 - centroid;
            m as f64 * delta * delta
        })
        .sum::<f64>()
        / total;

    Some((centroid as f32, variance.max(0.0).sqrt() as f32))
}

fn initial_peak(reference: BandReference) -> f32 {
    match reference {
        BandReference::Fixed { reference } => reference,
        BandReference::Adaptive { floor, .. } => floor,
    }
}

pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn unit(value: f32) -> f32 {
    finite_or_zero(value).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;
    use crate::{SpectralAnalyzer, WindowFunction};

    const SAMPLE_RATE: u32 = 44_100;

    fn three_bands() -> BandTable {
        BandTable::from_triples(&[
            (20.0, 250.0, "bass"),
            (250.0, 4000.0, "mid"),
            (4000.0, 20_000.0, "high"),
        ])
    }

    fn sine(frequency: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * PI * frequency * n as f32 / SAMPLE_RATE as f32).sin() * 0.8)
            .collect()
    }

    fn fixed(reference: f32) -> FeatureConfig {
        FeatureConfig {
            loudness_reference: 0.5,
            band_reference: BandReference::Fixed { reference },
        }
    }

    fn features_for(signal: &[f32], block_len: usize, bands: BandTable) -> FeatureVector {
        let mut analyzer = SpectralAnalyzer::new(
            SAMPLE_RATE,
            block_len,
            block_len / 2,
            block_len * 3,
            WindowFunction::Hann,
        )
        .unwrap();
        let mut extractor = FeatureExtractor::new(
            &FeatureConfig::default(),
            bands,
            &analyzer.frequencies(),
            SAMPLE_RATE as f32 / 2.0,
        );

        let mut features = FeatureVector::silent(extractor.bands());
        for block in signal.chunks_exact(block_len) {
            let spectrum = analyzer.analyze(block).unwrap();
            features = extractor.extract(block, spectrum);
        }
        features
    }

    fn axis(frequencies: &[f32]) -> Arc<[f32]> {
        Arc::from(frequencies)
    }

    #[test]
    fn silence_yields_zero_features() {
        let bands = three_bands();
        let features = features_for(&vec![0.0; 1024], 1024, bands.clone());

        assert_eq!(features, FeatureVector::silent(&bands));
    }

    #[test]
    fn zero_guard_is_counted_not_raised() {
        let frequencies = axis(&[0.0, 100.0, 200.0]);
        let mut extractor =
            FeatureExtractor::new(&fixed(1.0), three_bands(), &frequencies, 22_050.0);
        let spectrum = Spectrum::new(frequencies, vec![0.0; 3]);

        let features = extractor.extract(&[0.0; 8], &spectrum);
        assert_eq!(features.centroid_hz, 0.0);
        assert_eq!(features.bandwidth_hz, 0.0);
        assert_eq!(extractor.zero_guard_hits(), 1);
    }

    #[test]
    fn sine_energy_is_isolated_to_its_band() {
        for (frequency, expected) in [(100.0, "bass"), (1000.0, "mid"), (8000.0, "high")] {
            let features = features_for(&sine(frequency, 2048), 1024, three_bands());
            let dominant = features.dominant_band().unwrap();
            assert_eq!(dominant.label.as_ref(), expected, "{frequency} Hz");

            for band in &features.band_energies {
                if band.label.as_ref() != expected {
                    assert!(band.energy < dominant.energy, "{frequency} Hz leaked into {}", band.label);
                }
            }
        }
    }

    #[test]
    fn centroid_tracks_sine_frequency() {
        for frequency in [200.0, 1000.0, 5000.0] {
            let features = features_for(&sine(frequency, 4096), 2048, three_bands());
            let error = (features.centroid_hz - frequency).abs() / frequency;
            assert!(error < 0.05, "centroid {} for {frequency} Hz", features.centroid_hz);
        }
    }

    #[test]
    fn bandwidth_grows_with_spread() {
        let pure = features_for(&sine(1000.0, 4096), 2048, three_bands());
        let mixed: Vec<f32> = sine(300.0, 4096)
            .iter()
            .zip(sine(6000.0, 4096))
            .map(|(a, b)| (a + b) * 0.5)
            .collect();
        let spread = features_for(&mixed, 2048, three_bands());

        assert!(pure.bandwidth_hz < 1000.0);
        assert!(spread.bandwidth_hz > 2000.0);
        assert!(spread.bandwidth_hz > pure.bandwidth_hz);
    }

    #[test]
    fn boundary_bins_belong_to_upper_band() {
        let frequencies = axis(&[0.0, 100.0, 200.0, 300.0, 400.0]);
        let bands = BandTable::from_triples(&[(0.0, 200.0, "a"), (200.0, 400.0, "b")]);
        let mut extractor = FeatureExtractor::new(&fixed(10.0), bands, &frequencies, 500.0);
        let spectrum = Spectrum::new(frequencies, vec![1.0; 5]);

        let features = extractor.extract(&[0.1; 16], &spectrum);
        assert!((features.band("a").unwrap() - 0.2).abs() < 1e-6);
        assert!((features.band("b").unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn band_energy_sums_rather_than_averages() {
        let frequencies = axis(&[50.0, 150.0, 250.0, 350.0, 450.0]);
        let bands = BandTable::from_triples(&[(0.0, 100.0, "narrow"), (100.0, 500.0, "wide")]);
        let mut extractor = FeatureExtractor::new(&fixed(10.0), bands, &frequencies, 500.0);
        let spectrum = Spectrum::new(frequencies, vec![1.0; 5]);

        let features = extractor.extract(&[0.1; 16], &spectrum);
        let narrow = features.band("narrow").unwrap();
        let wide = features.band("wide").unwrap();
        assert!((wide - 4.0 * narrow).abs() < 1e-6);
    }

    #[test]
    fn adaptive_reference_decays_toward_floor() {
        let frequencies = axis(&[50.0, 150.0]);
        let bands = BandTable::from_triples(&[(0.0, 100.0, "low"), (100.0, 200.0, "high")]);
        let config = FeatureConfig {
            loudness_reference: 0.5,
            band_reference: BandReference::Adaptive {
                decay: 0.5,
                floor: 0.1,
            },
        };
        let mut extractor = FeatureExtractor::new(&config, bands, &frequencies, 200.0);

        let loud = Spectrum::new(Arc::clone(&frequencies), vec![8.0, 2.0]);
        let features = extractor.extract(&[0.5; 4], &loud);
        assert_eq!(features.band("low"), Some(1.0));
        assert_eq!(features.band("high"), Some(0.25));

        let quiet = Spectrum::new(frequencies, vec![1.0, 0.0]);
        let mut previous = 0.0;
        for _ in 0..6 {
            let energy = extractor.extract(&[0.1; 4], &quiet).band("low").unwrap();
            assert!(energy >= previous && energy <= 1.0);
            previous = energy;
        }
        assert_eq!(previous, 1.0);

        extractor.reset();
        let energy = extractor.extract(&[0.1; 4], &quiet).band("low").unwrap();
        assert_eq!(energy, 1.0);
    }

    #[test]
    fn loudness_is_normalised_and_clamped() {
        let frequencies = axis(&[0.0]);
        let mut extractor = FeatureExtractor::new(&fixed(1.0), three_bands(), &frequencies, 22_050.0);
        let spectrum = Spectrum::new(frequencies, vec![0.0]);

        assert!((extractor.extract(&[0.25; 8], &spectrum).loudness - 0.5).abs() < 1e-6);
        assert_eq!(extractor.extract(&[1.0; 8], &spectrum).loudness, 1.0);
    }

    #[test]
    fn band_table_validation() {
        assert!(three_bands().validate(22_050.0).is_ok());
        assert!(BandTable::default().validate(22_050.0).is_ok());

        let overlapping = BandTable::from_triples(&[(20.0, 300.0, "a"), (250.0, 400.0, "b")]);
        assert!(overlapping.validate(22_050.0).is_err());
        let intentional = BandTable {
            allow_overlap: true,
            ..overlapping
        };
        assert!(intentional.validate(22_050.0).is_ok());

        assert!(three_bands().validate(8_000.0).is_err());
        assert!(BandTable::from_triples(&[(300.0, 200.0, "a")]).validate(22_050.0).is_err());
        assert!(BandTable::from_triples(&[(0.0, 200.0, " ")]).validate(22_050.0).is_err());
        assert!(BandTable::from_triples(&[(0.0, 200.0, "a"), (200.0, 300.0, "a")])
            .validate(22_050.0)
            .is_err());
        assert!(BandTable::new(Vec::new()).validate(22_050.0).is_err());
    }
}
