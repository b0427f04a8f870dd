use crate::{BandTable, FeatureVector, SmoothingConfig};

/// Relative gap below which a channel snaps onto its target, so a steady
/// input is reached exactly instead of stalling one ulp away.
const SNAP_EPSILON: f32 = 1e-6;

/// Per-stream exponential smoothing of every feature channel.
///
/// Each channel follows `state += alpha * (value - state)` independently of
/// the others. State starts at zero and lives until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Smoother {
    config: SmoothingConfig,
    state: FeatureVector,
}

impl Smoother {
    pub fn new(config: SmoothingConfig, bands: &BandTable) -> Self {
        Self {
            config,
            state: FeatureVector::silent(bands),
        }
    }

    /// Current smoothed values.
    pub fn state(&self) -> &FeatureVector {
        &self.state
    }

    /// Returns every channel to zero, as on a stream restart.
    pub fn reset(&mut self) {
        self.state.loudness = 0.0;
        self.state.centroid_hz = 0.0;
        self.state.bandwidth_hz = 0.0;
        for band in &mut self.state.band_energies {
            band.energy = 0.0;
        }
    }

    /// Folds one frame into the state and returns the smoothed vector.
    pub fn apply(&mut self, features: &FeatureVector) -> &FeatureVector {
        let SmoothingConfig {
            loudness_alpha,
            band_alpha,
            spectral_alpha,
            onset_alpha,
        } = self.config;

        self.state.loudness = step(
            self.state.loudness,
            features.loudness,
            rising_alpha(self.state.loudness, features.loudness, loudness_alpha, onset_alpha),
        );

        if self.state.band_energies.len() != features.band_energies.len() {
            tracing::warn!(
                expected = self.state.band_energies.len(),
                actual = features.band_energies.len(),
                "band layout changed, restarting band smoothing"
            );
            self.state.band_energies = features.band_energies.clone();
            for band in &mut self.state.band_energies {
                band.energy = 0.0;
            }
        }
        for (state, input) in self
            .state
            .band_energies
            .iter_mut()
            .zip(&features.band_energies)
        {
            let alpha = rising_alpha(state.energy, input.energy, band_alpha, onset_alpha);
            state.energy = step(state.energy, input.energy, alpha);
        }

        self.state.centroid_hz = step(self.state.centroid_hz, features.centroid_hz, spectral_alpha);
        self.state.bandwidth_hz =
            step(self.state.bandwidth_hz, features.bandwidth_hz, spectral_alpha);

        &self.state
    }
}

fn rising_alpha(state: f32, target: f32, alpha: f32, onset_alpha: Option<f32>) -> f32 {
    match onset_alpha {
        Some(onset) if target > state => onset,
        _ => alpha,
    }
}

fn step(state: f32, target: f32, alpha: f32) -> f32 {
    let next = state + alpha * (target - state);
    if (target - next).abs() <= SNAP_EPSILON * target.abs().max(1.0) {
        return target;
    }
    next.clamp(state.min(target), state.max(target))
}
