//! Feature-to-color mapping.
//!
//! [`ColorMapper`] is a pure function of its configuration and the incoming
//! [`FeatureVector`]: the same input always yields the same [`ColorFrame`].

use serde::{Deserialize, Serialize};

use crate::{
    BandTable, Color, ColorConfig, ColorFrame, FeatureVector, PipelineConfig, PixelFormat, Result,
};

/// How features are laid out across the addressable range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorScheme {
    /// One hue from the centroid, brightness from loudness, bandwidth spread
    /// outward from the middle.
    #[default]
    Centroid,
    /// Each band lights its own segment in proportion to its energy.
    BandMeters,
}

#[derive(Debug, Clone)]
pub struct ColorMapper {
    config: ColorConfig,
    positions: usize,
    format: PixelFormat,
    /// Hue of each band's center frequency, in band table order.
    band_hues: Vec<f32>,
}

impl ColorMapper {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            &config.color,
            config.total_positions(),
            config.output.format,
            &config.bands,
        )
    }

    /// Fails when `config` does not order its anchors `low < mid < high`
    /// or is otherwise out of range.
    pub fn new(
        config: &ColorConfig,
        positions: usize,
        format: PixelFormat,
        bands: &BandTable,
    ) -> Result<Self> {
        config.validate()?;

        let mut mapper = Self {
            config: config.clone(),
            positions,
            format,
            band_hues: Vec::new(),
        };
        mapper.band_hues = bands.iter().map(|band| mapper.hue_for(band.center_hz())).collect();
        Ok(mapper)
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Hue in degrees for `frequency_hz`, interpolated logarithmically between
    /// the low, mid and high anchors. Frequencies outside the bounds (and
    /// non-finite input) saturate at the nearest anchor.
    pub fn hue_for(&self, frequency_hz: f32) -> f32 {
        let ColorConfig {
            low_hz,
            mid_hz,
            high_hz,
            low_hue,
            mid_hue,
            high_hue,
            ..
        } = self.config;

        let frequency = if frequency_hz.is_nan() {
            low_hz
        } else {
            frequency_hz.clamp(low_hz, high_hz)
        };

        if frequency <= mid_hz {
            let t = (frequency / low_hz).ln() / (mid_hz / low_hz).ln();
            low_hue + t * (mid_hue - low_hue)
        } else {
            let t = (frequency / mid_hz).ln() / (high_hz / mid_hz).ln();
            mid_hue + t * (high_hue - mid_hue)
        }
    }

    /// Output value for a unit-range level.
    pub fn brightness(&self, level: f32) -> f32 {
        let ColorConfig {
            min_brightness,
            max_brightness,
            gamma,
            ..
        } = self.config;
        min_brightness + unit(level).powf(gamma) * (max_brightness - min_brightness)
    }

    /// The color of silence: minimum brightness at the low anchor hue.
    pub fn silence_color(&self) -> Color {
        self.color(self.config.low_hue, 1.0, self.brightness(0.0))
    }

    pub fn map(&self, features: &FeatureVector, sequence: u64) -> ColorFrame {
        let pixels = match self.config.scheme {
            ColorScheme::Centroid => self.centroid_pixels(features),
            ColorScheme::BandMeters => self.meter_pixels(features),
        };
        ColorFrame::new(sequence, self.format, pixels)
    }

    fn centroid_pixels(&self, features: &FeatureVector) -> Vec<Color> {
        let loudness = unit(features.loudness);
        if loudness == 0.0 {
            return vec![self.silence_color(); self.positions];
        }

        let centroid = finite_or_zero(features.centroid_hz);
        let hue = self.hue_for(centroid);
        let value = self.brightness(loudness);
        let spread = unit(finite_or_zero(features.bandwidth_hz) / self.config.bandwidth_reference_hz);

        if spread == 0.0 {
            return vec![self.color(hue, 1.0, value); self.positions];
        }

        let last = self.positions.saturating_sub(1).max(1) as f32;
        (0..self.positions)
            .map(|position| {
                // -1 at the left edge, 0 in the middle, 1 at the right edge.
                let offset = if self.positions > 1 {
                    position as f32 / last * 2.0 - 1.0
                } else {
                    0.0
                };
                let shifted = hue + offset * spread * self.config.spread_hue_span;
                let saturation = 1.0 - spread * offset.abs() * self.config.edge_desaturation;
                self.color(shifted, saturation, value)
            })
            .collect()
    }

    fn meter_pixels(&self, features: &FeatureVector) -> Vec<Color> {
        let silence = self.silence_color();
        let mut pixels = vec![silence; self.positions];
        let segments = features.band_energies.len().min(self.band_hues.len());
        if segments == 0 {
            return pixels;
        }

        for (index, (band, hue)) in features
            .band_energies
            .iter()
            .zip(&self.band_hues)
            .enumerate()
        {
            let start = index * self.positions / segments;
            let end = (index + 1) * self.positions / segments;
            let energy = unit(band.energy);
            let lit = (energy * (end - start) as f32).round() as usize;
            if lit == 0 {
                continue;
            }

            let color = self.color(*hue, 1.0, self.brightness(energy));
            for pixel in &mut pixels[start..start + lit.min(end - start)] {
                *pixel = color;
            }
        }
        pixels
    }

    fn color(&self, hue: f32, saturation: f32, value: f32) -> Color {
        let (r, g, b) = hsv_to_rgb(hue, saturation, value);
        Color::from_unit(r, g, b, self.format)
    }
}

/// Converts HSV (hue in degrees, saturation and value in [0, 1]) to unit RGB.
pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> (f32, f32, f32) {
    let hue = if hue.is_finite() { hue.rem_euclid(360.0) } else { 0.0 };
    let saturation = unit(saturation);
    let value = unit(value);

    let chroma = value * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = value - chroma;
    (r + m, g + m, b + m)
}

fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::BandEnergy;

    fn three_bands() -> BandTable {
        BandTable::from_triples(&[
            (20.0, 250.0, "bass"),
            (250.0, 4000.0, "mid"),
            (4000.0, 20000.0, "high"),
        ])
    }

    fn mapper(scheme: ColorScheme, positions: usize, format: PixelFormat) -> ColorMapper {
        let config = ColorConfig {
            scheme,
            max_brightness: 1.0,
            ..ColorConfig::default()
        };
        ColorMapper::new(&config, positions, format, &three_bands()).unwrap()
    }

    fn features(loudness: f32, centroid_hz: f32, bandwidth_hz: f32) -> FeatureVector {
        FeatureVector {
            loudness,
            centroid_hz,
            bandwidth_hz,
            ..FeatureVector::silent(&three_bands())
        }
    }

    #[test]
    fn silence_is_uniform_silence_color() {
        for scheme in [ColorScheme::Centroid, ColorScheme::BandMeters] {
            let mapper = mapper(scheme, 30, PixelFormat::Rgb);
            let frame = mapper.map(&FeatureVector::silent(&three_bands()), 0);
            assert_eq!(frame.len(), 30);
            assert!(frame.pixels().iter().all(|pixel| *pixel == mapper.silence_color()));
        }
    }

    #[test]
    fn silence_color_uses_min_brightness_and_low_hue() {
        let config = ColorConfig {
            min_brightness: 0.2,
            ..ColorConfig::default()
        };
        let mapper = ColorMapper::new(&config, 4, PixelFormat::Rgb, &three_bands()).unwrap();
        assert_eq!(mapper.silence_color(), Color::rgb(51, 0, 0));
    }

    #[test]
    fn inverted_frequency_bounds_are_rejected() {
        let config = ColorConfig {
            low_hz: 20_000.0,
            high_hz: 20.0,
            ..ColorConfig::default()
        };
        let err = ColorMapper::new(&config, 4, PixelFormat::Rgb, &three_bands()).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn anchors_map_to_configured_hues() {
        let mapper = mapper(ColorScheme::Centroid, 1, PixelFormat::Rgb);
        assert!((mapper.hue_for(20.0) - 0.0).abs() < 1e-3);
        assert!((mapper.hue_for(1000.0) - 120.0).abs() < 1e-3);
        assert!((mapper.hue_for(20_000.0) - 240.0).abs() < 1e-3);
        assert_eq!(mapper.hue_for(5.0), mapper.hue_for(20.0));
        assert_eq!(mapper.hue_for(96_000.0), mapper.hue_for(20_000.0));
        assert_eq!(mapper.hue_for(f32::NAN), 0.0);
    }

    #[test]
    fn hue_is_monotonic_in_frequency() {
        let mapper = mapper(ColorScheme::Centroid, 1, PixelFormat::Rgb);
        let mut previous = f32::NEG_INFINITY;
        let mut frequency = 20.0_f32;
        while frequency <= 20_000.0 {
            let hue = mapper.hue_for(frequency);
            assert!(hue >= previous, "hue fell at {frequency} Hz");
            previous = hue;
            frequency *= 1.05;
        }
    }

    #[test]
    fn centroid_selects_primary() {
        let mapper = mapper(ColorScheme::Centroid, 9, PixelFormat::Rgb);
        let low = mapper.map(&features(1.0, 20.0, 0.0), 0);
        let mid = mapper.map(&features(1.0, 1000.0, 0.0), 1);
        let high = mapper.map(&features(1.0, 20_000.0, 0.0), 2);

        assert_eq!(low.pixels()[4], Color::rgb(255, 0, 0));
        assert_eq!(mid.pixels()[4], Color::rgb(0, 255, 0));
        assert_eq!(high.pixels()[4], Color::rgb(0, 0, 255));
    }

    #[test]
    fn mapping_is_deterministic() {
        let mapper = mapper(ColorScheme::Centroid, 16, PixelFormat::Rgbw);
        let input = features(0.6, 1700.0, 900.0);
        assert_eq!(mapper.map(&input, 3), mapper.map(&input, 3));
    }

    #[test]
    fn loudness_raises_brightness() {
        let mapper = mapper(ColorScheme::Centroid, 3, PixelFormat::Rgb);
        let quiet = mapper.map(&features(0.2, 1000.0, 0.0), 0);
        let loud = mapper.map(&features(0.9, 1000.0, 0.0), 0);
        assert!(loud.pixels()[1].g > quiet.pixels()[1].g);
    }

    #[test]
    fn bandwidth_spreads_hue_from_the_middle() {
        let mapper = mapper(ColorScheme::Centroid, 11, PixelFormat::Rgb);
        let frame = mapper.map(&features(1.0, 1000.0, 2000.0), 0);
        let pixels = frame.pixels();

        let left = pixels[0].hue_degrees().unwrap();
        let center = pixels[5].hue_degrees().unwrap();
        let right = pixels[10].hue_degrees().unwrap();
        assert!(left < center && center < right);
        assert!((center - 120.0).abs() < 1.0);
        assert_eq!(pixels[5], Color::rgb(0, 255, 0));
        // Edges are desaturated.
        assert!(pixels[0].b > 0 && pixels[10].r > 0);
    }

    #[test]
    fn rgbw_output_extracts_white() {
        let mapper = mapper(ColorScheme::Centroid, 5, PixelFormat::Rgbw);
        let frame = mapper.map(&features(1.0, 1000.0, 2000.0), 0);
        let edge = frame.pixels()[0];
        assert!(edge.w > 0);
        assert_eq!(edge.r.min(edge.g).min(edge.b), 0);
        assert_eq!(frame.format(), PixelFormat::Rgbw);
    }

    #[test]
    fn non_finite_input_is_total() {
        let mapper = mapper(ColorScheme::Centroid, 8, PixelFormat::Rgb);
        let frame = mapper.map(&features(f32::NAN, f32::INFINITY, f32::NAN), 0);
        assert!(frame.pixels().iter().all(|pixel| *pixel == mapper.silence_color()));

        let frame = mapper.map(&features(0.5, f32::NAN, f32::INFINITY), 0);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn band_meters_fill_their_segments() {
        let mapper = mapper(ColorScheme::BandMeters, 30, PixelFormat::Rgb);
        let mut input = FeatureVector::silent(&three_bands());
        input.loudness = 0.5;
        input.band_energies = vec![
            BandEnergy {
                label: Arc::from("bass"),
                energy: 0.0,
            },
            BandEnergy {
                label: Arc::from("mid"),
                energy: 0.5,
            },
            BandEnergy {
                label: Arc::from("high"),
                energy: 1.0,
            },
        ];

        let frame = mapper.map(&input, 0);
        let pixels = frame.pixels();
        let silence = mapper.silence_color();

        assert!(pixels[..10].iter().all(|pixel| *pixel == silence));
        assert!(pixels[10..15].iter().all(|pixel| *pixel != silence));
        assert!(pixels[15..20].iter().all(|pixel| *pixel == silence));
        assert!(pixels[20..30].iter().all(|pixel| *pixel != silence));
        assert!(pixels[20].hue_degrees() > pixels[10].hue_degrees());
    }
}
