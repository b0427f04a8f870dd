//! Color frames and the sinks that present them.

use std::{
    io::Write,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::{LightsError, Result};

/// Channel layout of the output hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Rgb,
    /// RGB plus a dedicated white channel.
    Rgbw,
}

/// One output color. `w` stays zero for RGB output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub w: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, w: 0 }
    }

    /// Quantises unit-range channels. For RGBW the common component of the
    /// three colors moves to the white channel.
    pub fn from_unit(r: f32, g: f32, b: f32, format: PixelFormat) -> Self {
        let (r, g, b) = (to_byte(r), to_byte(g), to_byte(b));
        match format {
            PixelFormat::Rgb => Self::rgb(r, g, b),
            PixelFormat::Rgbw => {
                let w = r.min(g).min(b);
                Self {
                    r: r - w,
                    g: g - w,
                    b: b - w,
                    w,
                }
            }
        }
    }

    /// Hue in degrees of the RGB part, or `None` for grays.
    pub fn hue_degrees(&self) -> Option<f32> {
        let (r, g, b) = (self.r as f32, self.g as f32, self.b as f32);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;
        if delta <= 0.0 {
            return None;
        }

        let sector = if max == r {
            ((g - b) / delta).rem_euclid(6.0)
        } else if max == g {
            (b - r) / delta + 2.0
        } else {
            (r - g) / delta + 4.0
        };
        Some(sector * 60.0)
    }
}

fn to_byte(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Colors for every addressable position of one output cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorFrame {
    sequence: u64,
    format: PixelFormat,
    pixels: Vec<Color>,
}

impl ColorFrame {
    pub fn new(sequence: u64, format: PixelFormat, pixels: Vec<Color>) -> Self {
        Self {
            sequence,
            format,
            pixels,
        }
    }

    /// Sequence number of the audio block this frame was derived from.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<Color> {
        self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Destination for finished frames, typically a light-strip transport.
///
/// Implementations receive ownership of each frame. A sink that applies
/// back-pressure should be wrapped in [`LatestFrameSink`] so the pipeline
/// never waits on it.
pub trait OutputSink {
    fn present(&mut self, frame: ColorFrame) -> Result<()>;
}

impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    fn present(&mut self, frame: ColorFrame) -> Result<()> {
        (**self).present(frame)
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn present(&mut self, frame: ColorFrame) -> Result<()> {
        (**self).present(frame)
    }
}

/// Discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn present(&mut self, _frame: ColorFrame) -> Result<()> {
        Ok(())
    }
}

/// Keeps every frame in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub frames: Vec<ColorFrame>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&ColorFrame> {
        self.frames.last()
    }
}

impl OutputSink for MemorySink {
    fn present(&mut self, frame: ColorFrame) -> Result<()> {
        self.frames.push(frame);
        Ok(())
    }
}

/// Terminal preview: draws each frame as one line of 24-bit colored cells,
/// redrawn in place.
#[derive(Debug)]
pub struct AnsiSink<W> {
    writer: W,
    columns: usize,
}

impl<W: Write> AnsiSink<W> {
    pub fn new(writer: W, columns: usize) -> Self {
        Self {
            writer,
            columns: columns.max(1),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for AnsiSink<W> {
    fn present(&mut self, frame: ColorFrame) -> Result<()> {
        let pixels = frame.pixels();
        if pixels.is_empty() {
            return Ok(());
        }

        let columns = self.columns.min(pixels.len());
        let mut line = String::with_capacity(columns * 20 + 8);
        line.push('\r');
        for column in 0..columns {
            let pixel = pixels[column * pixels.len() / columns];
            // White is folded back in so RGBW frames preview faithfully.
            let r = pixel.r.saturating_add(pixel.w);
            let g = pixel.g.saturating_add(pixel.w);
            let b = pixel.b.saturating_add(pixel.w);
            line.push_str(&format!("\x1b[48;2;{r};{g};{b}m "));
        }
        line.push_str("\x1b[0m");

        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Runs a slow sink on its own thread with latest-frame-wins hand-off.
///
/// At most one frame waits for the worker. When a newer frame arrives before
/// the worker picked up the waiting one, the waiting frame is replaced.
#[derive(Debug)]
pub struct LatestFrameSink {
    sender: Option<Sender<ColorFrame>>,
    stale: Receiver<ColorFrame>,
    worker: Option<JoinHandle<Result<()>>>,
    replaced: u64,
}

impl LatestFrameSink {
    pub fn spawn<S>(mut inner: S) -> Result<Self>
    where
        S: OutputSink + Send + 'static,
    {
        let (sender, receiver) = bounded::<ColorFrame>(1);
        let stale = receiver.clone();
        let worker = thread::Builder::new()
            .name("output-sink".into())
            .spawn(move || {
                for frame in receiver.iter() {
                    inner.present(frame)?;
                }
                Ok(())
            })?;

        Ok(Self {
            sender: Some(sender),
            stale,
            worker: Some(worker),
            replaced: 0,
        })
    }

    /// Frames overwritten before the worker could present them.
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    /// Stops accepting frames, waits for the worker to present the last one
    /// and reports its failure, if any.
    pub fn finish(mut self) -> Result<()> {
        self.sender.take();
        match self.worker.take() {
            Some(worker) => join_worker(worker),
            None => Ok(()),
        }
    }

    fn worker_failure(&mut self) -> LightsError {
        self.sender.take();
        match self.worker.take().map(join_worker) {
            Some(Err(err)) => err,
            _ => LightsError::msg("output worker stopped"),
        }
    }
}

impl OutputSink for LatestFrameSink {
    fn present(&mut self, frame: ColorFrame) -> Result<()> {
        if self.worker.as_ref().is_some_and(|worker| worker.is_finished()) {
            return Err(self.worker_failure());
        }
        let Some(sender) = self.sender.as_ref() else {
            return Err(LightsError::msg("output worker stopped"));
        };

        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                if self.stale.try_recv().is_ok() {
                    self.replaced += 1;
                }
                match sender.try_send(frame) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        self.replaced += 1;
                        Ok(())
                    }
                    Err(TrySendError::Disconnected(_)) => Err(self.worker_failure()),
                }
            }
            Err(TrySendError::Disconnected(_)) => Err(self.worker_failure()),
        }
    }
}

impl Drop for LatestFrameSink {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if let Err(err) = join_worker(worker) {
                tracing::warn!(%err, "output worker failed during shutdown");
            }
        }
    }
}

fn join_worker(worker: JoinHandle<Result<()>>) -> Result<()> {
    worker
        .join()
        .unwrap_or_else(|_| Err(LightsError::msg("output worker panicked")))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    struct SlowSink {
        seen: Arc<Mutex<Vec<u64>>>,
        delay: Duration,
    }

    impl OutputSink for SlowSink {
        fn present(&mut self, frame: ColorFrame) -> Result<()> {
            thread::sleep(self.delay);
            self.seen.lock().unwrap().push(frame.sequence());
            Ok(())
        }
    }

    struct FailingSink;

    impl OutputSink for FailingSink {
        fn present(&mut self, _frame: ColorFrame) -> Result<()> {
            Err(LightsError::msg("strip unplugged"))
        }
    }

    fn frame(sequence: u64) -> ColorFrame {
        ColorFrame::new(sequence, PixelFormat::Rgb, vec![Color::rgb(255, 0, 0); 4])
    }

    #[test]
    fn rgbw_moves_common_component_to_white() {
        let color = Color::from_unit(1.0, 0.5, 0.5, PixelFormat::Rgbw);
        assert_eq!(color, Color { r: 127, g: 0, b: 0, w: 128 });

        let color = Color::from_unit(1.0, 0.5, 0.5, PixelFormat::Rgb);
        assert_eq!(color, Color::rgb(255, 128, 128));
    }

    #[test]
    fn quantisation_clamps_and_rejects_nan() {
        assert_eq!(
            Color::from_unit(2.0, -1.0, f32::NAN, PixelFormat::Rgb),
            Color::rgb(255, 0, 0)
        );
    }

    #[test]
    fn hue_of_primaries() {
        assert_eq!(Color::rgb(255, 0, 0).hue_degrees(), Some(0.0));
        assert_eq!(Color::rgb(0, 255, 0).hue_degrees(), Some(120.0));
        assert_eq!(Color::rgb(0, 0, 255).hue_degrees(), Some(240.0));
        assert_eq!(Color::rgb(40, 40, 40).hue_degrees(), None);
    }

    #[test]
    fn latest_frame_wins_under_back_pressure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sink = LatestFrameSink::spawn(SlowSink {
            seen: Arc::clone(&seen),
            delay: Duration::from_millis(10),
        })
        .unwrap();

        for sequence in 0..50 {
            sink.present(frame(sequence)).unwrap();
        }
        let replaced = sink.replaced();
        sink.finish().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last(), Some(&49));
        assert!(replaced > 0);
        assert_eq!(seen.len() as u64 + replaced, 50);
    }

    #[test]
    fn latest_frame_sink_surfaces_worker_errors() {
        let mut sink = LatestFrameSink::spawn(FailingSink).unwrap();
        sink.present(frame(0)).unwrap();
        thread::sleep(Duration::from_millis(50));

        let err = sink.present(frame(1)).unwrap_err();
        assert_eq!(err.to_string(), "strip unplugged");
    }

    #[test]
    fn ansi_sink_draws_one_cell_per_column() {
        let mut sink = AnsiSink::new(Vec::new(), 2);
        sink.present(frame(0)).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert!(output.starts_with('\r'));
        assert_eq!(output.matches("\x1b[48;2;255;0;0m ").count(), 2);
        assert!(output.ends_with("\x1b[0m"));
    }
}
