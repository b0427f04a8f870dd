use std::{
    f64::consts::TAU,
    fs::File,
    io::BufReader,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use crate::{LightsError, Result};

#[cfg(feature = "live")]
mod live;

#[cfg(feature = "live")]
pub use live::{input_device_names, LiveCapture};

/// One fixed-length block of mono samples.
///
/// Blocks are immutable once produced. Ownership moves from the source into
/// the queue and from the queue into the consumer; nothing shares a block.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    sequence: u64,
    sample_rate: u32,
    samples: Box<[f32]>,
}

impl SampleBlock {
    pub fn new(sequence: u64, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sequence,
            sample_rate,
            samples: samples.into_boxed_slice(),
        }
    }

    /// Position of the block within its stream, starting at zero.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Stream time of the first sample, assuming every block of the stream
    /// shares this block's length.
    pub fn start_seconds(&self) -> f64 {
        self.sequence as f64 * self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Pull-based supplier of sample blocks.
///
/// Sample rate and block length are fixed for the lifetime of the source.
/// `Ok(None)` signals the end of the stream.
pub trait FrameSource {
    fn sample_rate(&self) -> u32;

    fn block_len(&self) -> usize;

    fn next_block(&mut self) -> Result<Option<SampleBlock>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn block_len(&self) -> usize {
        (**self).block_len()
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>> {
        (**self).next_block()
    }
}

/// Synthetic sine generator, handy for calibration and tests.
#[derive(Debug, Clone)]
pub struct ToneSource {
    sample_rate: u32,
    block_len: usize,
    frequency_hz: f64,
    amplitude: f32,
    limit: Option<u64>,
    next_sequence: u64,
}

impl ToneSource {
    pub fn new(sample_rate: u32, block_len: usize, frequency_hz: f32, amplitude: f32) -> Self {
        Self {
            sample_rate,
            block_len,
            frequency_hz: frequency_hz as f64,
            amplitude,
            limit: None,
            next_sequence: 0,
        }
    }

    /// Ends the stream after `blocks` blocks.
    pub fn with_limit(mut self, blocks: u64) -> Self {
        self.limit = Some(blocks);
        self
    }
}

impl FrameSource for ToneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn block_len(&self) -> usize {
        self.block_len
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>> {
        if self.limit.is_some_and(|limit| self.next_sequence >= limit) {
            return Ok(None);
        }

        let start = self.next_sequence * self.block_len as u64;
        let step = TAU * self.frequency_hz / self.sample_rate.max(1) as f64;
        let samples = (0..self.block_len as u64)
            .map(|n| ((start + n) as f64 * step).sin() as f32 * self.amplitude)
            .collect();

        let block = SampleBlock::new(self.next_sequence, self.sample_rate, samples);
        self.next_sequence += 1;
        Ok(Some(block))
    }
}

/// File-backed source that decodes a WAV file up front and serves it in
/// fixed-length mono blocks.
#[derive(Debug)]
pub struct WavSource {
    sample_rate: u32,
    block_len: usize,
    samples: Vec<f32>,
    position: usize,
    looping: bool,
    next_sequence: u64,
}

impl WavSource {
    /// Opens and decodes `path`. Multi-channel files are averaged to mono.
    pub fn open(path: impl AsRef<Path>, block_len: usize) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)?;
        let source = Self::from_reader(reader, block_len)?;
        tracing::info!(
            path = %path.display(),
            sample_rate = source.sample_rate,
            seconds = source.duration_seconds(),
            "decoded wav input"
        );
        Ok(source)
    }

    fn from_reader(reader: hound::WavReader<BufReader<File>>, block_len: usize) -> Result<Self> {
        if block_len == 0 {
            return Err(LightsError::config("block length must be positive"));
        }

        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));
        let interleaved = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 * scale))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(Self {
            sample_rate: spec.sample_rate,
            block_len,
            samples: downmix(&interleaved, channels),
            position: 0,
            looping: false,
            next_sequence: 0,
        })
    }

    /// Restarts from the beginning instead of ending the stream.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn duration_seconds(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate.max(1) as f32
    }
}

impl FrameSource for WavSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn block_len(&self) -> usize {
        self.block_len
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>> {
        if self.position >= self.samples.len() {
            if !self.looping || self.samples.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }

        let end = (self.position + self.block_len).min(self.samples.len());
        let mut block = Vec::with_capacity(self.block_len);
        block.extend_from_slice(&self.samples[self.position..end]);
        block.resize(self.block_len, 0.0);
        self.position = end;

        let block = SampleBlock::new(self.next_sequence, self.sample_rate, block);
        self.next_sequence += 1;
        Ok(Some(block))
    }
}

/// Releases blocks from the wrapped source no faster than real time, the way
/// a capture device would deliver them.
#[derive(Debug)]
pub struct Paced<S> {
    inner: S,
    block_duration: Duration,
    started: Option<Instant>,
    delivered: u32,
}

impl<S: FrameSource> Paced<S> {
    pub fn new(inner: S) -> Self {
        let seconds = inner.block_len() as f64 / inner.sample_rate().max(1) as f64;
        Self {
            inner,
            block_duration: Duration::from_secs_f64(seconds),
            started: None,
            delivered: 0,
        }
    }
}

impl<S: FrameSource> FrameSource for Paced<S> {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn block_len(&self) -> usize {
        self.inner.block_len()
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + self.block_duration * self.delivered;
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }

        let block = self.inner.next_block()?;
        if block.is_some() {
            self.delivered = self.delivered.saturating_add(1);
        }
        Ok(block)
    }
}

/// Regroups interleaved device samples into fixed-length mono blocks.
///
/// Capture callbacks deliver buffers of whatever size the driver picked; the
/// assembler averages each interleaved frame down to one sample and hands out
/// a block every `block_len` frames.
#[derive(Debug)]
pub struct BlockAssembler {
    channels: usize,
    block_len: usize,
    pending: Vec<f32>,
    frame_sum: f32,
    channel: usize,
}

impl BlockAssembler {
    pub fn new(channels: usize, block_len: usize) -> Self {
        Self {
            channels: channels.max(1),
            block_len: block_len.max(1),
            pending: Vec::with_capacity(block_len),
            frame_sum: 0.0,
            channel: 0,
        }
    }

    /// Accepts one interleaved sample and returns a block once one is full.
    pub fn push_sample(&mut self, sample: f32) -> Option<Vec<f32>> {
        self.frame_sum += if sample.is_finite() { sample } else { 0.0 };
        self.channel += 1;
        if self.channel < self.channels {
            return None;
        }

        self.pending.push(self.frame_sum / self.channels as f32);
        self.frame_sum = 0.0;
        self.channel = 0;

        if self.pending.len() < self.block_len {
            return None;
        }
        Some(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.block_len),
        ))
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wav(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("spectrum-lights-{}-{name}.wav", std::process::id()))
    }

    #[test]
    fn tone_source_produces_fixed_blocks_until_limit() {
        let mut source = ToneSource::new(8000, 64, 440.0, 0.5).with_limit(3);

        let mut sequences = Vec::new();
        while let Some(block) = source.next_block().unwrap() {
            assert_eq!(block.len(), 64);
            assert!(block.samples().iter().all(|s| s.abs() <= 0.5));
            sequences.push(block.sequence());
        }

        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn tone_source_keeps_phase_across_blocks() {
        let mut split = ToneSource::new(8000, 32, 300.0, 1.0);
        let mut whole = ToneSource::new(8000, 64, 300.0, 1.0);

        let first = split.next_block().unwrap().unwrap();
        let second = split.next_block().unwrap().unwrap();
        let joined: Vec<f32> = first.samples().iter().chain(second.samples()).copied().collect();

        let reference = whole.next_block().unwrap().unwrap();
        for (a, b) in joined.iter().zip(reference.samples()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn wav_source_downmixes_and_pads_final_block() {
        let path = temp_wav("stereo");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(0_i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavSource::open(&path, 64).unwrap();
        assert_eq!(source.sample_rate(), 8000);

        let first = source.next_block().unwrap().unwrap();
        assert!(first.samples().iter().all(|s| (s - 0.25).abs() < 1e-3));

        let second = source.next_block().unwrap().unwrap();
        assert_eq!(second.len(), 64);
        assert!((second.samples()[35] - 0.25).abs() < 1e-3);
        assert_eq!(second.samples()[36], 0.0);

        assert!(source.next_block().unwrap().is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn looping_wav_source_restarts() {
        let path = temp_wav("loop");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..32 {
            writer.write_sample(i as f32 / 32.0).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavSource::open(&path, 32).unwrap().looping(true);
        for expected in 0..4 {
            let block = source.next_block().unwrap().unwrap();
            assert_eq!(block.sequence(), expected);
            assert_eq!(block.samples()[1], 1.0 / 32.0);
        }
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn paced_source_waits_for_block_duration() {
        let mut paced = Paced::new(ToneSource::new(1000, 10, 50.0, 1.0).with_limit(3));
        let started = Instant::now();
        while paced.next_block().unwrap().is_some() {}
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn assembler_averages_channels_into_blocks() {
        let mut assembler = BlockAssembler::new(2, 3);
        let interleaved = [1.0, 0.0, 0.5, 0.5, 0.0, 0.0, 1.0, 1.0];

        let blocks: Vec<Vec<f32>> = interleaved
            .iter()
            .filter_map(|&sample| assembler.push_sample(sample))
            .collect();

        assert_eq!(blocks, vec![vec![0.5, 0.5, 0.0]]);
        assert_eq!(assembler.pending, vec![1.0]);
    }
}
