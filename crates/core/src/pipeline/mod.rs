//! The per-block processing chain and the two-context driver around it.
//!
//! A producer context (a source thread or a device callback) pushes blocks
//! into the bounded queue; the consumer context owns every processing stage
//! and the sink. Closing the queue is the shutdown signal.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    features::rms, BoundedFrameQueue, ColorFrame, ColorMapper, FeatureExtractor, FeatureVector,
    FrameClock, FrameSource, LightsError, OutputSink, PipelineConfig, Popped, Result, SampleBlock,
    Smoother, SpectralAnalyzer, StallMonitor,
};

/// Analyzer, extractor, smoother and mapper for one audio stream.
///
/// Everything here is owned by the consumer context; nothing is shared with
/// the producer.
#[derive(Debug)]
pub struct Pipeline {
    sample_rate: u32,
    block_len: usize,
    input_gain: f32,
    noise_gate: f32,
    analyzer: SpectralAnalyzer,
    extractor: FeatureExtractor,
    smoother: Smoother,
    mapper: ColorMapper,
    conditioned: Vec<f32>,
    gated_blocks: u64,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let analyzer = SpectralAnalyzer::from_config(config)?;
        let extractor = FeatureExtractor::from_config(config, &analyzer.frequencies());
        let smoother = Smoother::new(config.smoothing.clone(), &config.bands);
        let mapper = ColorMapper::from_config(config)?;

        Ok(Self {
            sample_rate: config.audio.sample_rate,
            block_len: config.audio.block_len,
            input_gain: config.audio.input_gain,
            noise_gate: config.audio.noise_gate,
            analyzer,
            extractor,
            smoother,
            mapper,
            conditioned: vec![0.0; config.audio.block_len],
            gated_blocks: 0,
        })
    }

    /// Runs one block through every stage and returns its color frame.
    pub fn process(&mut self, block: &SampleBlock) -> Result<ColorFrame> {
        if block.sample_rate() != self.sample_rate {
            return Err(LightsError::SampleRate {
                expected: self.sample_rate,
                actual: block.sample_rate(),
            });
        }
        if block.len() != self.block_len {
            return Err(LightsError::BlockLength {
                expected: self.block_len,
                actual: block.len(),
            });
        }

        for (out, sample) in self.conditioned.iter_mut().zip(block.samples()) {
            *out = sample * self.input_gain;
        }
        if rms(&self.conditioned) < self.noise_gate {
            self.conditioned.fill(0.0);
            self.gated_blocks += 1;
        }

        let spectrum = self.analyzer.analyze(&self.conditioned)?;
        let features = self.extractor.extract(&self.conditioned, spectrum);
        let smoothed = self.smoother.apply(&features);
        Ok(self.mapper.map(smoothed, block.sequence()))
    }

    /// Smoothed features of the most recent block.
    pub fn features(&self) -> &FeatureVector {
        self.smoother.state()
    }

    pub fn analyzer(&self) -> &SpectralAnalyzer {
        &self.analyzer
    }

    pub fn mapper(&self) -> &ColorMapper {
        &self.mapper
    }

    pub fn zero_guard_hits(&self) -> u64 {
        self.extractor.zero_guard_hits()
    }

    /// Blocks silenced by the noise gate.
    pub fn gated_blocks(&self) -> u64 {
        self.gated_blocks
    }

    /// Clears all per-stream state for a fresh stream.
    pub fn reset(&mut self) {
        self.analyzer.reset();
        self.extractor.reset();
        self.smoother.reset();
        self.gated_blocks = 0;
    }
}

/// Producer-side handle onto the driver's queue. Cheap to clone; clones
/// share one sequence counter.
#[derive(Debug, Clone)]
pub struct BlockProducer {
    queue: Arc<BoundedFrameQueue>,
    sample_rate: u32,
    next_sequence: Arc<AtomicU64>,
}

impl BlockProducer {
    /// Wraps raw samples in a block with the next sequence number and
    /// enqueues it. Returns `false` once the queue no longer accepts blocks.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.push_block(SampleBlock::new(sequence, self.sample_rate, samples))
    }

    /// Enqueues a block that already carries its sequence number.
    pub fn push_block(&self, block: SampleBlock) -> bool {
        self.queue.push(block).is_ok()
    }

    /// Marks the end of the stream; queued blocks are still processed.
    pub fn finish(&self) {
        self.queue.finish();
    }

    fn abort(&self) {
        self.queue.close();
    }
}

/// Stops a running driver from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    queue: Arc<BoundedFrameQueue>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Closes the queue. The block being processed, if any, still reaches the
    /// sink; anything queued behind it is discarded. Idempotent.
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.queue.close();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    SourceExhausted,
    Shutdown,
}

/// Summary of one driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub blocks_processed: u64,
    pub frames_presented: u64,
    /// Frames computed but withheld from the sink by the frame-rate limit.
    pub frames_throttled: u64,
    pub overruns: u64,
    pub discarded_on_close: u64,
    pub stalls: u64,
    pub zero_guard_hits: u64,
    pub gated_blocks: u64,
    pub end: EndReason,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_processed: u64,
    frames_presented: u64,
    frames_throttled: u64,
}

/// Couples a frame source to an output sink through the bounded queue.
#[derive(Debug)]
pub struct PipelineDriver {
    pipeline: Pipeline,
    queue: Arc<BoundedFrameQueue>,
    shutdown: ShutdownHandle,
    producer: BlockProducer,
    max_fps: Option<u32>,
    stall_timeout: Duration,
}

impl PipelineDriver {
    /// Validates `config` and builds every stage. Nothing runs until
    /// [`run`](Self::run) or [`consume`](Self::consume).
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let pipeline = Pipeline::new(config)?;
        let queue = Arc::new(BoundedFrameQueue::new(config.driver.queue_capacity));
        let shutdown = ShutdownHandle {
            queue: Arc::clone(&queue),
            requested: Arc::new(AtomicBool::new(false)),
        };
        let producer = BlockProducer {
            queue: Arc::clone(&queue),
            sample_rate: config.audio.sample_rate,
            next_sequence: Arc::new(AtomicU64::new(0)),
        };

        Ok(Self {
            pipeline,
            queue,
            shutdown,
            producer,
            max_fps: config.driver.max_fps,
            stall_timeout: Duration::from_millis(config.driver.stall_timeout_ms),
        })
    }

    /// Handle for callback-driven sources such as live capture.
    pub fn producer(&self) -> BlockProducer {
        self.producer.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Pulls blocks from `source` on a dedicated thread and processes them on
    /// the calling thread until the source ends or shutdown is requested.
    pub fn run<S, K>(self, source: S, sink: K) -> Result<RunReport>
    where
        S: FrameSource + Send + 'static,
        K: OutputSink,
    {
        let expected_rate = self.pipeline.sample_rate;
        if source.sample_rate() != expected_rate {
            return Err(LightsError::SampleRate {
                expected: expected_rate,
                actual: source.sample_rate(),
            });
        }
        if source.block_len() != self.pipeline.block_len {
            return Err(LightsError::BlockLength {
                expected: self.pipeline.block_len,
                actual: source.block_len(),
            });
        }

        let producer = self.producer();
        let source_thread = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || produce(source, producer))?;

        let consumed = self.consume(sink);
        let produced = source_thread
            .join()
            .unwrap_or_else(|_| Err(LightsError::msg("frame source thread panicked")));

        let report = consumed?;
        produced?;
        Ok(report)
    }

    /// Processes whatever the producer handles deliver until the queue is
    /// finished or closed.
    pub fn consume<K: OutputSink>(mut self, mut sink: K) -> Result<RunReport> {
        tracing::info!(
            capacity = self.queue.capacity(),
            max_fps = ?self.max_fps,
            positions = self.pipeline.mapper.positions(),
            "pipeline started"
        );

        let mut counters = Counters::default();
        let mut stall = StallMonitor::new(self.stall_timeout);
        let outcome = self.consume_loop(&mut sink, &mut counters, &mut stall);
        if outcome.is_err() {
            // Unblocks the producer side.
            self.queue.close();
        }
        let end = outcome?;

        let queue = self.queue.stats();
        let report = RunReport {
            blocks_processed: counters.blocks_processed,
            frames_presented: counters.frames_presented,
            frames_throttled: counters.frames_throttled,
            overruns: queue.overruns,
            discarded_on_close: queue.discarded_on_close,
            stalls: stall.stalls(),
            zero_guard_hits: self.pipeline.zero_guard_hits(),
            gated_blocks: self.pipeline.gated_blocks(),
            end,
        };
        tracing::info!(?report, "pipeline stopped");
        Ok(report)
    }

    fn consume_loop<K: OutputSink>(
        &mut self,
        sink: &mut K,
        counters: &mut Counters,
        stall: &mut StallMonitor,
    ) -> Result<EndReason> {
        let mut clock = FrameClock::new(self.max_fps);
        // Newest frame withheld by the clock, presented if the stream ends
        // before the next one is due.
        let mut withheld: Option<ColorFrame> = None;

        let end = loop {
            match self.queue.pop_timeout(stall.timeout()) {
                Popped::Item(block) => {
                    stall.on_block(Instant::now());
                    let frame = self.pipeline.process(&block)?;
                    counters.blocks_processed += 1;

                    if clock.should_present(Instant::now()) {
                        if withheld.take().is_some() {
                            counters.frames_throttled += 1;
                        }
                        sink.present(frame)?;
                        counters.frames_presented += 1;
                    } else if withheld.replace(frame).is_some() {
                        counters.frames_throttled += 1;
                    }
                }
                Popped::TimedOut => {
                    stall.on_timeout(Instant::now());
                }
                Popped::Closed if self.shutdown.is_requested() => break EndReason::Shutdown,
                Popped::Closed => break EndReason::SourceExhausted,
            }
        };

        if let Some(frame) = withheld {
            sink.present(frame)?;
            counters.frames_presented += 1;
        }
        Ok(end)
    }
}

fn produce<S: FrameSource>(mut source: S, producer: BlockProducer) -> Result<()> {
    loop {
        match source.next_block() {
            Ok(Some(block)) => {
                if !producer.push_block(block) {
                    tracing::debug!("queue closed, frame source stopping");
                    return Ok(());
                }
            }
            Ok(None) => {
                tracing::debug!("frame source exhausted");
                producer.finish();
                return Ok(());
            }
            Err(err) => {
                tracing::error!(%err, "frame source failed");
                producer.abort();
                return Err(err);
            }
        }
    }
}
