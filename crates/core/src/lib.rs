//! Core library for Spectrum Lights.
//!
//! Turns a stream of mono audio blocks into color frames for addressable
//! light strips. Each module owns one stage of the pipeline (capture,
//! buffering, spectral analysis, feature extraction, smoothing, color
//! mapping, output) and [`PipelineDriver`] wires them together across a
//! producer and a consumer thread.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod features;
pub mod mapping;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod render;
pub mod smoothing;
pub mod timeline;

pub use analysis::{SpectralAnalyzer, Spectrum, WindowFunction};
#[cfg(feature = "live")]
pub use audio::{input_device_names, LiveCapture};
pub use audio::{BlockAssembler, FrameSource, Paced, SampleBlock, ToneSource, WavSource};
pub use config::{
    AnalysisConfig, AudioConfig, BandReference, ColorConfig, DriverConfig, FeatureConfig,
    OutputConfig, PipelineConfig, SmoothingConfig,
};
pub use error::{LightsError, Result};
pub use features::{Band, BandEnergy, BandTable, FeatureExtractor, FeatureVector};
pub use mapping::{ColorMapper, ColorScheme};
pub use pipeline::{BlockProducer, EndReason, Pipeline, PipelineDriver, RunReport, ShutdownHandle};
pub use queue::{BoundedFrameQueue, Popped, Pushed, QueueClosed, QueueStats};
pub use record::{FeatureRecord, FeatureRecorder};
pub use render::{
    AnsiSink, Color, ColorFrame, LatestFrameSink, MemorySink, NullSink, OutputSink, PixelFormat,
};
pub use smoothing::Smoother;
pub use timeline::{FrameClock, StallMonitor};
