/// Result alias that carries the custom [`LightsError`] type.
pub type Result<T> = std::result::Result<T, LightsError>;

/// Common error type for the core crate.
///
/// Steady-state conditions (silence, queue overruns, zero-energy spectra) are
/// never reported through this type. They are counted where they happen and
/// surfaced through the run report instead.
#[derive(Debug, thiserror::Error)]
pub enum LightsError {
    /// Invalid configuration detected before any frame is processed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A frame source produced a block that does not match its declared length.
    #[error("block length mismatch: expected {expected} samples, got {actual}")]
    BlockLength { expected: usize, actual: usize },
    /// A frame source runs at a different rate than the pipeline was built for.
    #[error("sample rate mismatch: pipeline expects {expected} Hz, source delivers {actual} Hz")]
    SampleRate { expected: u32, actual: u32 },
    #[error("fft failure: {0}")]
    Fft(#[from] realfft::FftError),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("wav decoding failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Audio capture device failure.
    #[error("audio device: {0}")]
    Device(String),
    #[error("{0}")]
    Message(String),
}

impl LightsError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates a configuration error.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    /// Returns `true` when the error was raised by configuration validation.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
