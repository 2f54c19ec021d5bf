/// Result alias that carries the custom [`LightshowError`] type.
pub type Result<T> = std::result::Result<T, LightshowError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LightshowError {
    /// Free-form message for failures that have no dedicated variant.
    #[error("{0}")]
    Message(String),
    /// The configuration is unusable as a whole (not a per-fixture defect).
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The ring buffer has not yet accumulated enough samples.
    #[error("insufficient audio data: need {needed} samples, have {available}")]
    InsufficientData { needed: usize, available: usize },
    /// A numerical step of the feature extractor failed for one tick.
    #[error("analysis failed: {0}")]
    Analysis(String),
    /// The effects engine could not compute a tick.
    #[error("effects update failed: {0}")]
    Effects(String),
    /// The serial sink rejected a configuration change or a write.
    #[error("serial sink error: {0}")]
    Serial(#[source] std::io::Error),
    /// A worker thread could not be spawned or joined.
    #[error("thread error: {0}")]
    Thread(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration (de)serialisation failure.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LightshowError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for LightshowError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LightshowError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for LightshowError {
    fn from(value: realfft::FftError) -> Self {
        Self::Analysis(value.to_string())
    }
}
