/// Result alias that carries the custom [`BeatLightError`] type.
pub type Result<T> = std::result::Result<T, BeatLightError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatLightError {
    /// A tap sequence or typed tempo that cannot drive the beat grid. The
    /// scheduler keeps the previous tempo when it sees this.
    #[error("invalid tempo: {0}")]
    InvalidTempo(String),
    /// The device API did not answer in time or refused the connection.
    #[error("device API at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    /// The device API answered, but not with a success.
    #[error("device API rejected the command ({status}): {body}")]
    Device { status: u16, body: String },
    /// Missing or malformed startup configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid color `{0}`")]
    InvalidColor(String),
    #[error("{0}")]
    Message(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BeatLightError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn invalid_tempo<T: Into<String>>(reason: T) -> Self {
        Self::InvalidTempo(reason.into())
    }

    pub fn config<T: Into<String>>(reason: T) -> Self {
        Self::Configuration(reason.into())
    }

    /// Returns `true` for failures that only cost a single beat.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Device { .. } | Self::Http(_)
        )
    }
}

impl From<&str> for BeatLightError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatLightError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
