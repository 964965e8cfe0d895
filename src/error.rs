use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed task description, raised before any resource is opened.
    #[error("build error: {0}")]
    Build(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// Both backends rejected the configuration of a substream.
    #[error("stream {stream}: no backend accepted the configuration: {message}")]
    BackendConfig { stream: usize, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("pipeline cancelled")]
    Cancelled,
}

impl Error {
    pub fn build(msg: impl Into<String>) -> Self {
        Error::Build(msg.into())
    }

    pub fn stream(msg: impl std::fmt::Display) -> Self {
        Error::Stream(msg.to_string())
    }
}
