use thiserror::Error;

/// All errors produced by voicegraph-core.
#[derive(Debug, Error)]
pub enum VoicegraphError {
    /// The attempt was superseded by a newer one (or explicitly aborted).
    /// Expected during normal operation — never surface as a user failure.
    #[error("generation superseded by a newer request")]
    Cancelled,

    #[error("generation timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("engine load error: {0}")]
    EngineLoad(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoicegraphError {
    /// Whether this error means "superseded, ignore" rather than a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error means the wall-clock budget was exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, VoicegraphError>;
