/// Failure to produce the next frame.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// The source has no more frames and never will.
    #[error("frame source exhausted")]
    Exhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode frame: {detail}")]
    Decode { detail: String },
}

/// Failure to persist a frame.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {detail}")]
    Encode { detail: String },
}

/// Terminal failure of one capture loop.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("frame source unavailable after {attempts} consecutive failures")]
    SourceUnavailable {
        attempts: u32,
        #[source]
        last: SourceError,
    },

    #[error("capture thread panicked")]
    Panicked,
}
