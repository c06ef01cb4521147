/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The value could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// A text frame did not decode as UTF-16.
    #[error("text frame is not valid UTF-16: {0}")]
    InvalidText(#[from] std::string::FromUtf16Error),

    /// The string does not fit in the fixed-size text frame.
    #[error("text too long for frame ({len} bytes, max {max})")]
    TextTooLong { len: usize, max: usize },

    /// The stream ended partway through a frame header.
    #[error("frame header truncated (expected {expected} bytes, read {read})")]
    TruncatedHeader { expected: usize, read: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
