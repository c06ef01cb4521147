/// Errors that can occur in server, client, and connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pipemux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] pipemux_frame::FrameError),

    /// The rendezvous handshake failed before a connection existed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No live connection to push to.
    #[error("not connected")]
    NotConnected,

    /// A background task could not be started.
    #[error("background task failed to start: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeerError>;
