//! Multi-client typed messaging over named local channels.
//!
//! pipemux lets one process serve many concurrent peers on a single
//! well-known channel name. The transport allows exactly one peer per
//! channel instance, so the server hands each client a private channel
//! via a rendezvous handshake; every connection then runs its own duplex
//! messaging engine exchanging typed values.
//!
//! # Crate Structure
//!
//! - [`transport`] — Named channel primitive (Unix domain sockets)
//! - [`frame`] — Typed wire formats: length-prefixed binary frames and
//!   the fixed-size text frame
//! - [`peer`] — Server, client, connection engine, and notifications

/// Re-export transport types.
pub mod transport {
    pub use pipemux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pipemux_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use pipemux_peer::*;
}
