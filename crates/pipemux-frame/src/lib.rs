//! Typed message framing for pipemux channels.
//!
//! Turns one serializable value into one wire frame and back:
//! - generic values (opted in via [`BinaryMessage`]) use a 4-byte
//!   big-endian length prefix followed by a bincode payload;
//! - `String` uses a fixed 1024-byte UTF-16LE frame with NUL padding and
//!   no length prefix (the handshake wire format).
//!
//! A `None` from any read is the single contract for "peer closed the
//! channel, stop reading."

pub mod channel;
pub mod error;
pub mod reader;
pub mod writer;
pub mod wire;

pub use channel::FramedChannel;
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
pub use wire::{BinaryMessage, Wire, LENGTH_PREFIX_LEN, TEXT_FRAME_LEN};
