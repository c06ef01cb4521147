use pipemux_transport::{ChannelStream, TransportError};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::reader::FrameReader;
use crate::writer::FrameWriter;
use crate::wire::Wire;

/// A typed duplex view over one [`ChannelStream`].
///
/// Reads values of type `R` and writes values of type `W` (the two types
/// are often the same). `write_value` blocks until the peer has drained
/// the written bytes, which sequences a write against a following close
/// and provides backpressure on large messages.
pub struct FramedChannel<R, W> {
    reader: FrameReader<R, ChannelStream>,
    writer: FrameWriter<W, ChannelStream>,
    control: ChannelStream,
}

impl<R: Wire, W: Wire> FramedChannel<R, W> {
    /// Wrap a connected stream.
    pub fn new(stream: ChannelStream) -> Result<Self> {
        let control = stream.try_clone().map_err(transport_to_frame)?;
        let reader = FrameReader::new(stream.try_clone().map_err(transport_to_frame)?);
        let writer = FrameWriter::new(stream);
        Ok(Self {
            reader,
            writer,
            control,
        })
    }

    /// Read the next value (blocking). `Ok(None)` means the peer closed.
    pub fn read_value(&mut self) -> Result<Option<R>> {
        trace!("read_value");
        self.reader.read_value()
    }

    /// Write one value: encode, write, flush, then wait for the peer to
    /// drain the bytes (blocking).
    pub fn write_value(&mut self, value: &W) -> Result<()> {
        trace!("write_value");
        self.writer.write_value(value)?;
        self.control.drain().map_err(transport_to_frame)
    }

    /// Whether the underlying channel is still open locally.
    pub fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    /// Close the underlying channel. Idempotent; wakes blocked readers
    /// on every clone of the stream.
    pub fn close(&self) {
        trace!("close");
        self.control.close();
    }

    /// Split into the pieces a connection's two loops need: the typed
    /// reader, the typed writer, and a control handle for close/drain.
    pub fn into_parts(
        self,
    ) -> (
        FrameReader<R, ChannelStream>,
        FrameWriter<W, ChannelStream>,
        ChannelStream,
    ) {
        (self.reader, self.writer, self.control)
    }
}

fn transport_to_frame(err: TransportError) -> FrameError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        TransportError::Closed => FrameError::Closed,
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
