use std::io::{ErrorKind, Read, Write};

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FrameError, Result};

/// Size of the length prefix on generic binary frames.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the fixed text frame used for `String` values.
pub const TEXT_FRAME_LEN: usize = 1024;

/// A value that can cross a channel as one frame.
///
/// `read_frame` returning `Ok(None)` is the sole contract for "peer
/// closed the channel"; every other failure is an error. The two built-in
/// wire formats are selected by type: `String` uses the fixed text frame,
/// and any [`BinaryMessage`] type uses the length-prefixed binary frame.
pub trait Wire: Sized {
    /// Encode `self` and write one complete frame.
    fn write_frame<S: Write>(&self, stream: &mut S) -> Result<()>;

    /// Read and decode one complete frame (blocking).
    fn read_frame<S: Read>(stream: &mut S) -> Result<Option<Self>>;
}

/// Marker for types carried in the length-prefixed binary frame.
///
/// Opting in is explicit so that the `String` text-frame implementation
/// stays a distinct wire format rather than a runtime special case:
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Job { id: u64, payload: Vec<u8> }
/// impl pipemux_frame::BinaryMessage for Job {}
/// ```
pub trait BinaryMessage: Serialize + DeserializeOwned {}

impl BinaryMessage for Vec<u8> {}

impl<T: BinaryMessage> Wire for T {
    fn write_frame<S: Write>(&self, stream: &mut S) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        write_all(stream, &buf)
    }

    fn read_frame<S: Read>(stream: &mut S) -> Result<Option<Self>> {
        let mut header = [0u8; LENGTH_PREFIX_LEN];
        match read_full(stream, &mut header)? {
            ReadOutcome::Closed => return Ok(None),
            ReadOutcome::Short(read) => {
                return Err(FrameError::TruncatedHeader {
                    expected: LENGTH_PREFIX_LEN,
                    read,
                })
            }
            ReadOutcome::Full => {}
        }

        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        match read_full(stream, &mut payload)? {
            ReadOutcome::Full => {}
            // EOF inside the payload: the peer vanished mid-frame.
            ReadOutcome::Closed | ReadOutcome::Short(_) => return Err(FrameError::Closed),
        }

        let value = bincode::deserialize(&payload)?;
        Ok(Some(value))
    }
}

/// The string specialization: one fixed [`TEXT_FRAME_LEN`]-byte frame of
/// UTF-16LE code units, NUL-padded, no length prefix.
///
/// A frame that trims to the empty string reads as `Ok(None)` — the
/// protocol cannot distinguish a deliberately sent empty string from a
/// disconnected peer for this format. The binary frame does not share
/// this ambiguity (its disconnect signal is a zero-length read).
impl Wire for String {
    fn write_frame<S: Write>(&self, stream: &mut S) -> Result<()> {
        let mut buf = BytesMut::with_capacity(TEXT_FRAME_LEN);
        for unit in self.encode_utf16() {
            buf.put_u16_le(unit);
        }
        if buf.len() > TEXT_FRAME_LEN {
            return Err(FrameError::TextTooLong {
                len: buf.len(),
                max: TEXT_FRAME_LEN,
            });
        }
        buf.resize(TEXT_FRAME_LEN, 0);
        write_all(stream, &buf)
    }

    fn read_frame<S: Read>(stream: &mut S) -> Result<Option<Self>> {
        let mut frame = [0u8; TEXT_FRAME_LEN];
        match read_full(stream, &mut frame)? {
            ReadOutcome::Closed => return Ok(None),
            ReadOutcome::Short(_) => return Err(FrameError::Closed),
            ReadOutcome::Full => {}
        }

        let units: Vec<u16> = frame
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units)?;
        let trimmed = text.trim_end_matches('\0');
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.to_string()))
    }
}

enum ReadOutcome {
    /// The buffer was filled completely.
    Full,
    /// EOF before the first byte.
    Closed,
    /// EOF after a partial read.
    Short(usize),
}

fn read_full<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Short(filled)
                });
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(ReadOutcome::Full)
}

fn write_all<S: Write>(stream: &mut S, buf: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < buf.len() {
        match stream.write(&buf[offset..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u64,
        payload: Vec<u8>,
    }

    impl BinaryMessage for Job {}

    fn encode<T: Wire>(value: &T) -> Vec<u8> {
        let mut wire = Vec::new();
        value.write_frame(&mut wire).unwrap();
        wire
    }

    #[test]
    fn binary_roundtrip() {
        let job = Job {
            id: 42,
            payload: vec![1, 2, 3],
        };
        let wire = encode(&job);
        let decoded = Job::read_frame(&mut Cursor::new(wire)).unwrap().unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn binary_frame_layout() {
        let value: Vec<u8> = vec![0xAA, 0xBB];
        let wire = encode(&value);

        let payload_len = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(wire.len(), LENGTH_PREFIX_LEN + payload_len);
        assert_eq!(
            bincode::deserialize::<Vec<u8>>(&wire[4..]).unwrap(),
            value
        );
    }

    #[test]
    fn binary_eof_before_header_is_disconnect() {
        let result = Vec::<u8>::read_frame(&mut Cursor::new(Vec::<u8>::new())).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn binary_eof_inside_header_is_fault() {
        let err = Vec::<u8>::read_frame(&mut Cursor::new(vec![0u8, 0])).unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedHeader {
                expected: LENGTH_PREFIX_LEN,
                read: 2
            }
        ));
    }

    #[test]
    fn binary_eof_inside_payload_is_fault() {
        let mut wire = encode(&vec![7u8; 16]);
        wire.truncate(wire.len() - 3);
        let err = Vec::<u8>::read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[test]
    fn binary_malformed_payload_is_serialization_fault() {
        // Valid header, payload that is not a bincode Vec<u8>.
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_be_bytes());
        wire.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        let err = Vec::<u8>::read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, FrameError::Serialization(_)));
    }

    #[test]
    fn binary_empty_value_is_delivered() {
        let value: Vec<u8> = Vec::new();
        let wire = encode(&value);
        let decoded = Vec::<u8>::read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, Some(value));
    }

    #[test]
    fn text_roundtrip() {
        let wire = encode(&"hello channel".to_string());
        assert_eq!(wire.len(), TEXT_FRAME_LEN);
        let decoded = String::read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded.as_deref(), Some("hello channel"));
    }

    #[test]
    fn text_roundtrip_non_ascii() {
        let message = "ø tøff 💬".to_string();
        let wire = encode(&message);
        let decoded = String::read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, Some(message));
    }

    #[test]
    fn text_frame_is_nul_padded_utf16le() {
        let wire = encode(&"ab".to_string());
        assert_eq!(&wire[..4], &[b'a', 0, b'b', 0]);
        assert!(wire[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn text_too_long_rejected() {
        // 512 UTF-16 units fill the frame exactly; 513 do not fit.
        let at_limit = "x".repeat(TEXT_FRAME_LEN / 2);
        assert!(at_limit.write_frame(&mut Vec::new()).is_ok());

        let over = "x".repeat(TEXT_FRAME_LEN / 2 + 1);
        let err = over.write_frame(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, FrameError::TextTooLong { .. }));
    }

    #[test]
    fn text_eof_is_disconnect() {
        let result = String::read_frame(&mut Cursor::new(Vec::<u8>::new())).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn text_partial_frame_is_fault() {
        let mut wire = encode(&"cut short".to_string());
        wire.truncate(100);
        let err = String::read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[test]
    fn text_empty_string_reads_as_disconnect() {
        // The documented ambiguity of the text format: an all-NUL frame is
        // indistinguishable from a disconnected peer.
        let wire = encode(&String::new());
        assert_eq!(wire.len(), TEXT_FRAME_LEN);
        let result = String::read_frame(&mut Cursor::new(wire)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn interrupted_read_retries() {
        struct InterruptedThenData {
            interrupted: bool,
            inner: Cursor<Vec<u8>>,
        }

        impl std::io::Read for InterruptedThenData {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if !self.interrupted {
                    self.interrupted = true;
                    return Err(std::io::Error::from(ErrorKind::Interrupted));
                }
                self.inner.read(buf)
            }
        }

        let mut stream = InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(encode(&vec![9u8; 8])),
        };
        let decoded = Vec::<u8>::read_frame(&mut stream).unwrap();
        assert_eq!(decoded, Some(vec![9u8; 8]));
    }

    #[test]
    fn zero_write_is_closed() {
        struct ZeroWriter;

        impl std::io::Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = vec![1u8].write_frame(&mut ZeroWriter).unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }
}
