use std::io::Read;
use std::marker::PhantomData;

use crate::error::Result;
use crate::wire::Wire;

/// Reads typed values, one frame at a time, from any `Read` stream.
///
/// Partial reads are handled internally — callers always get complete
/// values. `Ok(None)` means the peer closed the channel.
pub struct FrameReader<T, S> {
    inner: S,
    _message: PhantomData<fn() -> T>,
}

impl<T: Wire, S: Read> FrameReader<T, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _message: PhantomData,
        }
    }

    /// Read the next value (blocking).
    pub fn read_value(&mut self) -> Result<Option<T>> {
        T::read_frame(&mut self.inner)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::error::FrameError;
    use crate::wire::Wire;

    #[test]
    fn reads_multiple_values_in_order() {
        let mut wire = Vec::new();
        vec![1u8].write_frame(&mut wire).unwrap();
        vec![2u8, 2].write_frame(&mut wire).unwrap();
        vec![3u8, 3, 3].write_frame(&mut wire).unwrap();

        let mut reader: FrameReader<Vec<u8>, _> = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_value().unwrap(), Some(vec![1]));
        assert_eq!(reader.read_value().unwrap(), Some(vec![2, 2]));
        assert_eq!(reader.read_value().unwrap(), Some(vec![3, 3, 3]));
        assert_eq!(reader.read_value().unwrap(), None);
    }

    #[test]
    fn text_values() {
        let mut wire = Vec::new();
        "first".to_string().write_frame(&mut wire).unwrap();
        "second".to_string().write_frame(&mut wire).unwrap();

        let mut reader: FrameReader<String, _> = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_value().unwrap().as_deref(), Some("first"));
        assert_eq!(reader.read_value().unwrap().as_deref(), Some("second"));
        assert_eq!(reader.read_value().unwrap(), None);
    }

    #[test]
    fn byte_by_byte_stream() {
        struct ByteByByte {
            bytes: Vec<u8>,
            pos: usize,
        }

        impl std::io::Read for ByteByByte {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.pos >= self.bytes.len() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.bytes[self.pos];
                self.pos += 1;
                Ok(1)
            }
        }

        let mut wire = Vec::new();
        vec![7u8; 32].write_frame(&mut wire).unwrap();

        let mut reader: FrameReader<Vec<u8>, _> =
            FrameReader::new(ByteByByte { bytes: wire, pos: 0 });
        assert_eq!(reader.read_value().unwrap(), Some(vec![7u8; 32]));
    }

    #[test]
    fn truncated_stream_is_fault() {
        let mut wire = Vec::new();
        vec![5u8; 64].write_frame(&mut wire).unwrap();
        wire.truncate(wire.len() / 2);

        let mut reader: FrameReader<Vec<u8>, _> = FrameReader::new(Cursor::new(wire));
        let err = reader.read_value().unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader: FrameReader<Vec<u8>, _> = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }
}
