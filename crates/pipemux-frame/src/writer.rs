use std::io::{ErrorKind, Write};
use std::marker::PhantomData;

use crate::error::{FrameError, Result};
use crate::wire::Wire;

/// Writes typed values, one frame at a time, to any `Write` stream.
pub struct FrameWriter<T, S> {
    inner: S,
    _message: PhantomData<fn(T)>,
}

impl<T: Wire, S: Write> FrameWriter<T, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _message: PhantomData,
        }
    }

    /// Encode and write one value, then flush (blocking).
    pub fn write_value(&mut self, value: &T) -> Result<()> {
        value.write_frame(&mut self.inner)?;
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}
