use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};

/// How often the drain loop re-checks the kernel send queue.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A connected duplex channel — implements `Read + Write`.
///
/// Clones created with [`try_clone`](Self::try_clone) share the underlying
/// socket and the liveness flag: closing any clone closes them all, which
/// is what lets a reader blocked in `read` be woken by a `close` from
/// another thread.
pub struct ChannelStream {
    inner: UnixStream,
    alive: Arc<AtomicBool>,
}

impl ChannelStream {
    pub(crate) fn from_unix(inner: UnixStream) -> Self {
        Self {
            inner,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Connect to a listening channel (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to channel");
        Ok(Self::from_unix(inner))
    }

    /// Probe whether a listener is currently bound at `path`.
    ///
    /// Used by clients to wait for a server that has not started yet.
    pub fn exists(path: impl AsRef<Path>) -> bool {
        match std::fs::metadata(path.as_ref()) {
            Ok(meta) => meta.file_type().is_socket(),
            Err(_) => false,
        }
    }

    /// Whether the channel is still open locally.
    ///
    /// This reflects local close only; a peer that has gone away is
    /// observed as a zero-length read or a write error.
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Shut down both directions and mark every clone disconnected.
    ///
    /// Idempotent. A reader blocked in `read` on any clone returns with
    /// EOF once this completes.
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!("closing channel");
            let _ = self.inner.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Block until the peer has drained all bytes written so far.
    ///
    /// On Linux this polls the kernel send-queue depth (`TIOCOUTQ`) until
    /// it reaches zero, which bounds local queue growth and sequences a
    /// write against a subsequent close. Elsewhere it degrades to a flush.
    #[cfg(target_os = "linux")]
    pub fn drain(&self) -> Result<()> {
        use std::os::fd::AsRawFd;

        let fd = self.inner.as_raw_fd();
        loop {
            if !self.is_connected() {
                return Err(TransportError::Closed);
            }

            let mut pending: libc::c_int = 0;
            // SAFETY: `fd` is an open socket descriptor owned by this
            // stream, and `pending` is a valid writable c_int pointer.
            let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ as _, &mut pending) };
            if rc != 0 {
                return Err(TransportError::Io(std::io::Error::last_os_error()));
            }
            if pending == 0 {
                return Ok(());
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    /// Block until the peer has drained all bytes written so far.
    #[cfg(not(target_os = "linux"))]
    pub fn drain(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        (&self.inner).flush().map_err(TransportError::Io)
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Clone this stream. The clone shares the socket and liveness flag.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = self.inner.try_clone()?;
        Ok(Self {
            inner,
            alive: Arc::clone(&self.alive),
        })
    }
}

impl Read for ChannelStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for ChannelStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}
