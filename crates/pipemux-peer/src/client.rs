use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use pipemux_frame::{FramedChannel, Wire};
use pipemux_transport::{channel_path_in, ChannelStream};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::event::Event;
use crate::worker::{Executor, InlineExecutor, Worker};

/// Client behavior knobs.
#[derive(Clone)]
pub struct ClientConfig {
    /// Directory channel sockets live in. Must match the server's.
    pub channel_dir: PathBuf,
    /// How long to sleep between existence probes while waiting for the
    /// server's rendezvous channel to appear.
    pub retry_interval: Duration,
    /// Bound on the handshake read.
    pub handshake_timeout: Duration,
    /// Context notification callbacks run on.
    pub executor: Arc<dyn Executor>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_dir: pipemux_transport::default_channel_dir(),
            retry_interval: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(10),
            executor: Arc::new(InlineExecutor),
        }
    }
}

impl ClientConfig {
    pub fn with_channel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.channel_dir = dir.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("channel_dir", &self.channel_dir)
            .field("retry_interval", &self.retry_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[derive(Default)]
struct LinkFlags {
    connected: bool,
    disconnected: bool,
}

/// Condvar latches for "link came up" / "link went down".
#[derive(Default)]
struct Link {
    flags: Mutex<LinkFlags>,
    signal: Condvar,
}

impl Link {
    fn set_connected(&self) {
        self.lock().connected = true;
        self.signal.notify_all();
    }

    fn set_disconnected(&self) {
        self.lock().disconnected = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration, which: fn(&LinkFlags) -> bool) -> bool {
        let guard = self.lock();
        let (guard, result) = self
            .signal
            .wait_timeout_while(guard, timeout, |flags| !which(flags))
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        !result.timed_out()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ClientInner<R, W> {
    rendezvous: String,
    config: ClientConfig,
    running: AtomicBool,
    connection: Mutex<Option<Connection<R, W>>>,
    connect_handle: Mutex<Option<JoinHandle<()>>>,
    link: Link,
    server_message: Event<R>,
    disconnected: Event<()>,
    error: Event<PeerError>,
}

/// Connects to a [`Server`](crate::Server)'s rendezvous name and speaks
/// to it over the private channel the server hands out.
pub struct Client<R, W> {
    inner: Arc<ClientInner<R, W>>,
}

impl<R, W> Clone for Client<R, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, W> Client<R, W>
where
    R: Wire + Send + 'static,
    W: Wire + Send + 'static,
{
    pub fn new(rendezvous_name: impl Into<String>) -> Self {
        Self::with_config(rendezvous_name, ClientConfig::default())
    }

    pub fn with_config(rendezvous_name: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                rendezvous: rendezvous_name.into(),
                config,
                running: AtomicBool::new(false),
                connection: Mutex::new(None),
                connect_handle: Mutex::new(None),
                link: Link::default(),
                server_message: Event::new(),
                disconnected: Event::new(),
                error: Event::new(),
            }),
        }
    }

    /// Subscribe to messages from the server.
    pub fn on_server_message(&self, subscriber: impl Fn(&R) + Send + Sync + 'static) -> usize {
        self.inner
            .server_message
            .subscribe(move |message, _| subscriber(message))
    }

    /// Subscribe to the disconnected notification.
    pub fn on_disconnected(&self, subscriber: impl Fn() + Send + Sync + 'static) -> usize {
        self.inner.disconnected.subscribe(move |_, _| subscriber())
    }

    /// Subscribe to handshake and connection faults.
    pub fn on_error(&self, subscriber: impl Fn(&PeerError) + Send + Sync + 'static) -> usize {
        self.inner.error.subscribe(move |err, _| subscriber(err))
    }

    /// Start connecting on a background thread. Returns immediately;
    /// no-op if already running.
    ///
    /// The connect task waits for the rendezvous channel to exist (the
    /// server may not be up yet), performs the handshake, and opens the
    /// private-channel connection. Failures surface on the error event.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(rendezvous = %self.inner.rendezvous, "client starting");

        let connect_client = self.clone();
        let done_client = self.clone();
        let handle = Worker::new(Arc::clone(&self.inner.config.executor))
            .spawn(
                "pmx-connect",
                move || connect_client.connect_and_open(),
                move |result| {
                    if let Err(err) = result {
                        done_client.inner.error.emit(&err, &());
                    }
                },
            )
            .map_err(|err| {
                self.inner.running.store(false, Ordering::SeqCst);
                PeerError::Spawn(err)
            })?;
        *self.lock_connect_handle() = Some(handle);
        Ok(())
    }

    /// Close the connection (if any) and stop the connect task.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(rendezvous = %self.inner.rendezvous, "client stopping");

        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            connection.close();
            connection.join();
        }

        let handle = self.lock_connect_handle().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Queue a message to the server.
    pub fn push_message(&self, message: W) -> Result<()> {
        let guard = self.lock_connection();
        match guard.as_ref() {
            Some(connection) if connection.is_connected() => {
                connection.push_message(message);
                Ok(())
            }
            _ => Err(PeerError::NotConnected),
        }
    }

    /// Whether the private channel is currently up.
    pub fn is_connected(&self) -> bool {
        self.lock_connection()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Block until the connection is established, or `timeout` elapses.
    /// Returns whether the connection came up.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.inner.link.wait(timeout, |flags| flags.connected)
    }

    /// Block until the connection has gone down, or `timeout` elapses.
    /// Returns whether the disconnection was observed.
    pub fn wait_for_disconnection(&self, timeout: Duration) -> bool {
        self.inner.link.wait(timeout, |flags| flags.disconnected)
    }

    fn connect_and_open(&self) -> Result<()> {
        let config = &self.inner.config;
        let rendezvous_path = channel_path_in(&config.channel_dir, &self.inner.rendezvous)?;

        // The server may not be up yet; probe until its listener appears.
        while !ChannelStream::exists(&rendezvous_path) {
            if !self.inner.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(config.retry_interval);
        }

        let handshake_stream = ChannelStream::connect(&rendezvous_path)?;
        handshake_stream.set_read_timeout(Some(config.handshake_timeout))?;
        let mut handshake: FramedChannel<String, String> = FramedChannel::new(handshake_stream)?;
        let private_name = handshake.read_value()?.ok_or_else(|| {
            PeerError::Handshake(
                "server closed the handshake channel before sending a private name".to_string(),
            )
        })?;
        handshake.close();
        debug!(private = %private_name, "handshake complete");

        let private_path = channel_path_in(&config.channel_dir, &private_name)?;
        let stream = ChannelStream::connect(&private_path)?;
        let channel: FramedChannel<R, W> = FramedChannel::new(stream)?;
        let connection = Connection::new(0, "server", channel, Arc::clone(&config.executor));

        let weak = Arc::downgrade(&self.inner);
        connection.on_message(move |_conn, message| {
            if let Some(inner) = weak.upgrade() {
                inner.server_message.emit(message, &());
            }
        });
        let weak = Arc::downgrade(&self.inner);
        connection.on_disconnected(move |_conn| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .connection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                inner.link.set_disconnected();
                inner.disconnected.emit(&(), &());
            }
        });
        let weak = Arc::downgrade(&self.inner);
        connection.on_error(move |_conn, err| {
            if let Some(inner) = weak.upgrade() {
                inner.error.emit(err, &());
            }
        });

        connection.open()?;

        // The lock serializes against stop(): either stop already cleared
        // the running flag (close the fresh connection instead of leaking
        // it), or stop will find it in the slot and close it.
        let mut slot = self.lock_connection();
        if !self.inner.running.load(Ordering::SeqCst) {
            drop(slot);
            connection.close();
            return Ok(());
        }
        *slot = Some(connection);
        drop(slot);

        self.inner.link.set_connected();
        info!(rendezvous = %self.inner.rendezvous, "client connected");
        Ok(())
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection<R, W>>> {
        self.inner
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connect_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .connect_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R, W> std::fmt::Debug for Client<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("rendezvous", &self.inner.rendezvous)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}
