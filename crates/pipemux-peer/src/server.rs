use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use pipemux_frame::{FramedChannel, Wire};
use pipemux_transport::{channel_path_in, ChannelListener, ChannelStream};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::event::Event;
use crate::worker::{Executor, InlineExecutor, Worker};

/// Pause after a failed handshake so a persistent fault (deleted channel
/// directory, broken listener) cannot spin the accept loop hot.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server behavior knobs.
#[derive(Clone)]
pub struct ServerConfig {
    /// Directory channel sockets live in. Server and clients must agree.
    pub channel_dir: PathBuf,
    /// Bound on each per-client handshake step (private-channel accept,
    /// handshake write).
    pub handshake_timeout: Duration,
    /// Bound on the synthetic self-connect that unblocks the accept loop
    /// during `stop`.
    pub stop_timeout: Duration,
    /// Context notification callbacks run on.
    pub executor: Arc<dyn Executor>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_dir: pipemux_transport::default_channel_dir(),
            handshake_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(2),
            executor: Arc::new(InlineExecutor),
        }
    }
}

impl ServerConfig {
    pub fn with_channel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.channel_dir = dir.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("channel_dir", &self.channel_dir)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

struct ServerInner<R, W> {
    rendezvous: String,
    config: ServerConfig,
    connections: Mutex<Vec<Connection<R, W>>>,
    next_connection_id: AtomicU32,
    next_channel_id: AtomicU64,
    running: AtomicBool,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    client_connected: Event<Connection<R, W>>,
    client_disconnected: Event<Connection<R, W>>,
    client_message: Event<Connection<R, W>, R>,
    error: Event<PeerError>,
}

/// Accepts many concurrent clients on one well-known rendezvous name.
///
/// Each accepted client is handed a freshly bound private channel
/// (`"{rendezvous}_{N}"`) over the rendezvous channel, reconnects there,
/// and becomes a live [`Connection`].
pub struct Server<R, W> {
    inner: Arc<ServerInner<R, W>>,
}

impl<R, W> Clone for Server<R, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, W> Server<R, W>
where
    R: Wire + Send + 'static,
    W: Wire + Send + 'static,
{
    pub fn new(rendezvous_name: impl Into<String>) -> Self {
        Self::with_config(rendezvous_name, ServerConfig::default())
    }

    pub fn with_config(rendezvous_name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                rendezvous: rendezvous_name.into(),
                config,
                connections: Mutex::new(Vec::new()),
                next_connection_id: AtomicU32::new(1),
                next_channel_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                accept_handle: Mutex::new(None),
                client_connected: Event::new(),
                client_disconnected: Event::new(),
                client_message: Event::new(),
                error: Event::new(),
            }),
        }
    }

    /// The well-known rendezvous name this server owns.
    pub fn rendezvous_name(&self) -> &str {
        &self.inner.rendezvous
    }

    /// Subscribe to new client connections.
    pub fn on_client_connected(
        &self,
        subscriber: impl Fn(&Connection<R, W>) + Send + Sync + 'static,
    ) -> usize {
        self.inner
            .client_connected
            .subscribe(move |conn, _| subscriber(conn))
    }

    /// Subscribe to client disconnections. The connection has already
    /// been removed from the live set when this fires.
    pub fn on_client_disconnected(
        &self,
        subscriber: impl Fn(&Connection<R, W>) + Send + Sync + 'static,
    ) -> usize {
        self.inner
            .client_disconnected
            .subscribe(move |conn, _| subscriber(conn))
    }

    /// Subscribe to messages from any client.
    pub fn on_client_message(
        &self,
        subscriber: impl Fn(&Connection<R, W>, &R) + Send + Sync + 'static,
    ) -> usize {
        self.inner.client_message.subscribe(subscriber)
    }

    /// Subscribe to connection faults.
    pub fn on_error(&self, subscriber: impl Fn(&PeerError) + Send + Sync + 'static) -> usize {
        self.inner.error.subscribe(move |err, _| subscriber(err))
    }

    /// Bind the rendezvous channel and start accepting clients on a
    /// background thread. Returns immediately; no-op if already running.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let path = match channel_path_in(&self.inner.config.channel_dir, &self.inner.rendezvous) {
            Ok(path) => path,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        let listener = match ChannelListener::bind(&path) {
            Ok(listener) => listener,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        info!(rendezvous = %self.inner.rendezvous, "server starting");

        let accept_server = self.clone();
        let done_server = self.clone();
        let handle = Worker::new(Arc::clone(&self.inner.config.executor))
            .spawn(
                "pmx-accept",
                move || accept_server.accept_loop(listener),
                move |result| {
                    if let Err(err) = result {
                        done_server.inner.error.emit(&err, &());
                    }
                },
            )
            .map_err(|err| {
                self.inner.running.store(false, Ordering::SeqCst);
                PeerError::Spawn(err)
            })?;
        *self.lock_accept_handle() = Some(handle);
        Ok(())
    }

    /// Close all live connections, stop accepting, and unbind the
    /// rendezvous name.
    ///
    /// The accept loop blocks inside the transport's accept, so stop
    /// performs a synthetic self-connect against its own rendezvous name
    /// to make that call return; the loop then observes the cleared
    /// running flag and discards the synthetic stream without exposing it
    /// as a connection. Bounded by the configured stop and handshake
    /// timeouts; best-effort, never hangs indefinitely.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(rendezvous = %self.inner.rendezvous, "server stopping");

        let connections: Vec<Connection<R, W>> = self.lock_connections().clone();
        for connection in &connections {
            connection.close();
        }

        match channel_path_in(&self.inner.config.channel_dir, &self.inner.rendezvous) {
            Ok(path) => match ChannelStream::connect(&path) {
                Ok(dummy) => {
                    let _ = dummy.set_read_timeout(Some(self.inner.config.stop_timeout));
                    drop(dummy);
                }
                Err(err) => debug!(error = %err, "synthetic stop connect failed"),
            },
            Err(err) => debug!(error = %err, "synthetic stop connect failed"),
        }

        let handle = self.lock_accept_handle().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        for connection in &connections {
            connection.join();
        }

        // A client whose handshake completed after the flag flipped may
        // have landed in the live set; the accept loop has exited, so
        // whatever is there now is final.
        let stragglers: Vec<Connection<R, W>> = self.lock_connections().clone();
        for connection in &stragglers {
            connection.close();
            connection.join();
        }
    }

    /// Send a message to every live client.
    pub fn push_message(&self, message: W)
    where
        W: Clone,
    {
        let connections = self.lock_connections();
        for connection in connections.iter() {
            connection.push_message(message.clone());
        }
    }

    /// Send a message to the client with the given id. A missing target
    /// is a silent no-op.
    pub fn push_message_to(&self, message: W, target_id: u32) {
        let connections = self.lock_connections();
        if let Some(connection) = connections.iter().find(|c| c.id() == target_id) {
            connection.push_message(message);
        }
    }

    /// Send a message to every client whose id is in `target_ids`.
    pub fn push_message_to_ids(&self, message: W, target_ids: &[u32])
    where
        W: Clone,
    {
        let connections = self.lock_connections();
        for connection in connections.iter() {
            if target_ids.contains(&connection.id()) {
                connection.push_message(message.clone());
            }
        }
    }

    /// Send a message to the first client with the given display name.
    /// A missing target is a silent no-op.
    pub fn push_message_to_name(&self, message: W, target_name: &str) {
        let connections = self.lock_connections();
        if let Some(connection) = connections.iter().find(|c| c.name() == target_name) {
            connection.push_message(message);
        }
    }

    /// Send a message to every client whose display name is in
    /// `target_names`.
    pub fn push_message_to_names(&self, message: W, target_names: &[&str])
    where
        W: Clone,
    {
        let connections = self.lock_connections();
        for connection in connections.iter() {
            if target_names.contains(&connection.name()) {
                connection.push_message(message.clone());
            }
        }
    }

    /// Snapshot of the live connection set, in accept order.
    pub fn connections(&self) -> Vec<Connection<R, W>> {
        self.lock_connections().clone()
    }

    fn accept_loop(&self, listener: ChannelListener) -> Result<()> {
        while self.inner.running.load(Ordering::SeqCst) {
            if let Err(err) = self.accept_one(&listener) {
                // One client's failed handshake must not take the server
                // down; log and wait for the next client.
                warn!(error = %err, "client handshake failed");
                std::thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
        debug!(rendezvous = %self.inner.rendezvous, "accept loop exiting");
        Ok(())
    }

    fn accept_one(&self, listener: &ChannelListener) -> Result<()> {
        let private_name = format!(
            "{}_{}",
            self.inner.rendezvous,
            self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst)
        );
        let private_path = channel_path_in(&self.inner.config.channel_dir, &private_name)?;
        // Bind before revealing the name so the client's connect cannot
        // race an unbound path.
        let private_listener = ChannelListener::bind(&private_path)?;

        let handshake_stream = listener.accept()?;
        if !self.inner.running.load(Ordering::SeqCst) {
            // stop()'s synthetic client; discard it.
            return Ok(());
        }

        handshake_stream.set_write_timeout(Some(self.inner.config.handshake_timeout))?;
        let mut handshake: FramedChannel<String, String> = FramedChannel::new(handshake_stream)?;
        handshake.write_value(&private_name)?;
        handshake.close();

        let stream = private_listener
            .accept_deadline(self.inner.config.handshake_timeout)?
            .ok_or_else(|| {
                PeerError::Handshake(format!("client never connected to {private_name}"))
            })?;
        drop(private_listener);

        let channel: FramedChannel<R, W> = FramedChannel::new(stream)?;
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let connection = Connection::new(
            id,
            format!("Client {id}"),
            channel,
            Arc::clone(&self.inner.config.executor),
        );

        let weak = Arc::downgrade(&self.inner);
        connection.on_message(move |conn, message| {
            if let Some(inner) = weak.upgrade() {
                inner.client_message.emit(conn, message);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        connection.on_disconnected(move |conn| {
            if let Some(inner) = weak.upgrade() {
                remove_connection(&inner, conn.id());
                inner.client_disconnected.emit(conn, &());
            }
        });
        let weak = Arc::downgrade(&self.inner);
        connection.on_error(move |_conn, err| {
            if let Some(inner) = weak.upgrade() {
                inner.error.emit(err, &());
            }
        });

        if let Err(err) = connection.open() {
            // A connection existed by now; synthesize its farewell.
            connection.close();
            self.inner.client_disconnected.emit(&connection, &());
            return Err(err);
        }

        self.lock_connections().push(connection.clone());
        debug!(id, name = %connection.name(), "client connected");
        self.inner.client_connected.emit(&connection, &());
        Ok(())
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, Vec<Connection<R, W>>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_accept_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_connection<R, W>(inner: &ServerInner<R, W>, id: u32)
where
    R: Wire + Send + 'static,
    W: Wire + Send + 'static,
{
    let mut connections = inner
        .connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(pos) = connections.iter().position(|c| c.id() == id) {
        connections.remove(pos);
    }
}

impl<R, W> std::fmt::Debug for Server<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("rendezvous", &self.inner.rendezvous)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}
