use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use pipemux_frame::{FrameReader, FrameWriter, FramedChannel, Wire};
use pipemux_transport::ChannelStream;
use tracing::{debug, trace};

use crate::error::{PeerError, Result};
use crate::event::Event;
use crate::worker::{Executor, Worker};

enum WriteOp<W> {
    Message(W),
    Shutdown,
}

struct LoopParts<R, W> {
    reader: FrameReader<R, ChannelStream>,
    writer: FrameWriter<W, ChannelStream>,
    queue_rx: Receiver<WriteOp<W>>,
}

struct Inner<R, W> {
    id: u32,
    name: String,
    control: ChannelStream,
    queue_tx: Sender<WriteOp<W>>,
    /// Taken by `open()`; present only between construction and open.
    loops: Mutex<Option<LoopParts<R, W>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    executor: Arc<dyn Executor>,
    disconnect_notified: AtomicBool,
    message: Event<Connection<R, W>, R>,
    disconnected: Event<Connection<R, W>>,
    error: Event<Connection<R, W>, PeerError>,
}

/// One established duplex connection.
///
/// Owns the framed channel, an unbounded FIFO outgoing queue, and the
/// read/write loops that service them. Cheap to clone; all clones are
/// handles to the same connection.
///
/// Server-side connections carry a server-assigned id and a display name
/// defaulting to `"Client {id}"`. The client side sees only one
/// connection, with id 0 and the name `"server"`.
pub struct Connection<R, W> {
    inner: Arc<Inner<R, W>>,
}

impl<R, W> Clone for Connection<R, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, W> Connection<R, W>
where
    R: Wire + Send + 'static,
    W: Wire + Send + 'static,
{
    pub(crate) fn new(
        id: u32,
        name: impl Into<String>,
        channel: FramedChannel<R, W>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let (reader, writer, control) = channel.into_parts();
        let (queue_tx, queue_rx) = mpsc::channel();
        Self {
            inner: Arc::new(Inner {
                id,
                name: name.into(),
                control,
                queue_tx,
                loops: Mutex::new(Some(LoopParts {
                    reader,
                    writer,
                    queue_rx,
                })),
                handles: Mutex::new(Vec::new()),
                executor,
                disconnect_notified: AtomicBool::new(false),
                message: Event::new(),
                disconnected: Event::new(),
                error: Event::new(),
            }),
        }
    }

    /// The connection's locally unique identifier.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The connection's display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the underlying channel is still open.
    pub fn is_connected(&self) -> bool {
        self.inner.control.is_connected()
    }

    /// Subscribe to messages received from the peer.
    pub fn on_message(
        &self,
        subscriber: impl Fn(&Connection<R, W>, &R) + Send + Sync + 'static,
    ) -> usize {
        self.inner.message.subscribe(subscriber)
    }

    /// Subscribe to the (one-shot) disconnected notification.
    pub fn on_disconnected(
        &self,
        subscriber: impl Fn(&Connection<R, W>) + Send + Sync + 'static,
    ) -> usize {
        self.inner.disconnected.subscribe(move |conn, _| subscriber(conn))
    }

    /// Subscribe to read/write loop faults.
    pub fn on_error(
        &self,
        subscriber: impl Fn(&Connection<R, W>, &PeerError) + Send + Sync + 'static,
    ) -> usize {
        self.inner.error.subscribe(subscriber)
    }

    /// Append a message to the outgoing queue and wake the write loop.
    ///
    /// The queue is unbounded; this never blocks. The message is written
    /// to the wire by the write loop in FIFO order.
    pub fn push_message(&self, message: W) {
        if self.inner.queue_tx.send(WriteOp::Message(message)).is_err() {
            trace!(id = self.inner.id, "push after write loop exit; dropped");
        }
    }

    /// Start the read and write loops. Non-blocking; returns immediately.
    pub(crate) fn open(&self) -> Result<()> {
        let parts = self
            .lock_loops()
            .take();
        let Some(LoopParts {
            reader,
            writer,
            queue_rx,
        }) = parts
        else {
            return Ok(());
        };

        let worker = Worker::new(Arc::clone(&self.inner.executor));

        let read_conn = self.clone();
        let read_done = self.clone();
        let read_handle = worker
            .spawn(
                &format!("pmx-read-{}", self.inner.id),
                move || read_conn.read_loop(reader),
                move |result| read_done.loop_finished("read", result),
            )
            .map_err(PeerError::Spawn)?;
        self.lock_handles().push(read_handle);

        let write_conn = self.clone();
        let write_done = self.clone();
        let write_handle = worker
            .spawn(
                &format!("pmx-write-{}", self.inner.id),
                move || write_conn.write_loop(writer, queue_rx),
                move |result| write_done.loop_finished("write", result),
            )
            .map_err(|err| {
                // The read loop is already running; take it down with us.
                self.close();
                PeerError::Spawn(err)
            })?;
        self.lock_handles().push(write_handle);

        debug!(id = self.inner.id, name = %self.inner.name, "connection open");
        Ok(())
    }

    /// Close the underlying channel and wake the write loop.
    ///
    /// Idempotent. The disconnected notification fires (once) when a loop
    /// observes the closure, not from here.
    pub fn close(&self) {
        self.inner.control.close();
        let _ = self.inner.queue_tx.send(WriteOp::Shutdown);
    }

    /// Wait for both loops to finish. Callers must have closed the
    /// connection first; never invoked from notification callbacks.
    pub(crate) fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    fn read_loop(&self, mut reader: FrameReader<R, ChannelStream>) -> Result<()> {
        loop {
            if !self.is_connected() {
                return Ok(());
            }
            match reader.read_value() {
                Ok(Some(value)) => self.inner.message.emit(self, &value),
                Ok(None) => {
                    debug!(id = self.inner.id, "peer closed channel");
                    self.close();
                    return Ok(());
                }
                Err(err) => {
                    if !self.is_connected() {
                        // Local close raced the blocking read.
                        return Ok(());
                    }
                    self.close();
                    return Err(err.into());
                }
            }
        }
    }

    fn write_loop(
        &self,
        mut writer: FrameWriter<W, ChannelStream>,
        queue: Receiver<WriteOp<W>>,
    ) -> Result<()> {
        loop {
            match queue.recv() {
                Ok(WriteOp::Message(message)) => {
                    if !self.is_connected() {
                        return Ok(());
                    }
                    let outcome = writer
                        .write_value(&message)
                        .map_err(PeerError::from)
                        .and_then(|()| writer.get_ref().drain().map_err(PeerError::from));
                    if let Err(err) = outcome {
                        if !self.is_connected() {
                            return Ok(());
                        }
                        self.close();
                        return Err(err);
                    }
                }
                Ok(WriteOp::Shutdown) | Err(_) => return Ok(()),
            }
        }
    }

    fn loop_finished(&self, which: &'static str, result: Result<()>) {
        debug!(
            id = self.inner.id,
            task = which,
            ok = result.is_ok(),
            "connection loop finished"
        );
        if let Err(err) = result {
            self.inner.error.emit(self, &err);
        }
        if !self.inner.disconnect_notified.swap(true, Ordering::SeqCst) {
            self.inner.disconnected.emit(self, &());
        }
    }

    fn lock_loops(&self) -> std::sync::MutexGuard<'_, Option<LoopParts<R, W>>> {
        self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R, W> std::fmt::Debug for Connection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("connected", &self.inner.control.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration;

    use pipemux_transport::ChannelListener;

    use super::*;
    use crate::worker::InlineExecutor;

    fn stream_pair(tag: &str) -> (ChannelStream, ChannelStream) {
        let dir = std::env::temp_dir().join(format!(
            "pipemux-conn-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("conn.sock");
        let listener = ChannelListener::bind(&path).unwrap();

        let path_clone = path.clone();
        let connector = std::thread::spawn(move || ChannelStream::connect(&path_clone).unwrap());
        let accepted = listener.accept().unwrap();
        let connected = connector.join().unwrap();

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
        (accepted, connected)
    }

    fn connection_pair(
        tag: &str,
    ) -> (Connection<Vec<u8>, Vec<u8>>, Connection<Vec<u8>, Vec<u8>>) {
        let (server_stream, client_stream) = stream_pair(tag);
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let server_end = Connection::new(
            1,
            "Client 1",
            FramedChannel::new(server_stream).unwrap(),
            Arc::clone(&executor),
        );
        let client_end = Connection::new(
            0,
            "server",
            FramedChannel::new(client_stream).unwrap(),
            executor,
        );
        (server_end, client_end)
    }

    #[test]
    fn messages_flow_both_ways() {
        let (server_end, client_end) = connection_pair("duplex");

        let (server_tx, server_rx) = mpsc::channel();
        server_end.on_message(move |_, msg: &Vec<u8>| server_tx.send(msg.clone()).unwrap());
        let (client_tx, client_rx) = mpsc::channel();
        client_end.on_message(move |_, msg: &Vec<u8>| client_tx.send(msg.clone()).unwrap());

        server_end.open().unwrap();
        client_end.open().unwrap();

        client_end.push_message(vec![1, 2]);
        server_end.push_message(vec![3, 4]);

        assert_eq!(
            server_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            vec![1, 2]
        );
        assert_eq!(
            client_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            vec![3, 4]
        );

        server_end.close();
        client_end.close();
        server_end.join();
        client_end.join();
    }

    #[test]
    fn queued_messages_arrive_in_fifo_order() {
        let (server_end, client_end) = connection_pair("fifo");

        let (tx, rx) = mpsc::channel();
        server_end.on_message(move |_, msg: &Vec<u8>| tx.send(msg.clone()).unwrap());

        server_end.open().unwrap();
        client_end.open().unwrap();

        for i in 0..32u8 {
            client_end.push_message(vec![i]);
        }
        for i in 0..32u8 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                vec![i]
            );
        }

        client_end.close();
        server_end.close();
        client_end.join();
        server_end.join();
    }

    #[test]
    fn disconnected_fires_exactly_once_on_peer_close() {
        let (server_end, client_end) = connection_pair("disconnect");

        let count = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();
        let counter = Arc::clone(&count);
        server_end.on_disconnected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        });

        server_end.open().unwrap();
        client_end.open().unwrap();

        client_end.close();
        client_end.join();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        server_end.join();
        // Both loops have finished; the notification must not have fired twice.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!server_end.is_connected());
    }

    #[test]
    fn error_fires_before_disconnected_on_malformed_stream() {
        let (server_stream, client_stream) = stream_pair("garbage");
        let server_end: Connection<Vec<u8>, Vec<u8>> = Connection::new(
            1,
            "Client 1",
            FramedChannel::new(server_stream).unwrap(),
            Arc::new(InlineExecutor),
        );

        let (tx, rx) = mpsc::channel();
        let error_tx = tx.clone();
        server_end.on_error(move |_, _| error_tx.send("error").unwrap());
        server_end.on_disconnected(move |_| tx.send("disconnected").unwrap());

        server_end.open().unwrap();

        // A header announcing more payload than ever arrives.
        let mut raw = client_stream;
        raw.write_all(&[0x00, 0x00, 0x10, 0x00]).unwrap();
        raw.write_all(&[0xAB; 8]).unwrap();
        raw.close();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "error");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "disconnected"
        );
        server_end.join();
    }

    #[test]
    fn close_wakes_idle_write_loop() {
        let (server_end, client_end) = connection_pair("wake");
        server_end.open().unwrap();
        client_end.open().unwrap();

        // Neither side has traffic; close must still let join() return.
        server_end.close();
        client_end.close();
        server_end.join();
        client_end.join();
    }

    #[test]
    fn push_after_close_is_silently_dropped() {
        let (server_end, client_end) = connection_pair("late-push");
        server_end.open().unwrap();
        client_end.open().unwrap();

        client_end.close();
        client_end.join();
        client_end.push_message(vec![9]);
    }

    #[test]
    fn open_is_idempotent() {
        let (server_end, client_end) = connection_pair("reopen");
        server_end.open().unwrap();
        server_end.open().unwrap();

        let (tx, rx) = mpsc::channel();
        server_end.on_message(move |_, msg: &Vec<u8>| tx.send(msg.clone()).unwrap());
        client_end.open().unwrap();
        client_end.push_message(vec![5]);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            vec![5]
        );
        // A second open must not have spawned a competing read loop.
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        ));

        client_end.close();
        server_end.close();
        client_end.join();
        server_end.join();
    }
}
