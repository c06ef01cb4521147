//! Multi-client messaging over pipemux channels.
//!
//! The transport supports exactly one peer per channel instance, so a
//! [`Server`] accepts many clients through a rendezvous protocol: each
//! client connects to the well-known name, is handed a freshly bound
//! private channel name as a text frame, and reconnects there. Both
//! sides then wrap the private channel in a [`Connection`] — one read
//! loop, one write loop, an unbounded FIFO outgoing queue, and
//! message/disconnected/error notifications.

pub mod client;
pub mod connection;
pub mod error;
pub mod event;
pub mod server;
pub mod worker;

pub use client::{Client, ClientConfig};
pub use connection::Connection;
pub use error::{PeerError, Result};
pub use event::Event;
pub use server::{Server, ServerConfig};
pub use worker::{Executor, InlineExecutor, QueueExecutor, Worker};
