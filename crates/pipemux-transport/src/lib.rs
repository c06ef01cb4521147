//! Named duplex channel primitive for pipemux.
//!
//! A channel is a duplex byte stream bound to a well-known name. One
//! process binds a [`ChannelListener`] to the name; each accepted
//! [`ChannelStream`] carries exactly one peer. Names map to Unix domain
//! socket paths under a base directory.
//!
//! This is the lowest layer of pipemux. Everything else builds on top of
//! the [`ChannelStream`] type provided here.

pub mod error;
pub mod listener;
pub mod name;
pub mod stream;

pub use error::{Result, TransportError};
pub use listener::ChannelListener;
pub use name::{channel_path, channel_path_in, default_channel_dir};
pub use stream::ChannelStream;
