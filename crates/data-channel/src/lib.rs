//! TCP data channel carrying dropwire frames.
//!
//! One side binds a [`DataChannelListener`] and hands its address and
//! token to the other side out of band. The other side [`connect`]s,
//! proves the token, and from then on both ends exchange length-prefixed
//! frames through a [`TcpTransport`]. The byte layout lives in [`wire`].

pub mod client;
pub mod error;
pub mod server;
pub mod token;
pub mod transport;
pub mod wire;

pub use client::connect;
pub use error::DataChannelError;
pub use server::{DataChannelInfo, DataChannelListener};
pub use token::SessionToken;
pub use transport::{Channel, TcpTransport};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the authentication handshake.
pub const TCP_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
