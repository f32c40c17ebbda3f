//! # Sockspipe - SOCKS5 proxy library
//!
//! Sockspipe implements both sides of the SOCKS5 protocol (RFC 1928) with
//! the CONNECT and UDP ASSOCIATE commands and optional username/password
//! authentication (RFC 1929).
//!
//! ## Features
//!
//! - **Wire codec**: every control frame plus the UDP datagram envelope,
//!   with strict length-prefixed parsing and automatic address-type
//!   selection
//! - **Client**: CONNECT handshake on any stream the caller owns, and a
//!   UDP relay client with keepalive-coupled teardown
//! - **Server**: session state machine, bidirectional TCP relay with idle
//!   deadlines and optional fast-forward replies, and a full UDP associate
//!   subsystem with source filtering and address learning
//! - **Hooks**: all network effects (dials, binds, method policy,
//!   credential checks) go through a trait the embedder can override
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockspipe::server::{serve_addr, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cancel = CancellationToken::new();
//!     serve_addr("127.0.0.1:1080", ServerConfig::default(), cancel).await
//! }
//! ```
//!
//! On the client side, [`client::connect`] drives the handshake on an
//! existing connection and hands the stream back for application data:
//!
//! ```rust,ignore
//! let mut stream = tokio::net::TcpStream::connect("127.0.0.1:1080").await?;
//! let config = sockspipe::client::ClientConfig::anonymous();
//! sockspipe::client::connect(&mut stream, &config, "tcp", "example.com:80").await?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod consts;
pub mod error;
pub mod proto;
pub mod server;
pub mod types;

// Re-export commonly used items
pub use client::{connect, ClientConfig, UdpClient, UdpTunnel};
pub use error::Socks5Error;
pub use server::{serve_addr, serve_conn, serve_listener, serve_tcp, ServerConfig, ServerHooks};
pub use types::{AuthMethod, ReplyCode, SocksCommand, TargetAddr};

/// Version of the sockspipe library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the crate
pub const NAME: &str = env!("CARGO_PKG_NAME");
