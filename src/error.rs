//! Error types for the SOCKS5 protocol engine
//!
//! The codec and client surfaces return [`Socks5Error`] so callers can match
//! on the failure reason; server session plumbing wraps these with
//! `anyhow::Context`.

use std::io;
use thiserror::Error;

use crate::types::ReplyCode;

/// SOCKS5 protocol errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// IO error on the underlying stream or socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Frame carried a version byte other than the one its protocol requires
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown command byte in a request
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    /// Unknown ATYP byte in an address field
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    /// Domain name field empty, oversized, or not valid UTF-8
    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    /// Username or password exceeds the one-byte length field
    #[error("credential longer than 255 bytes")]
    CredentialTooLong,

    /// Username or password bytes are not valid UTF-8
    #[error("credential is not valid UTF-8")]
    InvalidCredential,

    /// Target buffer cannot hold the encoded datagram
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall {
        /// Number of bytes the encoding needs
        required: usize,
    },

    /// Datagram shorter than its header demands
    #[error("truncated UDP datagram")]
    Truncated,

    /// Greeting carried an empty method list
    #[error("greeting offered no authentication methods")]
    NoMethods,

    /// Server selected 0xFF during method negotiation
    #[error("server does not support our authentication methods")]
    NoAcceptableMethod,

    /// Server selected password auth but no credentials were configured
    #[error("server requires username/password authentication")]
    AuthRequired,

    /// Server selected a method this client never offered
    #[error("server selected unexpected method {0:#04x}")]
    UnexpectedMethod(u8),

    /// Server rejected the username/password sub-negotiation
    #[error("server rejected credentials, status {0}")]
    PasswordRejected(u8),

    /// Server answered a command with a non-success reply
    #[error("request failed: {0}")]
    RequestFailed(ReplyCode),

    /// Address string could not be parsed or canonicalized
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Network name other than the ones the operation accepts
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Session was cancelled by its supervising token
    #[error("operation cancelled")]
    Cancelled,
}

impl Socks5Error {
    /// Whether this error came from the cancellation token rather than IO
    /// or the protocol.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Socks5Error::Cancelled)
    }
}
