//! SOCKS5 client
//!
//! Drives the client side of the protocol on a stream the caller already
//! connected to a SOCKS5 server: greeting, optional username/password
//! sub-negotiation, and the CONNECT command. After [`connect`] returns the
//! stream carries application data; this module never closes it.
//!
//! UDP relaying from the client side lives in [`udp`].

pub mod udp;

pub use udp::{UdpClient, UdpTunnel};

use crate::consts::*;
use crate::error::Socks5Error;
use crate::proto::{Greeting, MethodSelection, PasswordRequest, PasswordResponse, Reply, Request};
use crate::types::{ReplyCode, SocksCommand, TargetAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// SOCKS5 client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Username for the password sub-negotiation
    pub username: Option<String>,
    /// Password for the password sub-negotiation
    pub password: Option<String>,
}

impl ClientConfig {
    /// Configuration performing no authentication
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Configuration offering username/password in addition to no-auth
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        ClientConfig {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Whether either credential field is non-empty
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            || self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Perform a SOCKS5 CONNECT handshake on an existing stream.
///
/// `network` must be one of `tcp`, `tcp4`, `tcp6`; UDP relaying goes
/// through [`UdpClient`] instead. `addr` is a `host:port` string whose
/// address type is selected automatically (IP literal first, domain
/// otherwise) and is validated before any byte is written.
///
/// On success the stream is ready for application data. The stream is
/// returned to the caller untouched on failure as well; closing it is the
/// caller's decision.
pub async fn connect<S>(
    stream: &mut S,
    config: &ClientConfig,
    network: &str,
    addr: &str,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match network {
        "tcp" | "tcp4" | "tcp6" => {}
        other => return Err(Socks5Error::UnsupportedNetwork(other.to_string())),
    }

    if addr.is_empty() {
        return Err(Socks5Error::InvalidAddress("empty address".to_string()));
    }

    // Validate the target before touching the wire.
    let target = TargetAddr::parse(addr)?;

    let methods = if config.has_credentials() {
        vec![SOCKS5_AUTH_METHOD_PASSWORD, SOCKS5_AUTH_METHOD_NONE]
    } else {
        vec![SOCKS5_AUTH_METHOD_NONE]
    };

    Greeting::new(methods).write(stream).await?;
    let selection = MethodSelection::read(stream).await?;

    match selection.method {
        SOCKS5_AUTH_METHOD_NONE => {}
        SOCKS5_AUTH_METHOD_PASSWORD => {
            if !config.has_credentials() {
                return Err(Socks5Error::AuthRequired);
            }
            authenticate_password(stream, config).await?;
        }
        SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => return Err(Socks5Error::NoAcceptableMethod),
        other => return Err(Socks5Error::UnexpectedMethod(other)),
    }

    Request::new(SocksCommand::Connect, target).write(stream).await?;
    let reply = Reply::read(stream).await?;

    match reply.code {
        ReplyCode::Succeeded => {
            debug!("CONNECT to {} established", addr);
            Ok(())
        }
        code => Err(Socks5Error::RequestFailed(code)),
    }
}

/// Run the RFC 1929 sub-negotiation after the server picked password auth.
async fn authenticate_password<S>(stream: &mut S, config: &ClientConfig) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = PasswordRequest {
        username: config.username.clone().unwrap_or_default(),
        password: config.password.clone().unwrap_or_default(),
    };
    request.write(stream).await?;

    let response = PasswordResponse::read(stream).await?;
    if !response.success() {
        return Err(Socks5Error::PasswordRejected(response.status));
    }

    Ok(())
}
