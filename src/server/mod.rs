//! SOCKS5 server
//!
//! Runs the server side of the protocol on accepted connections: method
//! negotiation, optional username/password authentication, and command
//! dispatch into the TCP relay ([`tcp_relay`]) or the UDP associate
//! subsystem ([`udp`]).
//!
//! All network effects go through the [`ServerHooks`] trait so embedders
//! can route dials and binds however they like; the defaults talk to the
//! OS directly.

pub mod tcp_relay;
pub mod udp;

use crate::consts::*;
use crate::error::Socks5Error;
use crate::proto::{Greeting, MethodSelection, PasswordRequest, PasswordResponse, Reply, Request};
use crate::types::{ReplyCode, SocksCommand};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default handshake deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for dialing the CONNECT target
pub const DEFAULT_SITE_TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default idle deadline in the relay loops
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(120);
/// Default relay buffer size per direction
pub const DEFAULT_FORWARD_BUF_SIZE: usize = 32 * 1024;
/// Default deadline for opening the site-facing UDP socket
pub const DEFAULT_SITE_UDP_LISTEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for opening the client-facing UDP socket
pub const DEFAULT_CLIENT_UDP_BIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Object-safe alias for the byte streams the server shuffles around
///
/// Lets hooks hand back any transport (TCP, TLS, an in-memory pipe in
/// tests) without the session code going generic over it.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A boxed duplex byte stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Caller-provided network effects and policy
///
/// Every method has a working default, so `DefaultHooks` gives a plain
/// OS-socket server. Implementations override what they need: routing
/// dials through another interface, restricting methods, checking
/// credentials against a store.
#[async_trait]
pub trait ServerHooks: Send + Sync + Debug {
    /// Dial the target of a CONNECT request. `addr` is `host:port`; domain
    /// names reach the hook unresolved so it owns resolution policy.
    async fn site_tcp_dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }

    /// Bind the UDP socket used to reach target hosts.
    async fn listen_for_site(&self) -> io::Result<UdpSocket> {
        UdpSocket::bind("0.0.0.0:0").await
    }

    /// Bind the UDP socket the SOCKS5 client sends datagrams to.
    async fn listen_for_client(&self) -> io::Result<UdpSocket> {
        UdpSocket::bind("0.0.0.0:0").await
    }

    /// Open a connected UDP socket toward a client that pinned its source
    /// address, letting the kernel do source filtering. Returning
    /// `Ok(None)` declares the capability absent and forces listen mode.
    async fn dial_to_client(&self, addr: SocketAddr) -> io::Result<Option<UdpSocket>> {
        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        Ok(Some(socket))
    }

    /// Pick the authentication method from the client's offer. The default
    /// accepts no-auth and nothing else.
    fn choose_method(&self, offered: &[u8]) -> u8 {
        if offered.contains(&SOCKS5_AUTH_METHOD_NONE) {
            SOCKS5_AUTH_METHOD_NONE
        } else {
            SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE
        }
    }

    /// Verify a username/password pair. Only called when
    /// [`choose_method`](ServerHooks::choose_method) picked the password
    /// method. The default rejects everything.
    fn check_password(&self, _username: &str, _password: &str) -> Result<(), String> {
        Err("password authentication not configured".to_string())
    }
}

/// Hooks with every default: OS sockets, no-auth only
#[derive(Debug, Clone, Default)]
pub struct DefaultHooks;

#[async_trait]
impl ServerHooks for DefaultHooks {}

/// Hooks requiring a fixed username/password pair
#[derive(Debug, Clone)]
pub struct PasswordHooks {
    /// Expected username
    pub username: String,
    /// Expected password
    pub password: String,
}

impl PasswordHooks {
    /// Create hooks that only admit the given credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PasswordHooks {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl ServerHooks for PasswordHooks {
    fn choose_method(&self, offered: &[u8]) -> u8 {
        if offered.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
            SOCKS5_AUTH_METHOD_PASSWORD
        } else {
            SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE
        }
    }

    fn check_password(&self, username: &str, password: &str) -> Result<(), String> {
        if username == self.username && password == self.password {
            Ok(())
        } else {
            Err("bad credentials".to_string())
        }
    }
}

/// Server configuration
///
/// Timeouts and flags for a running server, plus the hook set. Zero is not
/// a meaningful value for any duration here; build from [`ServerOptions`]
/// if "zero means default" semantics are wanted.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline covering greeting through command read
    pub handshake_timeout: Duration,
    /// Deadline for dialing the CONNECT target
    pub site_tcp_dial_timeout: Duration,
    /// Idle deadline refreshed on every relay iteration
    pub forward_timeout: Duration,
    /// Relay buffer size per direction
    pub forward_buf_size: usize,
    /// Deadline for opening the site-facing UDP socket
    pub site_udp_listen_timeout: Duration,
    /// Deadline for opening the client-facing UDP socket
    pub client_udp_bind_timeout: Duration,
    /// Send the success reply before the target dial completes
    pub fast_forward: bool,
    /// Ignore the address hint in UDP ASSOCIATE requests. Some clients
    /// wrongly put the target address there, which would pin the relay to
    /// a source that never sends.
    pub udp_cmd_addr_compatibility: bool,
    /// Network effects and policy
    pub hooks: Arc<dyn ServerHooks>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            site_tcp_dial_timeout: DEFAULT_SITE_TCP_DIAL_TIMEOUT,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            forward_buf_size: DEFAULT_FORWARD_BUF_SIZE,
            site_udp_listen_timeout: DEFAULT_SITE_UDP_LISTEN_TIMEOUT,
            client_udp_bind_timeout: DEFAULT_CLIENT_UDP_BIND_TIMEOUT,
            fast_forward: false,
            udp_cmd_addr_compatibility: false,
            hooks: Arc::new(DefaultHooks),
        }
    }
}

/// File-loadable server options
///
/// Durations are seconds and sizes are bytes; zero picks the built-in
/// default. Credentials, when both present, switch the server to
/// password-only authentication.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerOptions {
    /// Handshake deadline in seconds (0 = default)
    pub handshake_timeout_secs: u64,
    /// CONNECT dial deadline in seconds (0 = default)
    pub site_tcp_dial_timeout_secs: u64,
    /// Relay idle deadline in seconds (0 = default)
    pub forward_timeout_secs: u64,
    /// Relay buffer size in bytes (0 = default)
    pub forward_buf_size: usize,
    /// Site UDP bind deadline in seconds (0 = default)
    pub site_udp_listen_timeout_secs: u64,
    /// Client UDP bind deadline in seconds (0 = default)
    pub client_udp_bind_timeout_secs: u64,
    /// Send the success reply before the target dial completes
    pub fast_forward: bool,
    /// Ignore the UDP ASSOCIATE address hint
    pub udp_cmd_addr_compatibility: bool,
    /// Username for password authentication
    pub username: Option<String>,
    /// Password for password authentication
    pub password: Option<String>,
}

impl ServerOptions {
    /// Convert into a [`ServerConfig`], filling in defaults for zero
    /// values and choosing hooks from the credential fields.
    pub fn into_config(self) -> ServerConfig {
        fn secs_or(value: u64, default: Duration) -> Duration {
            if value == 0 {
                default
            } else {
                Duration::from_secs(value)
            }
        }

        let hooks: Arc<dyn ServerHooks> = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Arc::new(PasswordHooks::new(user.clone(), pass.clone())),
            _ => Arc::new(DefaultHooks),
        };

        ServerConfig {
            handshake_timeout: secs_or(self.handshake_timeout_secs, DEFAULT_HANDSHAKE_TIMEOUT),
            site_tcp_dial_timeout: secs_or(
                self.site_tcp_dial_timeout_secs,
                DEFAULT_SITE_TCP_DIAL_TIMEOUT,
            ),
            forward_timeout: secs_or(self.forward_timeout_secs, DEFAULT_FORWARD_TIMEOUT),
            forward_buf_size: if self.forward_buf_size == 0 {
                DEFAULT_FORWARD_BUF_SIZE
            } else {
                self.forward_buf_size
            },
            site_udp_listen_timeout: secs_or(
                self.site_udp_listen_timeout_secs,
                DEFAULT_SITE_UDP_LISTEN_TIMEOUT,
            ),
            client_udp_bind_timeout: secs_or(
                self.client_udp_bind_timeout_secs,
                DEFAULT_CLIENT_UDP_BIND_TIMEOUT,
            ),
            fast_forward: self.fast_forward,
            udp_cmd_addr_compatibility: self.udp_cmd_addr_compatibility,
            hooks,
        }
    }
}

/// Serve one accepted TCP connection.
///
/// Grabs the connection's local address (the UDP associate reply needs it
/// when a bound socket reports a wildcard IP) and runs the session.
pub async fn serve_tcp(
    stream: TcpStream,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = stream.local_addr().ok();
    serve_conn(stream, local_addr, config, cancel).await
}

/// Run the SOCKS5 session state machine on any duplex stream.
///
/// `local_addr` is the stream's local TCP address when it has one; it only
/// matters for UDP ASSOCIATE. The stream is owned and dropped (closed)
/// when the session ends.
pub async fn serve_conn<S>(
    mut stream: S,
    local_addr: Option<SocketAddr>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = tokio::select! {
        _ = cancel.cancelled() => return Err(Socks5Error::Cancelled.into()),
        result = timeout(config.handshake_timeout, handshake(&mut stream, config)) => {
            match result {
                Ok(outcome) => outcome?,
                Err(_) => bail!("handshake timed out"),
            }
        }
    };

    debug!("SOCKS5 {} request to {}", request.command, request.target);

    match request.command {
        SocksCommand::Connect => {
            tcp_relay::handle_connect(stream, request.target, config, cancel).await
        }
        SocksCommand::UdpAssociate => {
            udp::handle_udp_associate(stream, local_addr, request.target, config, cancel).await
        }
        SocksCommand::Bind => {
            warn!("BIND command not supported");
            let _ = Reply::error(ReplyCode::CommandNotSupported)
                .write(&mut stream)
                .await;
            bail!("BIND command not supported")
        }
    }
}

/// Drive the handshake: greeting, method selection, optional password
/// sub-negotiation, command read.
async fn handshake<S>(stream: &mut S, config: &ServerConfig) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = Greeting::read(stream)
        .await
        .context("failed to read greeting")?;

    let method = config.hooks.choose_method(&greeting.methods);
    MethodSelection { method }
        .write(stream)
        .await
        .context("failed to write method selection")?;

    match method {
        SOCKS5_AUTH_METHOD_NONE => {}
        SOCKS5_AUTH_METHOD_PASSWORD => {
            authenticate_password(stream, config).await?;
        }
        SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => {
            bail!("no acceptable authentication method in {:?}", greeting.methods)
        }
        other => bail!("choose_method picked unsupported method {:#04x}", other),
    }

    match Request::read(stream).await {
        Ok(request) => Ok(request),
        Err(err) => {
            // Still a state where a reply is meaningful; send the closest
            // code, best-effort.
            let code = match &err {
                Socks5Error::UnsupportedAddressType(_) => {
                    Some(ReplyCode::AddressTypeNotSupported)
                }
                Socks5Error::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
                Socks5Error::Io(_) => None,
                _ => Some(ReplyCode::GeneralFailure),
            };
            if let Some(code) = code {
                let _ = Reply::error(code).write(stream).await;
            }
            Err(anyhow::Error::from(err).context("failed to read request"))
        }
    }
}

/// Server side of the RFC 1929 sub-negotiation.
async fn authenticate_password<S>(stream: &mut S, config: &ServerConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = PasswordRequest::read(stream)
        .await
        .context("failed to read password request")?;

    match config
        .hooks
        .check_password(&request.username, &request.password)
    {
        Ok(()) => {
            PasswordResponse { status: 0 }.write(stream).await?;
            debug!("password authentication succeeded for {}", request.username);
            Ok(())
        }
        Err(reason) => {
            let _ = PasswordResponse { status: 1 }.write(stream).await;
            bail!(
                "password authentication failed for {}: {}",
                request.username,
                reason
            )
        }
    }
}

/// Accept loop over an existing listener.
///
/// Transient accept failures back off from 5 ms doubling up to 1 s;
/// anything else ends the loop. Each session runs on its own task under a
/// child of `cancel`.
pub async fn serve_listener(
    listener: TcpListener,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = Duration::ZERO;

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(err) if is_transient_accept_error(&err) => {
                    backoff = if backoff.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (backoff * 2).min(Duration::from_secs(1))
                    };
                    warn!("accept failed: {}; retrying in {:?}", err, backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(err) => return Err(err).context("accept failed"),
            },
        };
        backoff = Duration::ZERO;

        let config = config.clone();
        let session_token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = serve_tcp(stream, &config, session_token).await {
                debug!("session from {} ended: {:#}", peer, err);
            }
        });
    }
}

/// Bind `addr` and serve until cancelled.
pub async fn serve_addr(
    addr: &str,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("SOCKS5 server listening on {}", listener.local_addr()?);

    serve_listener(listener, config, cancel).await
}

/// Errors worth retrying in the accept loop: the connection died between
/// the kernel queue and us.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
