//! UDP relay client
//!
//! Client-side support for the UDP ASSOCIATE command. [`UdpClient`] opens a
//! control TCP connection to the SOCKS5 server, negotiates a UDP relay
//! endpoint, and hands back a [`UdpTunnel`] that sends and receives
//! enveloped datagrams through it.
//!
//! The control connection stays open for the lifetime of the tunnel; the
//! server tears the relay down when it closes. A keepalive reader watches
//! the control stream and closes the tunnel the moment it returns.

use crate::consts::*;
use crate::error::Socks5Error;
use crate::proto::udp::UdpPacket;
use crate::proto::{Greeting, MethodSelection, Reply, Request};
use crate::types::{ReplyCode, SocksCommand, TargetAddr};
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handshake deadline for the control connection
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive period on the idle control connection
const CONTROL_KEEPALIVE: Duration = Duration::from_secs(120);

/// Client for SOCKS5 UDP relays
#[derive(Debug, Clone)]
pub struct UdpClient {
    proxy_addr: String,
}

impl UdpClient {
    /// Create a client that negotiates relays with the given SOCKS5 server
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        UdpClient {
            proxy_addr: proxy_addr.into(),
        }
    }

    /// Open a relay with a destination hint.
    ///
    /// The hint is remembered so [`UdpTunnel::send`] can address datagrams
    /// without the caller repeating the destination. The relay itself is
    /// not pinned to it; `send_to` may still address anyone.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<UdpTunnel, Socks5Error> {
        let target = TargetAddr::parse(addr)?;
        let mut tunnel = self.listen(network).await?;
        tunnel.dst = Some(target);
        Ok(tunnel)
    }

    /// Open a relay without pinning a destination.
    ///
    /// Each datagram is addressed individually via [`UdpTunnel::send_to`]
    /// or [`UdpTunnel::send_to_domain`].
    pub async fn listen(&self, network: &str) -> Result<UdpTunnel, Socks5Error> {
        match network {
            "udp" | "udp4" => {}
            other => return Err(Socks5Error::UnsupportedNetwork(other.to_string())),
        }

        let mut control = TcpStream::connect(&self.proxy_addr).await?;

        let relay_addr = timeout(HANDSHAKE_TIMEOUT, associate(&mut control))
            .await
            .map_err(|_| {
                Socks5Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "UDP associate handshake timed out",
                ))
            })??;

        debug!("UDP relay endpoint: {}", relay_addr);

        let bind_addr: SocketAddr = if relay_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(relay_addr).await?;
        let socket = Arc::new(socket);

        // Keep the otherwise silent control connection alive.
        let keepalive = TcpKeepalive::new().with_time(CONTROL_KEEPALIVE);
        let _ = SockRef::from(&control).set_tcp_keepalive(&keepalive);

        let token = CancellationToken::new();

        // Any read return on the control stream, bytes or EOF or error,
        // means the relay is gone.
        let monitor_token = token.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1];
            tokio::select! {
                _ = monitor_token.cancelled() => {}
                result = control.read(&mut buf) => {
                    debug!("control connection returned ({:?}), closing relay", result);
                    monitor_token.cancel();
                }
            }
        });

        Ok(UdpTunnel {
            socket,
            token,
            dst: None,
            relay_addr,
        })
    }
}

/// Negotiate the relay endpoint on a fresh control connection.
async fn associate(control: &mut TcpStream) -> Result<SocketAddr, Socks5Error> {
    Greeting::new(vec![SOCKS5_AUTH_METHOD_NONE])
        .write(control)
        .await?;

    let selection = MethodSelection::read(control).await?;
    match selection.method {
        SOCKS5_AUTH_METHOD_NONE => {}
        SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => return Err(Socks5Error::NoAcceptableMethod),
        other => return Err(Socks5Error::UnexpectedMethod(other)),
    }

    Request::new(SocksCommand::UdpAssociate, TargetAddr::default())
        .write(control)
        .await?;

    let reply = Reply::read(control).await?;
    if reply.code != ReplyCode::Succeeded {
        return Err(Socks5Error::RequestFailed(reply.code));
    }

    let mut relay_addr = reply.bind_addr.resolve().await.map_err(|e| {
        Socks5Error::InvalidAddress(format!("relay endpoint {}: {}", reply.bind_addr, e))
    })?;

    // Some servers advertise the wildcard address; reach them where the
    // control connection reached them.
    if relay_addr.ip().is_unspecified() {
        relay_addr.set_ip(control.peer_addr()?.ip());
    }

    Ok(relay_addr)
}

/// A negotiated UDP relay session
///
/// Outbound payloads are wrapped in the SOCKS5 UDP envelope; inbound
/// datagrams are unwrapped and their source address surfaced. Dropping the
/// tunnel (or calling [`UdpTunnel::close`]) releases the UDP socket and the
/// control connection together.
pub struct UdpTunnel {
    socket: Arc<UdpSocket>,
    token: CancellationToken,
    dst: Option<TargetAddr>,
    relay_addr: SocketAddr,
}

impl UdpTunnel {
    /// The relay endpoint datagrams travel through
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Local address of the tunnel's UDP socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Whether the tunnel has been torn down
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tear the tunnel down: the UDP socket and the control connection go
    /// together.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Send a payload to the destination hint given at [`UdpClient::dial`]
    /// time.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, Socks5Error> {
        match &self.dst {
            Some(TargetAddr::Ip(addr)) => self.send_to(payload, *addr).await,
            Some(TargetAddr::Domain(host, port)) => {
                let (host, port) = (host.clone(), *port);
                self.send_to_domain(payload, &host, port).await
            }
            None => Err(Socks5Error::InvalidAddress(
                "tunnel has no destination hint".to_string(),
            )),
        }
    }

    /// Send a payload to an IP destination through the relay
    pub async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize, Socks5Error> {
        let packet = UdpPacket::new(addr.into(), Bytes::copy_from_slice(payload));
        self.send_packet(&packet).await?;
        Ok(payload.len())
    }

    /// Send a payload addressed by domain name, leaving resolution to the
    /// relay.
    pub async fn send_to_domain(
        &self,
        payload: &[u8],
        host: &str,
        port: u16,
    ) -> Result<usize, Socks5Error> {
        let packet = UdpPacket::new(
            TargetAddr::domain(host.to_string(), port),
            Bytes::copy_from_slice(payload),
        );
        self.send_packet(&packet).await?;
        Ok(payload.len())
    }

    async fn send_packet(&self, packet: &UdpPacket) -> Result<(), Socks5Error> {
        if self.is_closed() {
            return Err(Socks5Error::Cancelled);
        }

        let encoded = packet.to_bytes()?;
        self.socket.send(&encoded).await?;
        Ok(())
    }

    /// Receive one datagram through the relay.
    ///
    /// Returns the payload length and the source address from the envelope.
    /// A domain-name source is resolved best-effort; when resolution fails
    /// the address comes back unspecified. Payloads longer than `buf` are
    /// truncated.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Socks5Error> {
        let mut datagram = vec![0u8; MAX_UDP_PACKET];

        let len = tokio::select! {
            _ = self.token.cancelled() => return Err(Socks5Error::Cancelled),
            result = self.socket.recv(&mut datagram) => result?,
        };

        let packet = UdpPacket::parse(&datagram[..len])?;

        let from = match &packet.addr {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(_, port) => match packet.addr.resolve().await {
                Ok(addr) => addr,
                Err(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), *port),
            },
        };

        let size = packet.data.len().min(buf.len());
        buf[..size].copy_from_slice(&packet.data[..size]);

        Ok((size, from))
    }
}

impl Drop for UdpTunnel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
