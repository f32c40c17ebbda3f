//! UDP ASSOCIATE subsystem
//!
//! A UDP associate session couples three sockets: the control TCP
//! connection the command arrived on, a client-facing UDP socket, and a
//! site-facing UDP socket. The control connection carries no further data;
//! its readability (bytes, EOF, or error) is the teardown signal, and all
//! three sockets go down together.
//!
//! Datagram flow:
//!
//! ```text
//! client ──▶ clientSock ── unwrap envelope ──▶ siteSock ──▶ target
//! client ◀── clientSock ◀── wrap envelope ─── siteSock ◀── target
//! ```
//!
//! When the client pinned its source address in the request, listen-mode
//! sessions drop datagrams from anyone else. Without a pin, the first
//! accepted datagram teaches the session where to send replies.

use crate::consts::*;
use crate::error::Socks5Error;
use crate::proto::udp::UdpPacket;
use crate::proto::Reply;
use crate::server::ServerConfig;
use crate::types::{ReplyCode, TargetAddr};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle a parsed UDP ASSOCIATE request.
///
/// `control_local_addr` is the local address of the control TCP connection
/// when the stream has one; it stands in for a wildcard bind IP in the
/// advertised relay endpoint.
pub async fn handle_udp_associate<S>(
    mut control: S,
    control_local_addr: Option<SocketAddr>,
    hint: TargetAddr,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The address the client promises to send datagrams from, when it
    // does and compatibility mode doesn't tell us to ignore it.
    let expected_client_addr = if config.udp_cmd_addr_compatibility {
        None
    } else if hint.port() != 0 {
        match hint.host_ip() {
            Some(ip) => Some(SocketAddr::new(ip, hint.port())),
            None => {
                let _ = Reply::error(ReplyCode::AddressTypeNotSupported)
                    .write(&mut control)
                    .await;
                bail!("UDP associate hint {} carries no usable IP", hint);
            }
        }
    } else {
        None
    };

    // Client-facing socket: connected when the client pinned itself and
    // the dial hook plays along, bound otherwise.
    let (client_sock, is_dial) = match timeout(
        config.client_udp_bind_timeout,
        open_client_socket(config, expected_client_addr),
    )
    .await
    {
        Ok(Ok(opened)) => opened,
        Ok(Err(err)) => {
            let _ = Reply::error(ReplyCode::HostUnreachable)
                .write(&mut control)
                .await;
            return Err(anyhow::Error::from(err).context("failed to open client-facing socket"));
        }
        Err(_) => {
            let _ = Reply::error(ReplyCode::HostUnreachable)
                .write(&mut control)
                .await;
            bail!("opening client-facing socket timed out");
        }
    };

    // The endpoint we advertise. A wildcard bind IP is useless to the
    // client; substitute the IP it already reached us on.
    let mut advertised = match client_sock.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            let _ = Reply::error(ReplyCode::InternalError)
                .write(&mut control)
                .await;
            return Err(anyhow::Error::from(err).context("client-facing socket has no address"));
        }
    };
    if advertised.ip().is_unspecified() {
        if let Some(tcp_local) = control_local_addr {
            advertised.set_ip(tcp_local.ip());
        }
    }

    let success = Reply::new(ReplyCode::Succeeded, advertised.into());
    if config.fast_forward {
        success
            .write(&mut control)
            .await
            .context("failed to write fast-forward reply")?;
    }

    // Site-facing socket.
    let site_sock = match timeout(
        config.site_udp_listen_timeout,
        config.hooks.listen_for_site(),
    )
    .await
    {
        Ok(Ok(sock)) => sock,
        Ok(Err(err)) => {
            if !config.fast_forward {
                let _ = Reply::error(ReplyCode::GeneralFailure)
                    .write(&mut control)
                    .await;
            }
            return Err(anyhow::Error::from(err).context("failed to open site-facing socket"));
        }
        Err(_) => {
            if !config.fast_forward {
                let _ = Reply::error(ReplyCode::GeneralFailure)
                    .write(&mut control)
                    .await;
            }
            bail!("opening site-facing socket timed out");
        }
    };

    if !config.fast_forward {
        success
            .write(&mut control)
            .await
            .context("failed to write reply")?;
    }

    debug!(
        "UDP associate up: advertised {}, pinned client {:?}, dial mode {}",
        advertised, expected_client_addr, is_dial
    );

    let client_sock = Arc::new(client_sock);
    let site_sock = Arc::new(site_sock);
    let learned_client_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let session_token = cancel.child_token();

    let mut client_to_site = tokio::spawn(forward_client_to_site(
        client_sock.clone(),
        site_sock.clone(),
        expected_client_addr,
        is_dial,
        learned_client_addr.clone(),
        session_token.clone(),
    ));
    let mut site_to_client = tokio::spawn(forward_site_to_client(
        site_sock.clone(),
        client_sock.clone(),
        expected_client_addr,
        is_dial,
        learned_client_addr.clone(),
        session_token.clone(),
    ));

    // Park on the control connection. Any read return tears the session
    // down; so does outer cancellation or a forwarder dying on its socket.
    let mut byte = [0u8; 1];
    let outcome: Result<()> = tokio::select! {
        _ = cancel.cancelled() => Err(Socks5Error::Cancelled.into()),
        read = control.read(&mut byte) => match read {
            Ok(0) => {
                debug!("control connection closed, ending UDP associate");
                Ok(())
            }
            Ok(_) => {
                debug!("byte on control connection, ending UDP associate");
                Ok(())
            }
            Err(err) => Err(anyhow::Error::from(err).context("control connection failed")),
        },
        _ = &mut client_to_site => Ok(()),
        _ = &mut site_to_client => Ok(()),
    };

    // Both forwarders exit on the token; their socket references drop with
    // them, and the control stream closes when the caller drops it.
    session_token.cancel();

    outcome
}

/// Open the client-facing socket, preferring connected (dial) mode when
/// the client pinned a source address and the hook supports dialing.
async fn open_client_socket(
    config: &ServerConfig,
    expected_client_addr: Option<SocketAddr>,
) -> std::io::Result<(UdpSocket, bool)> {
    if let Some(addr) = expected_client_addr {
        if let Some(sock) = config.hooks.dial_to_client(addr).await? {
            return Ok((sock, true));
        }
    }

    let sock = config.hooks.listen_for_client().await?;
    Ok((sock, false))
}

/// client → site: unwrap envelopes and push payloads at their targets.
async fn forward_client_to_site(
    client_sock: Arc<UdpSocket>,
    site_sock: Arc<UdpSocket>,
    expected_client_addr: Option<SocketAddr>,
    is_dial: bool,
    learned_client_addr: Arc<Mutex<Option<SocketAddr>>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = client_sock.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    debug!("client socket recv failed: {}", err);
                    return;
                }
            },
        };

        // In dial mode the kernel filters sources; in listen mode with a
        // pinned client we do it ourselves.
        if !is_dial {
            if let Some(expected) = expected_client_addr {
                if src != expected {
                    debug!("dropping datagram from unexpected source {}", src);
                    continue;
                }
            }
        }

        let packet = match UdpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("invalid datagram from {}: {}", src, err);
                continue;
            }
        };

        if packet.is_fragmented() {
            debug!("dropping fragmented datagram (FRAG={})", packet.frag);
            continue;
        }

        // Domain targets resolve here, best-effort; failures cost one
        // datagram, not the session.
        let dest = match &packet.addr {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(_, _) => match packet.addr.resolve().await {
                Ok(addr) => addr,
                Err(err) => {
                    debug!("cannot resolve {}: {:#}", packet.addr, err);
                    continue;
                }
            },
        };

        if expected_client_addr.is_none() {
            *learned_client_addr.lock().unwrap() = Some(src);
        }

        if let Err(err) = site_sock.send_to(&packet.data, dest).await {
            warn!("send to {} failed: {}", dest, err);
            continue;
        }
    }
}

/// site → client: wrap payloads in envelopes and return them.
async fn forward_site_to_client(
    site_sock: Arc<UdpSocket>,
    client_sock: Arc<UdpSocket>,
    expected_client_addr: Option<SocketAddr>,
    is_dial: bool,
    learned_client_addr: Arc<Mutex<Option<SocketAddr>>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = site_sock.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    debug!("site socket recv failed: {}", err);
                    return;
                }
            },
        };

        let packet = UdpPacket::new(from.into(), Bytes::copy_from_slice(&buf[..len]));
        let encoded = match packet.to_bytes() {
            Ok(encoded) => encoded,
            Err(err) => {
                debug!("cannot encode datagram from {}: {}", from, err);
                continue;
            }
        };

        // Replies go to the pinned address, or to wherever the client
        // last sent from. Nothing learned yet means nowhere to send.
        let dest = match expected_client_addr {
            Some(addr) => addr,
            None => match *learned_client_addr.lock().unwrap() {
                Some(addr) => addr,
                None => {
                    debug!("no client address known yet, dropping reply from {}", from);
                    continue;
                }
            },
        };

        let sent = if is_dial {
            client_sock.send(&encoded).await
        } else {
            client_sock.send_to(&encoded, dest).await
        };
        if let Err(err) = sent {
            debug!("send to client {} failed: {}", dest, err);
            continue;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DefaultHooks, ServerHooks};
    use std::io;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    #[derive(Debug)]
    struct ListenOnlyHooks;

    #[async_trait::async_trait]
    impl ServerHooks for ListenOnlyHooks {
        async fn listen_for_client(&self) -> io::Result<UdpSocket> {
            UdpSocket::bind("127.0.0.1:0").await
        }

        async fn listen_for_site(&self) -> io::Result<UdpSocket> {
            UdpSocket::bind("127.0.0.1:0").await
        }

        async fn dial_to_client(&self, _addr: SocketAddr) -> io::Result<Option<UdpSocket>> {
            Ok(None)
        }
    }

    #[derive(Debug)]
    struct FailingSiteHooks;

    #[async_trait::async_trait]
    impl ServerHooks for FailingSiteHooks {
        async fn listen_for_client(&self) -> io::Result<UdpSocket> {
            UdpSocket::bind("127.0.0.1:0").await
        }

        async fn listen_for_site(&self) -> io::Result<UdpSocket> {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "no sockets left"))
        }
    }

    fn listen_only_config() -> ServerConfig {
        ServerConfig {
            hooks: Arc::new(ListenOnlyHooks),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_domain_hint_with_port() {
        let (mut client_side, server_side) = duplex(4096);

        let config = listen_only_config();
        let handle = tokio::spawn(async move {
            handle_udp_associate(
                server_side,
                None,
                TargetAddr::domain("not-an-ip.example".to_string(), 5555),
                &config,
                CancellationToken::new(),
            )
            .await
        });

        let reply = Reply::read(&mut client_side).await.unwrap();
        assert_eq!(reply.code, ReplyCode::AddressTypeNotSupported);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_site_listen_failure_maps_to_general_failure() {
        let (mut client_side, server_side) = duplex(4096);

        let config = ServerConfig {
            hooks: Arc::new(FailingSiteHooks),
            ..Default::default()
        };
        let handle = tokio::spawn(async move {
            handle_udp_associate(
                server_side,
                None,
                TargetAddr::default(),
                &config,
                CancellationToken::new(),
            )
            .await
        });

        let reply = Reply::read(&mut client_side).await.unwrap();
        assert_eq!(reply.code, ReplyCode::GeneralFailure);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_advertises_bound_port() {
        let (mut client_side, server_side) = duplex(4096);

        let config = listen_only_config();
        let handle = tokio::spawn(async move {
            handle_udp_associate(
                server_side,
                None,
                TargetAddr::default(),
                &config,
                CancellationToken::new(),
            )
            .await
        });

        let reply = Reply::read(&mut client_side).await.unwrap();
        assert_eq!(reply.code, ReplyCode::Succeeded);
        match reply.bind_addr {
            TargetAddr::Ip(addr) => {
                assert_eq!(addr.ip(), std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
                assert_ne!(addr.port(), 0);
            }
            other => panic!("expected IP bind address, got {}", other),
        }

        // Closing the control stream ends the session.
        drop(client_side);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("session did not end on control close")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_compatibility_mode_ignores_hint() {
        let (mut client_side, server_side) = duplex(4096);

        let config = ServerConfig {
            udp_cmd_addr_compatibility: true,
            hooks: Arc::new(ListenOnlyHooks),
            ..Default::default()
        };
        let handle = tokio::spawn(async move {
            handle_udp_associate(
                server_side,
                None,
                // Would be rejected outside compatibility mode.
                TargetAddr::domain("target.example".to_string(), 443),
                &config,
                CancellationToken::new(),
            )
            .await
        });

        let reply = Reply::read(&mut client_side).await.unwrap();
        assert_eq!(reply.code, ReplyCode::Succeeded);

        drop(client_side);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn test_any_control_byte_tears_down() {
        let (mut client_side, server_side) = duplex(4096);

        let config = listen_only_config();
        let handle = tokio::spawn(async move {
            handle_udp_associate(
                server_side,
                None,
                TargetAddr::default(),
                &config,
                CancellationToken::new(),
            )
            .await
        });

        let reply = Reply::read(&mut client_side).await.unwrap();
        assert_eq!(reply.code, ReplyCode::Succeeded);

        client_side.write_all(&[0x00]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("session did not end on control byte")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_tears_down() {
        let (mut client_side, server_side) = duplex(4096);

        let config = listen_only_config();
        let token = CancellationToken::new();
        let session_token = token.clone();
        let handle = tokio::spawn(async move {
            handle_udp_associate(
                server_side,
                None,
                TargetAddr::default(),
                &config,
                session_token,
            )
            .await
        });

        let reply = Reply::read(&mut client_side).await.unwrap();
        assert_eq!(reply.code, ReplyCode::Succeeded);

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("session did not end on cancellation")
            .unwrap();
        let err = result.unwrap_err();
        assert!(err
            .downcast_ref::<Socks5Error>()
            .is_some_and(Socks5Error::is_cancelled));
    }

    #[tokio::test]
    async fn test_default_hooks_dial_to_client_connects() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hooks = DefaultHooks;
        let sock = hooks
            .dial_to_client(peer.local_addr().unwrap())
            .await
            .unwrap()
            .expect("default hooks support dialing");
        assert!(sock.peer_addr().is_ok());
    }
}
