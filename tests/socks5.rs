//! Protocol-level integration tests
//!
//! Exercise ordering and filtering behavior that only shows up with real
//! sockets: fast-forward reply ordering, UDP source filtering, client
//! address learning, and teardown coupling.

mod common;

use async_trait::async_trait;
use sockspipe::proto::udp::UdpPacket;
use sockspipe::proto::{Greeting, MethodSelection, Reply, Request};
use sockspipe::server::{BoxedStream, ServerConfig, ServerHooks};
use sockspipe::types::{ReplyCode, SocksCommand, TargetAddr};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Hooks that only listen for the client, forcing user-space source
/// filtering.
#[derive(Debug)]
struct ListenOnlyHooks;

#[async_trait]
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

/// Hooks whose target dial stalls, to observe reply ordering.
#[derive(Debug)]
struct SlowDialHooks {
    delay: Duration,
}

#[async_trait]
impl ServerHooks for SlowDialHooks {
    async fn site_tcp_dial(&self, addr: &str) -> io::Result<BoxedStream> {
        tokio::time::sleep(self.delay).await;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

/// Run the control-connection handshake for a UDP associate with the given
/// address hint and return the control stream plus the relay endpoint.
async fn udp_associate(
    server_addr: SocketAddr,
    hint: TargetAddr,
) -> (TcpStream, SocketAddr) {
    let mut control = TcpStream::connect(server_addr).await.unwrap();

    Greeting::new(vec![0x00]).write(&mut control).await.unwrap();
    let selection = MethodSelection::read(&mut control).await.unwrap();
    assert_eq!(selection.method, 0x00);

    Request::new(SocksCommand::UdpAssociate, hint)
        .write(&mut control)
        .await
        .unwrap();
    let reply = Reply::read(&mut control).await.unwrap();
    assert_eq!(reply.code, ReplyCode::Succeeded);

    let relay_addr = match reply.bind_addr {
        TargetAddr::Ip(addr) => addr,
        other => panic!("expected IP relay endpoint, got {}", other),
    };

    (control, relay_addr)
}

fn envelope(dest: SocketAddr, payload: &[u8]) -> Vec<u8> {
    UdpPacket::new(dest.into(), bytes::Bytes::copy_from_slice(payload))
        .to_bytes()
        .unwrap()
}

#[tokio::test]
async fn fast_forward_reply_precedes_dial() {
    let echo_addr = common::start_tcp_echo().await;

    let dial_delay = Duration::from_millis(250);
    let config = ServerConfig {
        fast_forward: true,
        hooks: Arc::new(SlowDialHooks { delay: dial_delay }),
        ..Default::default()
    };
    let (server_addr, _cancel) = common::start_socks_server(config).await;

    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    Greeting::new(vec![0x00]).write(&mut stream).await.unwrap();
    MethodSelection::read(&mut stream).await.unwrap();

    let started = Instant::now();
    Request::new(
        SocksCommand::Connect,
        TargetAddr::parse(&echo_addr.to_string()).unwrap(),
    )
    .write(&mut stream)
    .await
    .unwrap();

    let reply = Reply::read(&mut stream).await.unwrap();
    let reply_after = started.elapsed();

    assert_eq!(reply.code, ReplyCode::Succeeded);
    assert!(
        reply_after < dial_delay,
        "fast-forward reply took {:?}, dial delay is {:?}",
        reply_after,
        dial_delay
    );

    // Pipelined payload still arrives once the dial completes.
    stream.write_all(b"pipelined").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pipelined");
}

#[tokio::test]
async fn without_fast_forward_reply_waits_for_dial() {
    let echo_addr = common::start_tcp_echo().await;

    let dial_delay = Duration::from_millis(250);
    let config = ServerConfig {
        hooks: Arc::new(SlowDialHooks { delay: dial_delay }),
        ..Default::default()
    };
    let (server_addr, _cancel) = common::start_socks_server(config).await;

    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    Greeting::new(vec![0x00]).write(&mut stream).await.unwrap();
    MethodSelection::read(&mut stream).await.unwrap();

    let started = Instant::now();
    Request::new(
        SocksCommand::Connect,
        TargetAddr::parse(&echo_addr.to_string()).unwrap(),
    )
    .write(&mut stream)
    .await
    .unwrap();

    let reply = Reply::read(&mut stream).await.unwrap();
    assert_eq!(reply.code, ReplyCode::Succeeded);
    assert!(started.elapsed() >= dial_delay);
}

#[tokio::test]
async fn udp_source_filtering_in_listen_mode() {
    let config = ServerConfig {
        hooks: Arc::new(ListenOnlyHooks),
        ..Default::default()
    };
    let (server_addr, _cancel) = common::start_socks_server(config).await;

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let receiver_addr = receiver.local_addr().unwrap();

    let allowed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let allowed_addr = allowed.local_addr().unwrap();
    let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Pin the session to the allowed socket's address.
    let (_control, relay_addr) =
        udp_associate(server_addr, TargetAddr::Ip(allowed_addr)).await;

    let datagram = envelope(receiver_addr, b"nope");
    intruder.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let intruder_result = timeout(Duration::from_millis(300), receiver.recv_from(&mut buf)).await;
    assert!(
        intruder_result.is_err(),
        "datagram from unexpected source was forwarded"
    );

    let datagram = envelope(receiver_addr, b"yep");
    allowed.send_to(&datagram, relay_addr).await.unwrap();

    let (n, _) = timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
        .await
        .expect("datagram from pinned source was not forwarded")
        .unwrap();
    assert_eq!(&buf[..n], b"yep");
}

#[tokio::test]
async fn udp_address_learning_without_pin() {
    let config = ServerConfig {
        hooks: Arc::new(ListenOnlyHooks),
        ..Default::default()
    };
    let (server_addr, _cancel) = common::start_socks_server(config).await;

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let receiver_addr = receiver.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // All-zero hint: the session must learn our address from traffic.
    let (_control, relay_addr) = udp_associate(server_addr, TargetAddr::default()).await;

    let datagram = envelope(receiver_addr, b"ping");
    client.send_to(&datagram, relay_addr).await.unwrap();

    // The receiver answers whatever socket delivered the datagram (the
    // session's site socket).
    let mut buf = [0u8; 2048];
    let (n, site_addr) = timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
        .await
        .expect("datagram was not forwarded")
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    receiver.send_to(b"pong", site_addr).await.unwrap();

    // The reply comes back to the learned client address, wrapped in an
    // envelope naming the receiver.
    let (n, from) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
        .await
        .expect("reply was not forwarded back")
        .unwrap();
    assert_eq!(from, relay_addr);

    let packet = UdpPacket::parse(&buf[..n]).unwrap();
    assert_eq!(packet.addr, TargetAddr::Ip(receiver_addr));
    assert_eq!(&packet.data[..], b"pong");
}

#[tokio::test]
async fn udp_session_tears_down_on_control_close() {
    let config = ServerConfig {
        hooks: Arc::new(ListenOnlyHooks),
        ..Default::default()
    };
    let (server_addr, _cancel) = common::start_socks_server(config).await;

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let receiver_addr = receiver.local_addr().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (control, relay_addr) = udp_associate(server_addr, TargetAddr::default()).await;

    // The relay works while the control connection lives.
    client
        .send_to(&envelope(receiver_addr, b"alive"), relay_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
        .await
        .expect("relay not working before teardown")
        .unwrap();

    drop(control);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // After the control connection closes, nothing is forwarded.
    client
        .send_to(&envelope(receiver_addr, b"ghost"), relay_addr)
        .await
        .unwrap();
    let result = timeout(Duration::from_millis(300), receiver.recv_from(&mut buf)).await;
    assert!(result.is_err(), "relay still forwarding after teardown");
}
