//! TCP relay for the CONNECT command
//!
//! Dials the requested target and copies bytes in both directions until a
//! side closes, the idle deadline expires, or the session is cancelled.
//! Each direction runs its own loop with its own buffer; the first loop to
//! stop records why, cancels its peer, and that recorded outcome becomes
//! the relay result.
//!
//! With `fast_forward` enabled the success reply goes out before the dial,
//! trading failure reporting (the client only sees a close) for the
//! half-RTT a pipelining client saves on its first request.

use crate::error::Socks5Error;
use crate::proto::Reply;
use crate::server::ServerConfig;
use crate::types::{ReplyCode, TargetAddr};
use anyhow::{Context, Result};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle a parsed CONNECT request: reply, dial, relay.
pub async fn handle_connect<S>(
    mut client_stream: S,
    target: TargetAddr,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let success = Reply::new(ReplyCode::Succeeded, TargetAddr::default());

    if config.fast_forward {
        success
            .write(&mut client_stream)
            .await
            .context("failed to write fast-forward reply")?;
    }

    let addr = target.to_string();
    let site_stream = match timeout(
        config.site_tcp_dial_timeout,
        config.hooks.site_tcp_dial(&addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("dial to {} failed: {}", addr, err);
            if !config.fast_forward {
                let _ = Reply::error(ReplyCode::HostUnreachable)
                    .write(&mut client_stream)
                    .await;
            }
            return Err(anyhow::Error::from(err).context(format!("dial to {} failed", addr)));
        }
        Err(_) => {
            warn!("dial to {} timed out", addr);
            if !config.fast_forward {
                let _ = Reply::error(ReplyCode::HostUnreachable)
                    .write(&mut client_stream)
                    .await;
            }
            anyhow::bail!("dial to {} timed out", addr)
        }
    };

    if !config.fast_forward {
        success
            .write(&mut client_stream)
            .await
            .context("failed to write reply")?;
    }

    debug!("relay to {} established", addr);

    match relay(client_stream, site_stream, config, cancel).await {
        Ok(()) => Ok(()),
        // A closed stream is how relays normally end.
        Err(err) if is_clean_close(&err) => {
            debug!("relay to {} finished: {:#}", addr, err);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Copy bytes between two streams until one direction stops.
///
/// Returns the outcome the first-stopping direction recorded; a clean EOF
/// surfaces as an `UnexpectedEof` IO error the caller may treat as normal
/// termination.
pub async fn relay<A, B>(
    client: A,
    site: B,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (site_read, site_write) = tokio::io::split(site);

    let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
    let relay_token = cancel.child_token();

    let client_to_site = forward(
        client_read,
        site_write,
        config,
        relay_token.clone(),
        first_error.clone(),
        "client",
        "site",
    );
    let site_to_client = forward(
        site_read,
        client_write,
        config,
        relay_token.clone(),
        first_error.clone(),
        "site",
        "client",
    );

    // Whichever direction stops first drags the other down with it.
    tokio::join!(
        async {
            client_to_site.await;
            relay_token.cancel();
        },
        async {
            site_to_client.await;
            relay_token.cancel();
        },
    );

    let result = first_error.lock().unwrap().take();
    match result {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One direction of the relay.
///
/// The idle deadline applies to each read and each write separately and is
/// refreshed every iteration, so it bounds inactivity rather than session
/// length.
async fn forward<R, W>(
    mut src: ReadHalf<R>,
    mut dst: WriteHalf<W>,
    config: &ServerConfig,
    cancel: CancellationToken,
    first_error: Arc<Mutex<Option<anyhow::Error>>>,
    src_name: &'static str,
    dst_name: &'static str,
) where
    R: AsyncRead + AsyncWrite + Unpin + Send,
    W: AsyncRead + AsyncWrite + Unpin + Send,
{
    let idle = config.forward_timeout;
    let mut buf = vec![0u8; config.forward_buf_size];

    loop {
        if cancel.is_cancelled() {
            record(&first_error, Socks5Error::Cancelled.into());
            return;
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => {
                record(&first_error, Socks5Error::Cancelled.into());
                return;
            }
            result = timeout(idle, src.read(&mut buf)) => match result {
                Err(_) => {
                    record(
                        &first_error,
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("{} idle for too long", src_name),
                        )
                        .into(),
                    );
                    return;
                }
                Ok(Err(err)) => {
                    record(
                        &first_error,
                        anyhow::Error::from(err).context(format!("{} read failed", src_name)),
                    );
                    return;
                }
                Ok(Ok(0)) => {
                    record(
                        &first_error,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("{} closed the connection", src_name),
                        )
                        .into(),
                    );
                    return;
                }
                Ok(Ok(n)) => n,
            }
        };

        match timeout(idle, dst.write_all(&buf[..n])).await {
            Err(_) => {
                record(
                    &first_error,
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} write stalled", dst_name),
                    )
                    .into(),
                );
                return;
            }
            Ok(Err(err)) => {
                record(
                    &first_error,
                    anyhow::Error::from(err).context(format!("{} write failed", dst_name)),
                );
                return;
            }
            Ok(Ok(())) => {}
        }
    }
}

/// Install an error into the shared slot; the first writer wins.
fn record(slot: &Mutex<Option<anyhow::Error>>, err: anyhow::Error) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(err);
    }
}

/// Whether a relay outcome is a peer closing rather than a failure.
fn is_clean_close(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
}
