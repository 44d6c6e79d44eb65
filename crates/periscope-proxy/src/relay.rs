//! HTTP/1.1 tap relay.
//!
//! Each accepted connection carries one exchange: the client's request is
//! rewritten to origin form and pinned to the fixed upstream with
//! `Connection: close`, then the upstream's response is streamed back to the
//! client byte-for-byte while a copy accumulates for the interceptor. The
//! close-delimited exchange keeps the captured bytes exactly as they were
//! framed on the wire, chunked records and compressed payloads included -
//! which is what the decoder needs.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use periscope_core::decode;
use periscope_core::session::ControlSignal;

use crate::error::RelayError;
use crate::intercept::Interceptor;

const READ_BUFFER: usize = 16 * 1024;

/// How long in-flight exchanges get to finish after the listener stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the relay listener until a stop signal or process interrupt.
///
/// Shutdown is graceful: the loop stops accepting, then waits (bounded) for
/// in-flight exchanges to drain before returning.
pub async fn run(
    listener: TcpListener,
    upstream: SocketAddr,
    interceptor: Interceptor,
    mut control: mpsc::Receiver<ControlSignal>,
) {
    let mut connections = JoinSet::new();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                tracing::info!("interrupt received, stopping proxy listener");
                break;
            }
            signal = control.recv() => {
                match signal {
                    Some(ControlSignal::Stop) => {
                        tracing::info!("stop signal received, stopping proxy listener");
                    }
                    None => tracing::debug!("control channel closed, stopping proxy listener"),
                }
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, peer)) => {
                        let interceptor = interceptor.clone();
                        connections.spawn(async move {
                            if let Err(error) = relay_connection(client, upstream, &interceptor).await {
                                tracing::debug!(%peer, %error, "connection ended with error");
                            }
                        });
                    }
                    Err(error) => tracing::warn!(%error, "accept failed"),
                }
            }
        }
    }

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("in-flight exchanges did not drain in time, aborting them");
        connections.abort_all();
    }
    tracing::info!("proxy listener stopped");
}

/// Relays one exchange and hands the raw response to the interceptor.
async fn relay_connection(
    mut client: TcpStream,
    upstream: SocketAddr,
    interceptor: &Interceptor,
) -> Result<(), RelayError> {
    let request = match read_request(&mut client).await? {
        Some(request) => request,
        // Connection opened and closed without sending anything.
        None => return Ok(()),
    };
    let forwarded = rewrite_request(&request, upstream)?;

    let mut origin = TcpStream::connect(upstream).await?;
    origin.write_all(&forwarded).await?;

    // Stream the response back verbatim while keeping a copy for decoding.
    // The upstream closes the connection when the response ends.
    let mut raw = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = origin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client.write_all(&buf[..n]).await?;
        raw.extend_from_slice(&buf[..n]);
    }
    client.flush().await?;

    interceptor.observe(&raw);
    Ok(())
}

/// A client request: header block plus declared body bytes.
struct RawRequest {
    head: String,
    body: Vec<u8>,
}

/// Reads one request from the client.
///
/// Returns `None` if the client closed without sending anything. Request
/// bodies are delimited by `Content-Length`; this relay does not accept
/// chunked request bodies (the capture targets never send them).
async fn read_request(client: &mut TcpStream) -> Result<Option<RawRequest>, RelayError> {
    let mut collected = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let boundary = loop {
        if let Some(pos) = collected.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = client.read(&mut buf).await?;
        if n == 0 {
            if collected.is_empty() {
                return Ok(None);
            }
            return Err(RelayError::IncompleteRequest);
        }
        collected.extend_from_slice(&buf[..n]);
    };

    let head_end = boundary + 4;
    let head = String::from_utf8_lossy(&collected[..head_end]).into_owned();
    let declared = decode::declared_content_length(&head).max(0) as usize;

    let mut body = collected[head_end..].to_vec();
    while body.len() < declared {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(RelayError::IncompleteRequest);
        }
        body.extend_from_slice(&buf[..n]);
    }
    Ok(Some(RawRequest { head, body }))
}

/// Rewrites a request for the fixed upstream.
///
/// Proxy-configured clients send the absolute form in the request line; it
/// is reduced to origin form, `Host` is pinned to the upstream, and
/// `Connection: close` makes the exchange close-delimited. Every other
/// header passes through untouched.
fn rewrite_request(request: &RawRequest, upstream: SocketAddr) -> Result<Vec<u8>, RelayError> {
    let mut lines = request.head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RelayError::MalformedRequestLine(request_line.to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| RelayError::MalformedRequestLine(request_line.to_string()))?;

    let origin_form = match target.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        },
        None => target,
    };

    let mut head = format!("{method} {origin_form} HTTP/1.1\r\n");
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let name = line
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if matches!(
            name.as_str(),
            "host" | "connection" | "proxy-connection" | "keep-alive"
        ) {
            continue;
        }
        head.push_str(line);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Host: {}\r\n", host_header(upstream)));
    head.push_str("Connection: close\r\n\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&request.body);
    Ok(bytes)
}

fn host_header(upstream: SocketAddr) -> String {
    if upstream.port() == 80 {
        upstream.ip().to_string()
    } else {
        upstream.to_string()
    }
}
