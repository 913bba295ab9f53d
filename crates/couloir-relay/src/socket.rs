use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use couloir_core::error::CouloirError;
use couloir_core::preface::{self, Classification};
use couloir_core::protocol::{self, AckPayload, Frame};
use couloir_core::response::write_response;

use crate::pages;
use crate::registry::PendingClient;
use crate::{RelayContext, RelayStream};

enum Preface {
    /// A complete control line is buffered; the socket is an exposer.
    Control(Vec<u8>),
    /// A complete request head is buffered; the socket is an HTTP client.
    Http(Vec<u8>),
    /// The peer hung up before sending anything. Benign.
    Empty,
    Invalid,
    TimedOut,
}

/// Drive one accepted socket from classification to close.
pub async fn handle_connection(mut stream: RelayStream, peer: SocketAddr, ctx: Arc<RelayContext>) {
    let preface = match read_preface(&mut stream, &ctx).await {
        Ok(preface) => preface,
        Err(e) => {
            debug!(%peer, error = %e, "preface read failed");
            return;
        }
    };
    match preface {
        Preface::Empty => debug!(%peer, "socket closed before sending any bytes"),
        Preface::TimedOut => {
            warn!(%peer, "timed out waiting for a request head");
            let _ = write_response(&mut stream, 408, "Request Timeout", &pages::timeout()).await;
        }
        Preface::Invalid => {
            warn!(%peer, "invalid preface, neither control line nor HTTP");
            let _ = write_response(&mut stream, 400, "Bad Request", &pages::bad_request()).await;
        }
        Preface::Control(buf) => control_loop(stream, buf, peer, ctx).await,
        Preface::Http(buf) => route_client(stream, buf, peer, ctx).await,
    }
}

/// Accumulate the preface until it classifies, under the header timeout and
/// the preface size cap.
async fn read_preface(stream: &mut RelayStream, ctx: &RelayContext) -> std::io::Result<Preface> {
    let limit = ctx.settings.max_preface_bytes;
    let window = Duration::from_secs(ctx.settings.header_timeout_secs);
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    enum Verdict {
        Control,
        Http,
        Empty,
        Invalid,
    }

    let read_loop = async {
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return std::io::Result::Ok(if buf.is_empty() {
                    Verdict::Empty
                } else {
                    Verdict::Invalid
                });
            }
            buf.extend_from_slice(&chunk[..n]);
            match preface::classify(&buf) {
                Classification::Control => return Ok(Verdict::Control),
                Classification::Http => return Ok(Verdict::Http),
                Classification::Invalid => return Ok(Verdict::Invalid),
                Classification::Incomplete => {
                    if buf.len() > limit {
                        return Ok(Verdict::Invalid);
                    }
                }
            }
        }
    };

    let verdict = match tokio::time::timeout(window, read_loop).await {
        Ok(result) => result?,
        Err(_) => return Ok(Preface::TimedOut),
    };
    Ok(match verdict {
        Verdict::Control => Preface::Control(buf),
        Verdict::Http => Preface::Http(buf),
        Verdict::Empty => Preface::Empty,
        Verdict::Invalid => Preface::Invalid,
    })
}

/// Pull the next CRLF-terminated line out of `buf`, reading more from the
/// stream as needed. Bytes past the line stay in `buf` for the next call.
async fn next_line(stream: &mut RelayStream, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = preface::find_crlf(buf) {
            let line: Vec<u8> = buf.drain(..pos + 2).collect();
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        if buf.len() > protocol::MAX_LINE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized control line",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_ack(stream: &mut RelayStream, payload: AckPayload, id: u64) -> couloir_core::error::Result<()> {
    protocol::write_frame(stream, &Frame::Ack { payload, id }).await
}

/// The socket is an exposer: serve control frames until it joins a couloir
/// (then park it idle) or disconnects. Errors are acked to the peer and the
/// socket closed; they never touch other sockets.
async fn control_loop(
    mut stream: RelayStream,
    mut buf: Vec<u8>,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
) {
    loop {
        let line = match next_line(&mut stream, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(%peer, "control socket closed");
                return;
            }
            Err(e) => {
                debug!(%peer, error = %e, "control socket read failed");
                return;
            }
        };
        let frame = match Frame::parse(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "malformed control line");
                return;
            }
        };
        match frame {
            Frame::Open { payload, id } => match ctx.registry.open(&payload) {
                Ok(opened) => {
                    if let Some(store) = &ctx.certs {
                        store.spawn_ensure(opened.host.clone());
                    }
                    if write_ack(&mut stream, AckPayload::opened(opened.host, opened.key), id)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "open rejected");
                    let _ = write_ack(&mut stream, AckPayload::error(e.to_string()), id).await;
                    return;
                }
            },
            Frame::Join { payload, id } => match ctx.registry.join(&payload.key) {
                Ok(host) => {
                    // Ack first: the ack must never be reordered behind a
                    // STREAM sent to the freshly registered slot.
                    if write_ack(&mut stream, AckPayload::ok(), id).await.is_err() {
                        return;
                    }
                    park_exposer(stream, buf, host, peer, ctx).await;
                    return;
                }
                Err(e) => {
                    warn!(%peer, "join with unknown key");
                    let _ = write_ack(&mut stream, AckPayload::error(e.to_string()), id).await;
                    return;
                }
            },
            Frame::Stream { .. } | Frame::Ack { .. } => {
                warn!(%peer, tag = frame.tag(), "unexpected control frame from exposer");
                return;
            }
        }
    }
}

/// A joined exposer sits idle until pairing hands it a client or the peer
/// goes away. The socket stays owned here so disconnects are noticed even
/// while the slot waits in the registry.
async fn park_exposer(
    mut stream: RelayStream,
    leftover: Vec<u8>,
    host: String,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
) {
    if !leftover.is_empty() {
        warn!(%peer, host = %host, "exposer sent bytes before STREAM, dropping socket");
        return;
    }
    let id = ctx.next_socket_id();
    let (handoff_tx, mut handoff_rx) = oneshot::channel();
    ctx.registry.add_exposer(&host, id, handoff_tx);
    debug!(%peer, host = %host, socket = id, "exposer idle");

    enum Idle {
        Claimed(Result<PendingClient, oneshot::error::RecvError>),
        PeerActivity(std::io::Result<usize>),
        Shutdown,
    }

    let outcome = {
        let mut probe = [0u8; 1];
        tokio::select! {
            claimed = &mut handoff_rx => Idle::Claimed(claimed),
            read = stream.read(&mut probe) => Idle::PeerActivity(read),
            _ = ctx.shutdown.cancelled() => Idle::Shutdown,
        }
    };

    match outcome {
        Idle::Claimed(Ok(client)) => serve_pair(stream, client, &host, &ctx).await,
        // Slot dropped without a client: the couloir was torn down.
        Idle::Claimed(Err(_)) => debug!(%peer, host = %host, "couloir closed while idle"),
        Idle::PeerActivity(read) => {
            match read {
                Ok(0) => debug!(%peer, host = %host, "exposer disconnected while idle"),
                Ok(_) => warn!(%peer, host = %host, "exposer sent bytes while idle, dropping socket"),
                Err(e) => debug!(%peer, host = %host, error = %e, "exposer failed while idle"),
            }
            if !ctx.registry.remove_exposer(&host, id) {
                // Pairing claimed the slot in the meantime; the client is in
                // flight on the handoff channel. Put it back in line.
                if let Ok(client) = handoff_rx.await {
                    ctx.registry.requeue_client(&host, client);
                    ctx.registry.pair_finished(&host);
                }
            }
        }
        Idle::Shutdown => {
            ctx.registry.remove_exposer(&host, id);
        }
    }
}

/// Bind one exposer socket to one client: announce the stream, replay the
/// client's buffered preface, then splice until either side closes. EOF in
/// one direction shuts down the other, so FINs propagate cleanly.
async fn serve_pair(
    mut exposer: RelayStream,
    mut client: PendingClient,
    host: &str,
    ctx: &Arc<RelayContext>,
) {
    let stream_id = ctx.next_socket_id();
    let handoff = async {
        protocol::write_frame(&mut exposer, &Frame::Stream { id: stream_id }).await?;
        exposer.write_all(&client.preface).await?;
        exposer.flush().await?;
        Ok::<_, CouloirError>(())
    }
    .await;

    if let Err(e) = handoff {
        // The exposer died between pairing and the first write. The client
        // stream is untouched, so it can wait for the next exposer.
        debug!(host = %host, error = %e, "exposer went away before streaming, requeueing client");
        ctx.registry.requeue_client(host, client);
        ctx.registry.pair_finished(host);
        return;
    }

    let spliced = tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client.stream, &mut exposer) => result,
        _ = ctx.shutdown.cancelled() => Ok((0, 0)),
    };
    match spliced {
        Ok((from_client, from_exposer)) => {
            debug!(host = %host, from_client, from_exposer, "pair closed");
        }
        Err(e) => debug!(host = %host, error = %e, "pair closed with error"),
    }
    ctx.registry.pair_finished(host);
}

/// The socket is an HTTP client: route it by Host header.
async fn route_client(
    mut stream: RelayStream,
    preface_buf: Vec<u8>,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
) {
    let Some(head_end) = preface::head_len(&preface_buf) else {
        let _ = write_response(&mut stream, 400, "Bad Request", &pages::bad_request()).await;
        return;
    };
    let host = match preface::host_from_head(&preface_buf[..head_end]) {
        Ok(host) => host,
        Err(e) => {
            warn!(%peer, error = %e, "unroutable request");
            let _ = write_response(&mut stream, 400, "Bad Request", &pages::bad_request()).await;
            return;
        }
    };

    if host == ctx.registry.domain() {
        let page = pages::index(ctx.registry.domain());
        let _ = write_response(&mut stream, 200, "OK", &page).await;
        return;
    }

    let client = PendingClient {
        id: ctx.next_socket_id(),
        stream,
        preface: preface_buf,
    };
    match ctx.registry.route_client(&host, client) {
        Ok(()) => debug!(%peer, host = %host, "client waiting for exposer"),
        Err(client) => {
            let mut stream = client.stream;
            debug!(%peer, host = %host, "no couloir for host");
            let _ = write_response(&mut stream, 404, "Not Found", &pages::not_found(&host)).await;
        }
    }
}
