use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use couloir_core::config::ExposeSettings;
use couloir_core::error::{CouloirError, Result};
use couloir_core::preface;
use couloir_core::protocol::{self, AckPayload, Frame, JoinPayload, OpenPayload};
use couloir_core::response::write_response;

pub trait ExposeIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ExposeIo for T {}

/// A connection to the relay, TCP or TLS, with buffered line reading for
/// the control phase. The buffer keeps serving once the connection turns
/// into a raw pipe, so no bytes are lost at the transition.
pub type ControlConn = BufReader<Box<dyn ExposeIo>>;

pub enum PoolEvent {
    /// An idle member received STREAM and is now a pipe; the pool should
    /// open a replacement.
    Streaming,
    /// The relay rejected us at the protocol level; the whole exposer must
    /// stop and surface the message.
    Fatal(CouloirError),
}

pub fn tls_connector() -> TlsConnector {
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Dial the relay, optionally through `--relay-ip`, with SNI set to the
/// relay host in TLS mode.
pub async fn dial_relay(
    settings: &ExposeSettings,
    tls: Option<&TlsConnector>,
) -> Result<ControlConn> {
    let port = settings.relay_port();
    let addr = match settings.relay_ip {
        Some(ip) => format!("{ip}:{port}"),
        None => format!("{}:{port}", settings.relay_host),
    };
    let tcp = tokio::time::timeout(Duration::from_secs(15), TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            CouloirError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connection to {addr} timed out"),
            ))
        })??;
    let stream: Box<dyn ExposeIo> = match tls {
        None => Box::new(tcp),
        Some(connector) => {
            let name = ServerName::try_from(settings.relay_host.clone()).map_err(|_| {
                CouloirError::Config(format!("invalid relay host {}", settings.relay_host))
            })?;
            Box::new(connector.connect(name, tcp).await?)
        }
    };
    Ok(BufReader::new(stream))
}

async fn expect_ack(conn: &mut ControlConn, id: u64) -> Result<AckPayload> {
    match protocol::read_frame(conn).await? {
        Some(Frame::Ack { payload, id: got }) if got == id => Ok(payload),
        Some(other) => Err(CouloirError::Protocol(format!(
            "expected ACK, got {}",
            other.tag()
        ))),
        None => Err(CouloirError::Protocol(
            "relay closed during handshake".to_string(),
        )),
    }
}

/// Open the couloir on a fresh connection: learn the assigned host and key.
pub async fn open_couloir(
    settings: &ExposeSettings,
    tls: Option<&TlsConnector>,
) -> Result<(ControlConn, String, String)> {
    let mut conn = dial_relay(settings, tls).await?;
    let frame = Frame::Open {
        payload: OpenPayload {
            host: settings.requested_host(),
            password: settings.password.clone(),
        },
        id: 1,
    };
    protocol::write_frame(&mut conn, &frame).await?;
    let ack = expect_ack(&mut conn, 1).await?;
    if let Some(error) = ack.error {
        return Err(CouloirError::Other(error));
    }
    let host = ack
        .host
        .ok_or_else(|| CouloirError::Protocol("open ack without a host".to_string()))?;
    let key = ack
        .key
        .ok_or_else(|| CouloirError::Protocol("open ack without a key".to_string()))?;
    Ok((conn, host, key))
}

/// Join the couloir so this connection becomes an idle tunnel slot.
pub async fn join_couloir(conn: &mut ControlConn, key: &str) -> Result<()> {
    let frame = Frame::Join {
        payload: JoinPayload {
            key: key.to_string(),
        },
        id: 2,
    };
    protocol::write_frame(conn, &frame).await?;
    let ack = expect_ack(conn, 2).await?;
    if let Some(error) = ack.error {
        return Err(CouloirError::Other(error));
    }
    Ok(())
}

enum WaitOutcome {
    Stream,
    Closed,
    Shutdown,
    Malformed(CouloirError),
}

async fn wait_for_stream(conn: &mut ControlConn, shutdown: &CancellationToken) -> WaitOutcome {
    tokio::select! {
        _ = shutdown.cancelled() => WaitOutcome::Shutdown,
        frame = protocol::read_frame(conn) => match frame {
            Ok(Some(Frame::Stream { .. })) => WaitOutcome::Stream,
            Ok(Some(other)) => WaitOutcome::Malformed(CouloirError::Protocol(format!(
                "expected STREAM, got {}",
                other.tag()
            ))),
            Ok(None) => WaitOutcome::Closed,
            Err(CouloirError::Io(_)) => WaitOutcome::Closed,
            Err(e) => WaitOutcome::Malformed(e),
        },
    }
}

/// One pool member: keep one idle joined connection toward the relay; once
/// STREAM arrives, become a pipe to the local server and finish. Dial
/// failures back off exponentially with jitter.
pub async fn run_member(
    settings: Arc<ExposeSettings>,
    tls: Option<TlsConnector>,
    key: String,
    initial: Option<ControlConn>,
    events: mpsc::Sender<PoolEvent>,
    shutdown: CancellationToken,
) {
    let mut idle = initial;
    let mut backoff = Duration::from_millis(500);
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let mut conn = match idle.take() {
            Some(conn) => conn,
            None => {
                let mut conn = match dial_relay(&settings, tls.as_ref()).await {
                    Ok(conn) => conn,
                    Err(CouloirError::Io(e)) => {
                        warn!(error = %e, "relay dial failed, retrying");
                        sleep_backoff(&mut backoff, &shutdown).await;
                        continue;
                    }
                    Err(e) => {
                        let _ = events.send(PoolEvent::Fatal(e)).await;
                        return;
                    }
                };
                match join_couloir(&mut conn, &key).await {
                    Ok(()) => {
                        backoff = Duration::from_millis(500);
                        conn
                    }
                    Err(CouloirError::Io(e)) => {
                        warn!(error = %e, "join failed, retrying");
                        sleep_backoff(&mut backoff, &shutdown).await;
                        continue;
                    }
                    Err(e) => {
                        let _ = events.send(PoolEvent::Fatal(e)).await;
                        return;
                    }
                }
            }
        };
        match wait_for_stream(&mut conn, &shutdown).await {
            WaitOutcome::Stream => {
                // Eager refill: restore the idle count before serving.
                let _ = events.send(PoolEvent::Streaming).await;
                serve_stream(conn, &settings).await;
                return; // tunnel connections are single-use
            }
            WaitOutcome::Closed => {
                debug!("relay closed an idle tunnel connection, rejoining");
                sleep_backoff(&mut backoff, &shutdown).await;
            }
            WaitOutcome::Shutdown => return,
            WaitOutcome::Malformed(e) => {
                let _ = events.send(PoolEvent::Fatal(e)).await;
                return;
            }
        }
    }
}

/// Pipe one request: dial the local server, optionally rewrite the Host
/// header of the buffered head, splice until either side closes. A local
/// dial failure answers 502 through the tunnel; the pool slot was already
/// refilled.
pub async fn serve_stream(mut relay: ControlConn, settings: &ExposeSettings) {
    let target = format!("{}:{}", settings.local_host, settings.local_port);
    let mut local = match TcpStream::connect(&target).await {
        Ok(local) => local,
        Err(e) => {
            warn!(target = %target, error = %e, "local server unreachable");
            let body = format!(
                "<html><body><h1>502 Bad Gateway</h1>\
                 <p>The couloir is open but nothing answers on <code>{target}</code>.</p>\
                 </body></html>"
            );
            let _ = write_response(&mut relay, 502, "Bad Gateway", &body).await;
            return;
        }
    };

    if let Some(override_host) = &settings.override_host {
        match read_head(&mut relay).await {
            Ok((head, rest)) => {
                let rewritten = preface::rewrite_host(&head, override_host);
                if local.write_all(&rewritten).await.is_err() {
                    return;
                }
                if !rest.is_empty() && local.write_all(&rest).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed reading the request head");
                return;
            }
        }
    }

    match tokio::io::copy_bidirectional(&mut relay, &mut local).await {
        Ok((to_local, to_relay)) => debug!(to_local, to_relay, "request finished"),
        Err(e) => debug!(error = %e, "request ended with error"),
    }
}

/// Buffer the request head; bytes already read past it are returned too.
async fn read_head(relay: &mut ControlConn) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = preface::head_len(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > 64 * 1024 {
            return Err(CouloirError::InvalidProtocol(
                "oversized request head".to_string(),
            ));
        }
        let n = relay.read(&mut chunk).await?;
        if n == 0 {
            return Err(CouloirError::InvalidProtocol(
                "stream ended mid-head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn sleep_backoff(backoff: &mut Duration, shutdown: &CancellationToken) {
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    tokio::select! {
        _ = tokio::time::sleep(*backoff + jitter) => {}
        _ = shutdown.cancelled() => {}
    }
    *backoff = (*backoff * 2).min(Duration::from_secs(30));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn settings_for(port: u16, override_host: Option<&str>) -> ExposeSettings {
        ExposeSettings {
            local_port: port,
            relay_host: "my.test".to_string(),
            local_host: "127.0.0.1".to_string(),
            override_host: override_host.map(str::to_string),
            http: true,
            ..Default::default()
        }
    }

    fn as_conn(stream: tokio::io::DuplexStream) -> ControlConn {
        BufReader::new(Box::new(stream) as Box<dyn ExposeIo>)
    }

    #[tokio::test]
    async fn test_serve_stream_pipes_to_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = settings_for(port, None);

        let (mut relay_side, member_side) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            serve_stream(as_conn(member_side), &settings).await;
        });

        relay_side
            .write_all(b"GET / HTTP/1.1\r\nHost: demo.my.test\r\n\r\n")
            .await
            .unwrap();
        relay_side.shutdown().await.unwrap();

        let (mut local, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        local.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"GET / HTTP/1.1\r\nHost: demo.my.test\r\n\r\n".to_vec());

        local.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(local);

        let mut reply = Vec::new();
        relay_side.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 204 No Content\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_serve_stream_rewrites_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = settings_for(port, Some("internal.local"));

        let (mut relay_side, member_side) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            serve_stream(as_conn(member_side), &settings).await;
        });

        relay_side
            .write_all(b"GET / HTTP/1.1\r\nHost: demo.my.test\r\n\r\nbody")
            .await
            .unwrap();
        relay_side.shutdown().await.unwrap();

        let (mut local, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        local.read_to_end(&mut seen).await.unwrap();
        assert_eq!(
            seen,
            b"GET / HTTP/1.1\r\nHost: internal.local\r\n\r\nbody".to_vec()
        );
    }

    #[tokio::test]
    async fn test_serve_stream_answers_502_when_local_is_down() {
        // Grab a port that nothing listens on.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let settings = settings_for(port, None);

        let (mut relay_side, member_side) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            serve_stream(as_conn(member_side), &settings).await;
        });

        relay_side
            .write_all(b"GET / HTTP/1.1\r\nHost: demo.my.test\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        relay_side.read_to_end(&mut reply).await.unwrap();
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{text}");
    }

    #[tokio::test]
    async fn test_read_head_splits_at_boundary() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\ntrailing")
            .await
            .unwrap();
        drop(a);
        let mut conn = as_conn(b);
        let (head, rest) = read_head(&mut conn).await.unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
        assert_eq!(rest, b"trailing".to_vec());
    }
}
