pub mod member;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use couloir_core::config::ExposeSettings;

use crate::member::{ControlConn, PoolEvent};

type Result<T> = color_eyre::Result<T>;

/// Open a couloir at the relay and keep it served until `shutdown` is
/// cancelled: the first connection learns the assigned host and key, then a
/// pool of idle joined connections absorbs incoming requests, refilled
/// eagerly whenever one starts streaming.
pub async fn run(settings: ExposeSettings, shutdown: CancellationToken) -> Result<()> {
    let settings = Arc::new(settings);
    let tls = if settings.http {
        None
    } else {
        Some(member::tls_connector())
    };

    let (mut conn, host, key) = member::open_couloir(&settings, tls.as_ref()).await?;
    member::join_couloir(&mut conn, &key).await?;

    print_open_banner(&settings, &host);

    let (events_tx, mut events_rx) = mpsc::channel::<PoolEvent>(32);
    let spawn_member = |initial: Option<ControlConn>| {
        tokio::spawn(member::run_member(
            settings.clone(),
            tls.clone(),
            key.clone(),
            initial,
            events_tx.clone(),
            shutdown.clone(),
        ));
    };

    spawn_member(Some(conn));
    for _ in 1..settings.concurrency.max(1) {
        spawn_member(None);
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("couloir closed");
                return Ok(());
            }
            event = events_rx.recv() => match event {
                Some(PoolEvent::Streaming) => spawn_member(None),
                Some(PoolEvent::Fatal(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}

fn print_open_banner(settings: &ExposeSettings, host: &str) {
    let scheme = if settings.http { "http" } else { "https" };
    let port = settings.relay_port();
    let shown_port = match (settings.http, port) {
        (true, 80) | (false, 443) => String::new(),
        _ => format!(":{port}"),
    };
    let public_url = format!("{scheme}://{host}{shown_port}");
    info!(url = %public_url, "couloir open");

    eprintln!();
    eprintln!("  Couloir open: {public_url}");
    eprintln!(
        "  Forwarding to http://{}:{}",
        settings.local_host, settings.local_port
    );
    eprintln!();
}
