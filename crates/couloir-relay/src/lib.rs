pub mod certs;
pub mod pages;
pub mod registry;
pub mod socket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use couloir_core::config::RelaySettings;

use crate::certs::{CertStore, SniResolver};
use crate::registry::Registry;

pub trait RelayIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayIo for T {}

/// An accepted connection, TCP or TLS.
pub type RelayStream = Box<dyn RelayIo>;

/// Everything a connection task needs, shared across the relay.
pub struct RelayContext {
    pub settings: RelaySettings,
    pub registry: Arc<Registry>,
    pub certs: Option<Arc<CertStore>>,
    pub shutdown: CancellationToken,
    next_socket_id: AtomicU64,
}

impl RelayContext {
    pub fn new(
        settings: RelaySettings,
        certs: Option<Arc<CertStore>>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(Registry::new(
            settings.domain.clone(),
            settings.password.clone(),
        ));
        Self {
            settings,
            registry,
            certs,
            shutdown,
            next_socket_id: AtomicU64::new(1),
        }
    }

    pub fn next_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Run the relay until `shutdown` is cancelled. Binds the main listener
/// (TLS with SNI by default, plain TCP with `http`) and, in TLS mode, the
/// port-80 listener answering ACME HTTP-01 challenges.
pub async fn serve(settings: RelaySettings, shutdown: CancellationToken) -> color_eyre::Result<()> {
    let domain = settings.domain.clone();
    let port = settings.bind_port();

    if settings.http && settings.password.is_some() {
        warn!("a password is configured but --http sends it in cleartext; use TLS in production");
    }

    let certs = if settings.http {
        None
    } else {
        // Several crates in the tree enable different rustls backends; pin
        // the process-wide provider before any config is built.
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

        let store = CertStore::new(
            settings.certs_dir(),
            settings.email.clone(),
            shutdown.clone(),
        )?;

        let challenge_listener = TcpListener::bind(("0.0.0.0", 80)).await?;
        let router = certs::challenge_router(store.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(challenge_listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "challenge listener failed");
            }
        });

        // Warm the apex and the first default couloir name so the earliest
        // TLS handshakes do not hit a cold SNI miss.
        store.spawn_ensure(domain.clone());
        store.spawn_ensure(format!("couloir.{domain}"));

        Some(store)
    };

    let ctx = Arc::new(RelayContext::new(settings, certs, shutdown.clone()));

    let acceptor = ctx.certs.as_ref().map(|store| {
        let resolver = SniResolver {
            store: store.clone(),
            registry: ctx.registry.clone(),
        };
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsAcceptor::from(Arc::new(config))
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(
        port,
        domain = %domain,
        mode = if ctx.settings.http { "http" } else { "tls" },
        "couloir relay listening"
    );

    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        match &acceptor {
            None => {
                tokio::spawn(async move {
                    socket::handle_connection(Box::new(tcp), peer, ctx).await;
                });
            }
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => socket::handle_connection(Box::new(tls), peer, ctx).await,
                        Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
        }
    }

    info!("couloir relay stopped");
    Ok(())
}
