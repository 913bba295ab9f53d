use std::net::IpAddr;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use couloir_core::config::Settings;

#[derive(Parser)]
#[command(name = "couloir", version, about = "Couloir - HTTP reverse tunnel over named subdomains")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay
    Relay {
        /// Domain whose wildcard DNS record points at this host
        domain: String,

        /// Listen port (default: 443, or 80 with --http)
        #[arg(long)]
        port: Option<u16>,

        /// Serve plain HTTP instead of TLS (no certificates)
        #[arg(long)]
        http: bool,

        /// Require this password to open a couloir
        #[arg(long)]
        password: Option<String>,

        /// Contact email for the ACME account
        #[arg(long)]
        email: Option<String>,

        /// Directory for cached certificates
        #[arg(long)]
        certs_dir: Option<String>,
    },
    /// Expose a local HTTP server through a relay
    Expose {
        /// Port of the local server to expose
        local_port: u16,

        /// Relay domain to open the couloir on
        #[arg(long = "on")]
        on: String,

        /// Requested couloir name (subdomain label)
        #[arg(long = "as")]
        name: Option<String>,

        /// Relay port (default: 443, or 80 with --http)
        #[arg(long)]
        relay_port: Option<u16>,

        /// Dial this IP instead of resolving the relay host
        #[arg(long)]
        relay_ip: Option<IpAddr>,

        /// Host the local server listens on
        #[arg(long)]
        local_host: Option<String>,

        /// Rewrite the Host header of forwarded requests
        #[arg(long)]
        override_host: Option<String>,

        /// Talk to the relay over plain TCP instead of TLS
        #[arg(long)]
        http: bool,

        /// Password configured at the relay
        #[arg(long)]
        password: Option<String>,

        /// Idle tunnel connections to keep open
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "couloir=info,couloir_relay=info,couloir_expose=info".into()
            }),
        )
        .init();
}

/// Cancel `shutdown` on the first Ctrl+C or SIGTERM.
fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            _ = terminate => info!("termination signal received, shutting down"),
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load(None).unwrap_or_default();
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    match cli.command {
        Commands::Relay {
            domain,
            port,
            http,
            password,
            email,
            certs_dir,
        } => {
            let mut relay = settings.relay;
            relay.domain = domain;
            relay.http = http;
            if port.is_some() {
                relay.port = port;
            }
            if password.is_some() {
                relay.password = password;
            }
            if email.is_some() {
                relay.email = email;
            }
            if let Some(dir) = certs_dir {
                relay.certs_dir = dir;
            }
            couloir_relay::serve(relay, shutdown).await?;
        }
        Commands::Expose {
            local_port,
            on,
            name,
            relay_port,
            relay_ip,
            local_host,
            override_host,
            http,
            password,
            concurrency,
        } => {
            let mut expose = settings.expose;
            expose.local_port = local_port;
            expose.relay_host = on;
            expose.http = http;
            if name.is_some() {
                expose.name = name;
            }
            if relay_port.is_some() {
                expose.relay_port = relay_port;
            }
            if relay_ip.is_some() {
                expose.relay_ip = relay_ip;
            }
            if let Some(host) = local_host {
                expose.local_host = host;
            }
            if override_host.is_some() {
                expose.override_host = override_host;
            }
            if password.is_some() {
                expose.password = password;
            }
            if let Some(k) = concurrency {
                expose.concurrency = k;
            }
            couloir_expose::run(expose, shutdown).await?;
        }
    }

    Ok(())
}
