//! edge-listener
//!
//! An echo server fronted by the listener decorators from the library.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ TcpAcceptor ──▶ ConnectionLimiter ──▶ TlsListener ──▶ echo task
//!                                  (slot per conn)      (lazy handshake)
//!                                                             ▲
//!                                                             │ current certificate
//!                                                    CertificateWatcher
//!                                                  (notify + SIGHUP reload)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use edge_listener::config::{load_config, validate_config, ConfigError, EdgeConfig, TlsConfig};
use edge_listener::lifecycle::{signals, startup, Shutdown};
use edge_listener::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "edge-listener")]
#[command(about = "Echo server with connection limiting and hot-reloaded TLS", long_about = None)]
struct Cli {
    /// TOML configuration file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long)]
    bind: Option<String>,

    /// Maximum concurrently admitted connections.
    #[arg(short, long)]
    max_connections: Option<usize>,

    /// PEM certificate chain. Enables TLS together with --key.
    #[arg(long, requires = "key")]
    cert: Option<String>,

    /// PEM private key.
    #[arg(long, requires = "cert")]
    key: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<EdgeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => EdgeConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(limit) = self.max_connections {
            config.listener.max_connections = Some(limit);
        }
        if let (Some(cert_path), Some(key_path)) = (self.cert, self.key) {
            let alpn_protocols = config
                .listener
                .tls
                .take()
                .map(|tls| tls.alpn_protocols)
                .unwrap_or_default();
            config.listener.tls = Some(TlsConfig {
                cert_path,
                key_path,
                alpn_protocols,
            });
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;

    logging::init_logging(&config.observability.log_level)?;

    tracing::info!("edge-listener v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = ?config.listener.max_connections,
        tls = config.listener.tls.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let shutdown = Arc::new(Shutdown::new());
    tokio::spawn(signals::shutdown_on_signal(Arc::clone(&shutdown)));

    startup::run(&config, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
