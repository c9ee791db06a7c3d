use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use warden_server::config::{Cli, LogFormat, ServeArgs, ServerConfig, default_host_identity};
use warden_server::tls::{self, AcmeRegistry, CertificateSource, TrustInstaller, TrustOutcome};
use warden_server::{FingerprintEcho, FingerprintListener, Server, install_rustls_crypto_provider};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let command = cli.command();
    if !command.needs_runtime() {
        return install_ca(&cli.serve);
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(cli.serve))
}

fn install_ca(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ca_dir = warden_server::paths::ca_dir()?;
    let identity = args
        .host_identity
        .clone()
        .unwrap_or_else(default_host_identity);

    let root = tls::ensure_root_ca(&ca_dir, &identity)?;
    tracing::info!(path = %root.cert_path.display(), "Root CA ready");

    match TrustInstaller::for_host().ensure_installed(&root)? {
        TrustOutcome::AlreadyTrusted => tracing::info!("Root CA is already trusted"),
        TrustOutcome::Installed => tracing::info!("Root CA installed"),
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_args(&args)?;

    tracing::info!("Warden Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("HTTPS listen: {}", config.listen);
    if let Some(addr) = config.http_listen {
        tracing::info!("HTTP listen: {}", addr);
    }
    tracing::info!("Data directory: {}", config.data_dir.display());

    std::fs::create_dir_all(&config.data_dir)?;

    let registry = AcmeRegistry::new();
    let source = Arc::new(CertificateSource::build(&config, &registry)?);
    tracing::info!(source = source.kind(), "Certificate source selected");
    source.prepare().await?;

    let tls_listener = FingerprintListener::bind(config.listen).await?;
    let http_listener = match config.http_listen {
        Some(addr) => Some(tokio::net::TcpListener::bind(addr).await?),
        None => None,
    };

    let server = Server::new(tls_listener, http_listener, source, Arc::new(FingerprintEcho))
        .with_renewal_interval(args.renewal_interval());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                // Keep the sender alive so the server keeps running.
                std::future::pending::<()>().await;
            }
        }
    });

    server.run(shutdown_rx).await;
    Ok(())
}
