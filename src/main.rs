use anyhow::Result;
use clap::Parser;
use ldapd::directory::InMemoryDirectory;
use ldapd::{tls, Config, LdapServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "ldapd")]
#[command(about = "LDAPv3 server serving an in-memory directory")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldapd={},info", log_level))
        .init();

    let config = Config::from_file(&args.config)?;
    let listen_url = args
        .listen
        .clone()
        .unwrap_or_else(|| config.listen.url.clone());

    info!("starting ldapd on {}", listen_url);
    info!("naming contexts: {:?}", config.naming_contexts);
    info!("directory entries: {}", config.directory.entries.len());

    let tls_acceptor = match &config.tls {
        Some(tls_config) => {
            let server_config = tls::load_server_config(tls_config)?;
            info!("TLS enabled for listener");
            Some(TlsAcceptor::from(server_config))
        }
        None => None,
    };

    let handler = Arc::new(InMemoryDirectory::from_config(&config));
    let server = LdapServer::new(
        listen_url,
        handler,
        tls_acceptor,
        config.limits.max_message_bytes,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    server.serve(shutdown).await
}
