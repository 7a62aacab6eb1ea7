use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::conn::Connection;
use crate::handler::LdapOperations;
use crate::writer::MessageWriter;

/// The accept loop: one protocol engine task per accepted transport.
pub struct LdapServer<H> {
    listen_url: String,
    handler: Arc<H>,
    tls_acceptor: Option<TlsAcceptor>,
    max_message_bytes: usize,
}

impl<H: LdapOperations> LdapServer<H> {
    pub fn new(
        listen_url: String,
        handler: Arc<H>,
        tls_acceptor: Option<TlsAcceptor>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            listen_url,
            handler,
            tls_acceptor,
            max_message_bytes,
        }
    }

    /// Accept until `shutdown` fires, then join every connection task.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let endpoint = resolve_listen_url(&self.listen_url)?;
        if endpoint.tls && self.tls_acceptor.is_none() {
            anyhow::bail!(
                "listen URL {} needs the tls section of the config",
                self.listen_url
            );
        }

        let listener = TcpListener::bind(&endpoint.addr)
            .await
            .with_context(|| format!("Failed to bind to {}", endpoint.addr))?;
        info!("listening on {}", self.listen_url);

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.spawn_connection(&tracker, stream, peer_addr);
                    }
                    Err(e) => error!("failed to accept connection: {}", e),
                },
            }
        }

        info!("shutting down, waiting for {} connection(s)", tracker.len());
        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    fn spawn_connection(&self, tracker: &TaskTracker, stream: TcpStream, peer_addr: SocketAddr) {
        debug!("[{}]: accepted", peer_addr);
        let handler = Arc::clone(&self.handler);
        let acceptor = self.tls_acceptor.clone();
        let max_message_bytes = self.max_message_bytes;
        tracker.spawn(async move {
            let peer = peer_addr.to_string();
            // The engine only ever sees a reader/writer pair, so each
            // transport flavor is split where its concrete type is known.
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let (read_half, write_half) = tokio::io::split(tls_stream);
                        drive(read_half, write_half, handler, peer, max_message_bytes).await;
                    }
                    Err(e) => error!("[{}]: TLS handshake failed: {}", peer, e),
                },
                None => {
                    let (read_half, write_half) = stream.into_split();
                    drive(read_half, write_half, handler, peer, max_message_bytes).await;
                }
            }
        });
    }
}

async fn drive<R, W, H>(
    reader: R,
    write_half: W,
    handler: Arc<H>,
    peer: String,
    max_message_bytes: usize,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
    H: LdapOperations,
{
    let writer = MessageWriter::new(write_half);
    let conn = Connection::new(writer, handler, peer.clone(), max_message_bytes);
    match conn.run(reader).await {
        Ok(()) => debug!("[{}]: closed", peer),
        Err(e) => warn!("[{}]: {}", peer, e),
    }
}

/// Where a listen URL puts the server: the socket address, and whether the
/// listener speaks TLS from the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub addr: SocketAddr,
    pub tls: bool,
}

/// Interpret the config's listen URL. The scheme selects plain vs TLS and
/// supplies the default port (389 / 636); an empty host binds every
/// interface.
pub fn resolve_listen_url(url: &str) -> Result<ListenEndpoint> {
    let (tls, rest) = match url.split_once("://") {
        Some(("ldap", rest)) => (false, rest),
        Some(("ldaps", rest)) => (true, rest),
        _ => anyhow::bail!("listen URL {:?} must start with ldap:// or ldaps://", url),
    };
    let rest = rest.trim_matches('/');
    if let Ok(addr) = rest.parse::<SocketAddr>() {
        return Ok(ListenEndpoint { addr, tls });
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("listen URL {:?} has an unusable port", url))?,
        ),
        None => (rest, if tls { 636 } else { 389 }),
    };
    let ip = if host.is_empty() {
        IpAddr::from([0, 0, 0, 0])
    } else {
        host.parse()
            .with_context(|| format!("listen URL {:?} has an unusable host", url))?
    };
    Ok(ListenEndpoint {
        addr: SocketAddr::new(ip, port),
        tls,
    })
}
