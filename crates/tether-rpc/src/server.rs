//! Listener setup for `tether-rpc serve`.

use crate::service;
use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use tether_core::{Server, ServerHandle, TcpAcceptor};
use tracing::info;

/// Where the server ended up listening.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Start serving `SimpleService` over TCP.
///
/// Returns the bound address (useful when port=0).
pub async fn start_tcp(host: &str, port: u16) -> anyhow::Result<(ServerHandle, Endpoint)> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let acceptor = TcpAcceptor::bind(addr.to_string()).await?;
    let actual_addr = acceptor.local_addr()?;

    info!("Server listening on {}", actual_addr);
    Ok((
        Server::new(service::table())
            .on_session(|session| info!("Peer connected (session {})", session.id()))
            .start(acceptor),
        Endpoint::Tcp(actual_addr),
    ))
}

/// Start serving `SimpleService` on a Unix domain socket.
#[cfg(unix)]
pub fn start_unix(path: PathBuf) -> anyhow::Result<(ServerHandle, Endpoint)> {
    let acceptor = tether_core::UnixAcceptor::bind(&path)?;

    info!("Server listening on {}", path.display());
    Ok((
        Server::new(service::table())
            .on_session(|session| info!("Peer connected (session {})", session.id()))
            .start(acceptor),
        Endpoint::Unix(path),
    ))
}
