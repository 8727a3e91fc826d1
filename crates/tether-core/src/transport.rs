//! Duplex byte streams and the connector/acceptor contract.
//!
//! The runtime only needs something it can read frames from and write
//! frames to. Concrete transports (TCP, Unix sockets, in-memory pairs) are
//! plugged in through [`Connector`] on the calling side and [`Acceptor`] on
//! the listening side.

use crate::config::ConnectionConfig;
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Any bidirectional byte stream a connection can run over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased duplex stream.
pub type BoxedStream = Box<dyn DuplexStream>;

/// Type-erased read half.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens a new stream to one logical peer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<BoxedStream>;
}

/// Yields streams from peers that connected to us.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> Result<BoxedStream>;
}

/// Connects to a TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", self.addr);
        Ok(Box::new(stream))
    }
}

/// Accepts TCP peers on a bound listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind a listener. Use port 0 to let the OS pick one.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self> {
        let listener = TcpListener::bind(addr.as_ref()).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<BoxedStream> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("Accepted TCP peer {}", peer_addr);
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
pub use self::unix::{UnixAcceptor, UnixConnector};

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};

    /// Connects to a Unix domain socket.
    #[derive(Debug, Clone)]
    pub struct UnixConnector {
        path: PathBuf,
    }

    impl UnixConnector {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    #[async_trait]
    impl Connector for UnixConnector {
        async fn connect(&self) -> Result<BoxedStream> {
            let stream = UnixStream::connect(&self.path).await?;
            debug!("Connected to {}", self.path.display());
            Ok(Box::new(stream))
        }
    }

    /// Accepts peers on a Unix domain socket.
    #[derive(Debug)]
    pub struct UnixAcceptor {
        listener: UnixListener,
        path: PathBuf,
    }

    impl UnixAcceptor {
        pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    #[async_trait]
    impl Acceptor for UnixAcceptor {
        async fn accept(&self) -> Result<BoxedStream> {
            let (stream, _) = self.listener.accept().await?;
            debug!("Accepted peer on {}", self.path.display());
            Ok(Box::new(stream))
        }
    }
}

/// An in-memory stream pair; what is written to one end is read from the other.
pub fn loopback() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
    tokio::io::duplex(ConnectionConfig::LOOPBACK_BUFFER_SIZE)
}

/// Create a connected in-memory connector/acceptor pair.
///
/// Every `connect()` builds a fresh loopback pair and hands the far end to
/// the acceptor. Connecting fails once the acceptor has been dropped.
pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector { tx },
        MemoryAcceptor {
            rx: Mutex::new(rx),
        },
    )
}

/// Calling side of [`memory_transport`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<tokio::io::DuplexStream>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let (near, far) = loopback();
        self.tx.send(far).map_err(|_| RpcError::Transport {
            message: "In-memory acceptor is gone".to_string(),
            source: Some(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
        })?;
        Ok(Box::new(near))
    }
}

/// Listening side of [`memory_transport`].
#[derive(Debug)]
pub struct MemoryAcceptor {
    rx: Mutex<mpsc::UnboundedReceiver<tokio::io::DuplexStream>>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> Result<BoxedStream> {
        match self.rx.lock().await.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(RpcError::Transport {
                message: "All in-memory connectors are gone".to_string(),
                source: Some(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_transport_pairs_streams() {
        let (connector, acceptor) = memory_transport();
        let mut near = connector.connect().await.unwrap();
        let mut far = acceptor.accept().await.unwrap();

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_memory_connect_fails_without_acceptor() {
        let (connector, acceptor) = memory_transport();
        drop(acceptor);
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_tcp_connect_and_accept() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string());

        let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_connect_and_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.sock");
        let acceptor = UnixAcceptor::bind(&path).unwrap();
        let connector = UnixConnector::new(&path);

        let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        server.write_all(b"yo").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yo");
    }
}
