//! Tether RPC - command line server and client for `SimpleService`.
//!
//! `serve` listens on TCP (or a Unix socket) and prints the bound endpoint
//! on stdout so a parent process can find it. `sqrt` and `indefinite` are
//! one-shot clients.

mod server;
mod service;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use service::SimpleClient;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::{BoxedStream, CancellationToken, Connector, RpcError, Session, TcpConnector};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Serve or call the tether sample service")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve SimpleService until interrupted
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Listen on a Unix domain socket instead of TCP
        #[arg(long)]
        unix: Option<PathBuf>,
    },

    /// Call Sqrt once and print the result
    Sqrt {
        #[command(flatten)]
        target: Target,

        /// Input value (negative values yield NaN)
        #[arg(long, allow_negative_numbers = true)]
        value: f64,

        /// Give up after this many milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// Start an Indefinite call and cancel it after a delay
    Indefinite {
        #[command(flatten)]
        target: Target,

        /// Cancel after this many milliseconds
        #[arg(long, default_value = "100")]
        cancel_after_ms: u64,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Server address (host:port)
    #[arg(long, conflicts_with = "unix")]
    addr: Option<String>,

    /// Server Unix socket path
    #[arg(long)]
    unix: Option<PathBuf>,
}

impl Target {
    async fn connect(&self) -> Result<BoxedStream> {
        match (&self.addr, &self.unix) {
            (Some(addr), _) => Ok(TcpConnector::new(addr.clone()).connect().await?),
            #[cfg(unix)]
            (None, Some(path)) => Ok(tether_core::UnixConnector::new(path).connect().await?),
            #[cfg(not(unix))]
            (None, Some(_)) => bail!("Unix sockets are not supported on this platform"),
            (None, None) => bail!("one of --addr or --unix is required"),
        }
    }

    async fn client(&self) -> Result<(Session, SimpleClient)> {
        let session = Session::client(self.connect().await?);
        session.start();
        let registry = match session.registry() {
            Some(registry) => registry.clone(),
            None => bail!("client session has no call registry"),
        };
        Ok((session, SimpleClient::new(registry)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Serve { port, host, unix } => serve(&host, port, unix).await,
        Command::Sqrt {
            target,
            value,
            timeout_ms,
        } => {
            let (session, client) = target.client().await?;
            let root = client
                .sqrt(value, Duration::from_millis(timeout_ms))
                .await?;
            println!("RESULT={}", root);
            session.dispose();
            Ok(())
        }
        Command::Indefinite {
            target,
            cancel_after_ms,
        } => {
            let (session, client) = target.client().await?;
            let cancel = CancellationToken::new();
            let _guard = cancel.cancel_after(Duration::from_millis(cancel_after_ms));
            match client.indefinite(&cancel).await {
                Err(RpcError::Cancelled) => println!("RESULT=cancelled"),
                Err(e) => return Err(e.into()),
                Ok(()) => bail!("Indefinite returned without being cancelled"),
            }
            session.dispose();
            Ok(())
        }
    }
}

async fn serve(host: &str, port: u16, unix: Option<PathBuf>) -> Result<()> {
    info!("Starting tether RPC server");

    let (mut handle, endpoint) = match unix {
        #[cfg(unix)]
        Some(path) => server::start_unix(path)?,
        #[cfg(not(unix))]
        Some(_) => bail!("Unix sockets are not supported on this platform"),
        None => server::start_tcp(host, port).await?,
    };

    // Print the endpoint for the parent process to read (intentional stdout)
    match &endpoint {
        server::Endpoint::Tcp(addr) => println!("RPC_PORT={}", addr.port()),
        #[cfg(unix)]
        server::Endpoint::Unix(path) => println!("RPC_SOCKET={}", path.display()),
    }

    info!("RPC server running on {}", endpoint);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}
