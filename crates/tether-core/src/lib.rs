//! Tether Core - transport-agnostic RPC runtime.
//!
//! Two endpoints exchange typed request/response messages over any duplex
//! byte stream: TCP, Unix domain sockets, a pair of one-way pipes or an
//! in-memory loopback. Either side may call the other over the same
//! connection, calls can be cancelled across the wire, and a reconnecting
//! client keeps its outstanding calls alive when the transport breaks.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{
//!     typed_handler, CancellationToken, HandlerTable, Session, TypedMessage,
//! };
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Number { value: f64 }
//!
//! impl TypedMessage for Number {
//!     const TYPE_ID: &'static str = "example.Number";
//! }
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let table = HandlerTable::builder()
//!         .route("Sqrt", typed_handler(|n: Number, _cancel| async move {
//!             Ok(Number { value: n.value.sqrt() })
//!         }))
//!         .build();
//!
//!     let (a, b) = tether_core::loopback();
//!     let server = Session::server(b, table);
//!     let client = Session::client(a);
//!     server.start();
//!     client.start();
//!
//!     let registry = client.registry().expect("client sessions make calls");
//!     let root: Number = registry
//!         .call("Sqrt", &Number { value: 4.0 }, &CancellationToken::new())
//!         .await?;
//!     assert_eq!(root.value, 2.0);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod message;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError, DeadlineGuard};
pub use codec::{Empty, JsonCodec, PayloadCodec, TypedMessage};
pub use config::{ConnectionConfig, FrameConfig, ReconnectConfig};
pub use connection::{Connection, Disconnected, FrameHandler, OutboundQueue};
pub use dispatcher::{
    handler_fn, typed_handler, Dispatcher, Handler, HandlerTable, HandlerTableBuilder,
};
pub use error::{FaultCode, Result, RpcError};
pub use frame::{encode_frame, read_frame, write_frame, FrameError};
pub use message::{Direction, Frame, Outcome, Payload, Request, Response, Side};
pub use reconnect::{
    LinkState, ReconnectingClient, ReconnectingClientBuilder, ReconnectingServer,
    ReconnectingServerBuilder, SessionSetup,
};
pub use registry::CallRegistry;
pub use retry::{retry_async, RetryConfig};
pub use server::{Server, ServerHandle};
pub use session::{Session, SessionBuilder};
#[cfg(unix)]
pub use transport::{UnixAcceptor, UnixConnector};
pub use transport::{
    loopback, memory_transport, Acceptor, BoxedReader, BoxedStream, BoxedWriter, Connector,
    DuplexStream, MemoryAcceptor, MemoryConnector, TcpAcceptor, TcpConnector,
};
