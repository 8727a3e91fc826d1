//! Client, server and bidirectional sessions over one connection.
//!
//! A session wires a [`CallRegistry`] (calls we make) and a [`Dispatcher`]
//! (calls we serve) to one [`Connection`]. Inbound frames are routed by
//! kind and direction tag: requests started by the peer go to the
//! dispatcher, responses to our own calls go to the registry.

use crate::connection::{Connection, Disconnected, FrameHandler, OutboundQueue};
use crate::dispatcher::{Dispatcher, HandlerTable};
use crate::error::RpcError;
use crate::message::{Frame, Response, Side};
use crate::registry::CallRegistry;
use crate::transport::{BoxedReader, BoxedWriter, DuplexStream};
use std::sync::Arc;
use tracing::{debug, warn};

struct Router {
    side: Side,
    registry: Option<Arc<CallRegistry>>,
    dispatcher: Option<Arc<Dispatcher>>,
    outbound: OutboundQueue,
}

impl FrameHandler for Router {
    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Request(request) if request.direction == self.side.callee_direction() => {
                match &self.dispatcher {
                    Some(dispatcher) => dispatcher.on_request(request),
                    None if !request.is_control() => {
                        debug!(
                            "No handlers for '{}' (call {})",
                            request.function_name, request.token
                        );
                        self.outbound.push_back(Response::from_error(
                            request.token,
                            request.direction,
                            &RpcError::UnknownFunction(request.function_name),
                        ));
                    }
                    None => {}
                }
            }
            Frame::Response(response) if response.direction == self.side.caller_direction() => {
                match &self.registry {
                    Some(registry) => registry.on_response(response),
                    None => debug!("Dropping response for call {}: no registry", response.token),
                }
            }
            other => warn!(
                "Dropping frame with unexpected direction {:?} (token {})",
                other.direction(),
                other.token()
            ),
        }
    }
}

/// One connection plus the call machinery running over it.
pub struct Session {
    side: Side,
    connection: Connection,
    registry: Option<Arc<CallRegistry>>,
    owns_registry: bool,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Session {
    /// A session that only makes calls, from the connecting side.
    pub fn client<S: DuplexStream>(stream: S) -> Self {
        Self::builder(Side::Initiator).with_calls().build(stream)
    }

    /// A session that only serves calls, from the accepting side.
    pub fn server<S: DuplexStream>(stream: S, table: HandlerTable) -> Self {
        Self::builder(Side::Acceptor).handlers(table).build(stream)
    }

    /// A session that both makes and serves calls.
    pub fn bidirectional<S: DuplexStream>(stream: S, side: Side, table: HandlerTable) -> Self {
        Self::builder(side).with_calls().handlers(table).build(stream)
    }

    pub fn builder(side: Side) -> SessionBuilder {
        SessionBuilder::new(side)
    }

    /// Start reading and writing. Later calls do nothing.
    pub fn start(&self) {
        self.connection.start();
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    pub fn registry(&self) -> Option<&Arc<CallRegistry>> {
        self.registry.as_ref()
    }

    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Wait for the connection's Disconnected event.
    ///
    /// Returns `None` if the session is disposed first.
    pub async fn disconnected(&self) -> Option<Disconnected> {
        self.connection.disconnected().await
    }

    /// Close the connection and drop all call state. Safe to call twice.
    ///
    /// A registry handed in through [`SessionBuilder::registry`] is only
    /// unbound so it can move to another connection.
    pub fn dispose(&self) {
        if let Some(registry) = &self.registry {
            if self.owns_registry {
                registry.dispose();
            } else {
                registry.unbind_from(&self.connection.outbound());
            }
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispose();
        }
        self.connection.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.connection.is_disposed()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("side", &self.side)
            .field("connection", &self.connection)
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Assembles a [`Session`].
///
/// Everything is bound to the new outbound queue before the connection can
/// start, so replayed calls and carried frames are the first things written.
pub struct SessionBuilder {
    side: Side,
    registry: Option<Arc<CallRegistry>>,
    owns_registry: bool,
    table: Option<HandlerTable>,
    carried: Vec<Frame>,
}

impl SessionBuilder {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            registry: None,
            owns_registry: false,
            table: None,
            carried: Vec::new(),
        }
    }

    /// Make calls through a fresh registry owned by the session.
    pub fn with_calls(mut self) -> Self {
        self.registry = Some(Arc::new(CallRegistry::new(self.side)));
        self.owns_registry = true;
        self
    }

    /// Make calls through an existing registry; its pending calls are replayed.
    pub fn registry(mut self, registry: Arc<CallRegistry>) -> Self {
        self.registry = Some(registry);
        self.owns_registry = false;
        self
    }

    /// Serve calls from the peer with `table`.
    pub fn handlers(mut self, table: HandlerTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Frames to write before anything else.
    pub fn carry(mut self, frames: impl IntoIterator<Item = Frame>) -> Self {
        self.carried.extend(frames);
        self
    }

    pub fn build<S: DuplexStream>(self, stream: S) -> Session {
        let (reader, writer) = tokio::io::split(stream);
        self.build_from_parts(Box::new(reader), Box::new(writer))
    }

    /// Build over separate input and output streams.
    pub fn build_from_parts(self, reader: BoxedReader, writer: BoxedWriter) -> Session {
        let outbound = OutboundQueue::new();
        if !self.carried.is_empty() {
            outbound.extend(self.carried);
        }

        let dispatcher = self
            .table
            .map(|table| Arc::new(Dispatcher::new(table, self.side)));
        if let Some(dispatcher) = &dispatcher {
            dispatcher.bind(outbound.clone());
        }
        if let Some(registry) = &self.registry {
            registry.bind(outbound.clone());
        }

        let router = Router {
            side: self.side,
            registry: self.registry.clone(),
            dispatcher: dispatcher.clone(),
            outbound: outbound.clone(),
        };
        let connection = Connection::with_outbound(reader, writer, outbound, Arc::new(router));

        Session {
            side: self.side,
            connection,
            registry: self.registry,
            owns_registry: self.owns_registry,
            dispatcher,
        }
    }
}
