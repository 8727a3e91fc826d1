//! Server-side request dispatch.
//!
//! A [`HandlerTable`] maps function names to handlers and is built once. A
//! [`Dispatcher`] runs each incoming request on its own task, remembers the
//! cancellation token of every call in flight so the peer can cancel it, and
//! queues the response when the handler finishes.

use crate::cancel::CancellationToken;
use crate::codec::TypedMessage;
use crate::connection::OutboundQueue;
use crate::error::{FaultCode, Result, RpcError};
use crate::frame;
use crate::message::{Payload, Request, Response, Side};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Implementation of one remote function.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Run the call. `cancel` fires when the caller gives up.
    async fn call(&self, payload: Payload, cancel: CancellationToken) -> Result<Payload>;
}

/// Handler built from an async closure over raw payloads.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking and returning raw payloads.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Payload, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    async fn call(&self, payload: Payload, cancel: CancellationToken) -> Result<Payload> {
        (self.f)(payload, cancel).await
    }
}

/// Handler built from an async closure over typed messages.
pub struct TypedHandler<Req, Resp, F> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

/// Wrap an async closure taking and returning typed messages.
///
/// The request payload is unpacked (type id checked) before the closure
/// runs and the result is packed with the default codec.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> TypedHandler<Req, Resp, F>
where
    Req: TypedMessage,
    Resp: TypedMessage,
    F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler for TypedHandler<Req, Resp, F>
where
    Req: TypedMessage,
    Resp: TypedMessage,
    F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    async fn call(&self, payload: Payload, cancel: CancellationToken) -> Result<Payload> {
        let request: Req = payload.unpack()?;
        let response = (self.f)(request, cancel).await?;
        Payload::pack(&response)
    }
}

/// Static map from function name to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    routes: Arc<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// A table without functions; every call is answered with UnknownFunction.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, function_name: &str) -> Option<Arc<dyn Handler>> {
        self.routes.get(function_name).cloned()
    }

    pub fn contains(&self, function_name: &str) -> bool {
        self.routes.contains_key(function_name)
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("functions", &self.names())
            .finish()
    }
}

/// Builder for [`HandlerTable`].
#[derive(Default)]
pub struct HandlerTableBuilder {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTableBuilder {
    /// Register `handler` under `function_name`, replacing any earlier one.
    pub fn route(mut self, function_name: impl Into<String>, handler: impl Handler) -> Self {
        self.routes.insert(function_name.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            routes: Arc::new(self.routes),
        }
    }
}

struct State {
    in_flight: HashMap<u64, CancellationToken>,
    outbound: Option<OutboundQueue>,
    disposed: bool,
}

/// Runs incoming requests against a [`HandlerTable`].
pub struct Dispatcher {
    table: HandlerTable,
    side: Side,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(table: HandlerTable, side: Side) -> Self {
        Self {
            table,
            side,
            state: Mutex::new(State {
                in_flight: HashMap::new(),
                outbound: None,
                disposed: false,
            }),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send responses to this queue from now on.
    pub fn bind(&self, outbound: OutboundQueue) {
        let mut state = self.state();
        if !state.disposed {
            state.outbound = Some(outbound);
        }
    }

    pub fn unbind(&self) -> Option<OutboundQueue> {
        self.state().outbound.take()
    }

    /// Handle one request from the peer.
    ///
    /// Cancellations it carries are applied first; then the named function
    /// (if any) is started on its own task.
    pub fn on_request(self: &Arc<Self>, request: Request) {
        let Request {
            function_name,
            payload,
            token,
            cancel_tokens,
            direction,
        } = request;

        let (handler, call_token) = {
            let mut state = self.state();
            for cancelled in &cancel_tokens {
                if let Some(call) = state.in_flight.get(cancelled) {
                    debug!("Peer cancelled call {}", cancelled);
                    call.cancel();
                }
            }

            if function_name.is_empty() || state.disposed {
                return;
            }

            if state.in_flight.contains_key(&token) {
                warn!("Ignoring duplicate request for call {}", token);
                return;
            }

            let Some(handler) = self.table.get(&function_name) else {
                debug!("Unknown function '{}' (call {})", function_name, token);
                if let Some(outbound) = &state.outbound {
                    outbound.push_back(Response::from_error(
                        token,
                        direction,
                        &RpcError::UnknownFunction(function_name),
                    ));
                }
                return;
            };

            let call_token = CancellationToken::new();
            state.in_flight.insert(token, call_token.clone());
            (handler, call_token)
        };

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.call(payload, call_token.clone()))
                .catch_unwind()
                .await;

            let response = match outcome {
                Ok(Ok(payload)) => Response::success(token, direction, payload),
                Ok(Err(err)) => {
                    debug!("Call {} to '{}' failed: {}", token, function_name, err);
                    Response::from_error(token, direction, &err)
                }
                Err(_) => {
                    error!("Handler for '{}' panicked (call {})", function_name, token);
                    Response::failure(
                        token,
                        direction,
                        FaultCode::Internal,
                        format!("Handler for '{}' panicked", function_name),
                    )
                }
            };

            dispatcher.complete(token, &call_token, response);
        });
    }

    fn complete(&self, token: u64, call_token: &CancellationToken, response: Response) {
        let mut state = self.state();
        state.in_flight.remove(&token);
        if call_token.is_cancelled() {
            debug!("Call {} was cancelled; dropping its response", token);
            return;
        }
        let response = match frame::check_response(&response) {
            Ok(()) => response,
            Err(e) => {
                warn!("Response to call {} cannot be sent: {}", token, e);
                Response::failure(
                    token,
                    response.direction,
                    FaultCode::Codec,
                    format!("Response cannot be encoded: {}", e),
                )
            }
        };
        if let Some(outbound) = &state.outbound {
            outbound.push_back(response);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Cancel every call in flight and stop sending responses.
    pub fn dispose(&self) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.outbound = None;
        if !state.in_flight.is_empty() {
            debug!("Dispatcher disposed with {} calls in flight", state.in_flight.len());
        }
        for (_, call) in state.in_flight.drain() {
            call.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("side", &self.side)
            .field("table", &self.table)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
