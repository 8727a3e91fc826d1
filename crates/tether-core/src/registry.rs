//! Client-side call correlation.
//!
//! A [`CallRegistry`] issues tokens, parks each caller until the response
//! with its token arrives, and turns local cancellation into a cancel
//! notification for the peer. The registry outlives connections: it can be
//! unbound from a dead connection and bound to a new one, replaying every
//! call still waiting.

use crate::cancel::CancellationToken;
use crate::codec::TypedMessage;
use crate::connection::OutboundQueue;
use crate::error::{Result, RpcError};
use crate::frame;
use crate::message::{Frame, Payload, Request, Response, Side};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

const TOKEN_MASK: u64 = !(1 << 63);

struct PendingCall {
    request: Request,
    slot: oneshot::Sender<Response>,
}

struct State {
    next_token: u64,
    pending: BTreeMap<u64, PendingCall>,
    outbound: Option<OutboundQueue>,
    disposed: bool,
}

struct WithdrawOnDrop<'a> {
    registry: &'a CallRegistry,
    token: u64,
    armed: bool,
}

impl Drop for WithdrawOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.withdraw(self.token);
        }
    }
}

/// Issues calls and matches responses to them.
pub struct CallRegistry {
    side: Side,
    state: Mutex<State>,
}

impl CallRegistry {
    /// Create an unbound registry using `side`'s token space.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            state: Mutex::new(State {
                next_token: 1,
                pending: BTreeMap::new(),
                outbound: None,
                disposed: false,
            }),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Call a remote function and wait for its response.
    ///
    /// If `cancel` fires first, the call is abandoned, the peer is told to
    /// stop working on it and the caller gets `RpcError::Cancelled`. A failed
    /// response is returned as a response; see [`call`](Self::call) for the
    /// typed variant that turns it into an error.
    pub async fn perform_call(
        &self,
        function_name: &str,
        payload: Payload,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if function_name.is_empty() {
            return Err(RpcError::invalid_argument(
                "function_name",
                "must not be empty",
            ));
        }
        // The token does not change the encoded size; it is filled in below
        let mut request = Request::call(0, function_name, payload, self.side.caller_direction());
        if let Err(e) = frame::check_request(&request) {
            return Err(RpcError::invalid_argument("request", e.to_string()));
        }
        cancel.check()?;

        let (slot, mut rx) = oneshot::channel();
        let token = {
            let mut state = self.state();
            if state.disposed {
                return Err(RpcError::Disposed);
            }
            let token = self.allocate_token(&mut state);
            request.token = token;
            if let Some(outbound) = &state.outbound {
                outbound.push_back(request.clone());
            }
            state.pending.insert(token, PendingCall { request, slot });
            token
        };

        // Dropping this future before an outcome counts as cancellation
        let mut guard = WithdrawOnDrop {
            registry: self,
            token,
            armed: true,
        };

        tokio::select! {
            biased;
            response = &mut rx => {
                guard.armed = false;
                return response.map_err(|_| RpcError::Cancelled);
            }
            _ = cancel.cancelled() => {}
        }

        guard.armed = false;
        if self.withdraw(token) {
            return Err(RpcError::Cancelled);
        }
        // The response won the race and is already in the slot
        rx.await.map_err(|_| RpcError::Cancelled)
    }

    /// Like [`perform_call`](Self::perform_call) with a deadline.
    ///
    /// An expired deadline fails with `RpcError::Timeout`; the peer is
    /// notified exactly as for cancellation.
    pub async fn perform_call_with_timeout(
        &self,
        function_name: &str,
        payload: Payload,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Response> {
        let deadline = cancel.child_token();
        let guard = deadline.cancel_after(timeout);
        match self.perform_call(function_name, payload, &deadline).await {
            Err(RpcError::Cancelled) if guard.fired() && !cancel.is_cancelled() => {
                Err(RpcError::Timeout(timeout))
            }
            other => other,
        }
    }

    /// Typed call used by service stubs.
    pub async fn call<Req: TypedMessage, Resp: TypedMessage>(
        &self,
        function_name: &str,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp> {
        let payload = Payload::pack(request)?;
        let response = self.perform_call(function_name, payload, cancel).await?;
        response.into_result()?.unpack()
    }

    /// Typed call with a deadline.
    pub async fn call_with_timeout<Req: TypedMessage, Resp: TypedMessage>(
        &self,
        function_name: &str,
        request: &Req,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Resp> {
        let payload = Payload::pack(request)?;
        let response = self
            .perform_call_with_timeout(function_name, payload, cancel, timeout)
            .await?;
        response.into_result()?.unpack()
    }

    fn allocate_token(&self, state: &mut State) -> u64 {
        loop {
            let token = self.side.token_base() | (state.next_token & TOKEN_MASK);
            state.next_token = state.next_token.wrapping_add(1) & TOKEN_MASK;
            // 0 is reserved for control requests
            if token & TOKEN_MASK != 0 && !state.pending.contains_key(&token) {
                return token;
            }
        }
    }

    /// Forget a pending call and tell the peer to stop working on it.
    ///
    /// Returns `false` if the call had already been resolved.
    fn withdraw(&self, token: u64) -> bool {
        let mut state = self.state();
        if state.pending.remove(&token).is_none() {
            return false;
        }
        debug!("Call {} cancelled by caller", token);
        if let Some(outbound) = &state.outbound {
            outbound.push_back(Request::cancel(vec![token], self.side.caller_direction()));
        }
        true
    }

    /// Resolve the pending call with the response's token.
    ///
    /// Responses for unknown or already resolved tokens are dropped.
    pub fn on_response(&self, response: Response) {
        let pending = self.state().pending.remove(&response.token);
        match pending {
            Some(call) => {
                if call.slot.send(response).is_err() {
                    debug!("Caller for call {} went away", call.request.token);
                }
            }
            None => debug!("Dropping response for unknown call {}", response.token),
        }
    }

    /// Requests still waiting for a response, in token order.
    pub fn pending_requests(&self) -> Vec<Request> {
        self.state()
            .pending
            .values()
            .map(|call| call.request.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Attach to a connection's outbound queue and replay every pending request.
    pub fn bind(&self, outbound: OutboundQueue) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        let replay: Vec<Frame> = state
            .pending
            .values()
            .map(|call| Frame::Request(call.request.clone()))
            .collect();
        if !replay.is_empty() {
            debug!("Replaying {} pending calls", replay.len());
            outbound.extend(replay);
        }
        state.outbound = Some(outbound);
    }

    /// Detach from the current connection. Pending calls keep waiting.
    pub fn unbind(&self) -> Option<OutboundQueue> {
        self.state().outbound.take()
    }

    /// Detach only if still bound to `outbound`.
    ///
    /// Lets a stale connection let go without touching a newer binding.
    pub fn unbind_from(&self, outbound: &OutboundQueue) -> bool {
        let mut state = self.state();
        if state
            .outbound
            .as_ref()
            .is_some_and(|current| current.same_queue(outbound))
        {
            state.outbound = None;
            return true;
        }
        false
    }

    pub fn is_bound(&self) -> bool {
        self.state().outbound.is_some()
    }

    /// Fail every pending call with `Cancelled` and refuse new ones.
    ///
    /// The peer is not notified. Calling this again does nothing.
    pub fn dispose(&self) {
        let pending = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.outbound = None;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!("Registry disposed with {} pending calls", pending.len());
        }
        // Dropping the slots wakes every caller
        drop(pending);
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("CallRegistry")
            .field("side", &self.side)
            .field("pending", &state.pending.len())
            .field("bound", &state.outbound.is_some())
            .field("disposed", &state.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameConfig;
    use crate::message::Direction;
    use std::sync::Arc;

    async fn next_request(queue: &OutboundQueue) -> Request {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(Frame::Request(request)) = queue.pop_front() {
                    return request;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("request should be enqueued")
    }

    fn bound_registry(side: Side) -> (Arc<CallRegistry>, OutboundQueue) {
        let registry = Arc::new(CallRegistry::new(side));
        let queue = OutboundQueue::new();
        registry.bind(queue.clone());
        (registry, queue)
    }

    #[tokio::test]
    async fn test_response_resolves_matching_call() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let reg = registry.clone();
        let call = tokio::spawn(async move {
            reg.perform_call("Echo", Payload::new("t", b"x".to_vec()), &CancellationToken::new())
                .await
        });

        let request = next_request(&queue).await;
        assert_eq!(request.function_name, "Echo");
        assert_eq!(request.direction, Direction::Forward);
        registry.on_response(Response::success(
            request.token,
            Direction::Forward,
            Payload::new("t", b"y".to_vec()),
        ));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.token, request.token);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let mut calls = Vec::new();
        for i in 0..16u8 {
            let reg = registry.clone();
            calls.push(tokio::spawn(async move {
                let response = reg
                    .perform_call("Echo", Payload::new("t", vec![i]), &CancellationToken::new())
                    .await
                    .unwrap();
                (i, response)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..16 {
            requests.push(next_request(&queue).await);
        }
        for request in requests.into_iter().rev() {
            registry.on_response(Response::success(
                request.token,
                request.direction,
                request.payload.clone(),
            ));
        }

        for call in calls {
            let (i, response) = call.await.unwrap();
            match response.outcome {
                crate::message::Outcome::Success(payload) => assert_eq!(&payload.body[..], &[i]),
                other => panic!("Expected success, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_sends_exactly_one_notification() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let cancel = CancellationToken::new();
        let reg = registry.clone();
        let caller_cancel = cancel.clone();
        let call = tokio::spawn(async move {
            reg.perform_call("Slow", Payload::empty(), &caller_cancel).await
        });

        let request = next_request(&queue).await;
        cancel.cancel();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));

        let notification = next_request(&queue).await;
        assert!(notification.is_control());
        assert_eq!(notification.cancel_tokens, vec![request.token]);
        assert!(queue.is_empty());

        // A late response is dropped quietly
        registry.on_response(Response::success(
            request.token,
            Direction::Forward,
            Payload::empty(),
        ));
        assert_eq!(registry.pending_count(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_call_future_withdraws_call() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            registry.perform_call("Slow", Payload::empty(), &CancellationToken::new()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(registry.pending_count(), 0);

        let request = next_request(&queue).await;
        let notification = next_request(&queue).await;
        assert_eq!(notification.cancel_tokens, vec![request.token]);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_fails_before_io() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = registry.perform_call("Echo", Payload::empty(), &cancel).await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_reports_timeout() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let result = registry
            .perform_call_with_timeout(
                "Slow",
                Payload::empty(),
                &CancellationToken::new(),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));

        let request = queue.pop_front();
        let notification = queue.pop_front();
        assert!(matches!(request, Some(Frame::Request(ref r)) if !r.is_control()));
        assert!(matches!(notification, Some(Frame::Request(ref r)) if r.is_control()));
    }

    #[tokio::test]
    async fn test_empty_function_name_is_rejected() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let result = registry
            .perform_call("", Payload::empty(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RpcError::InvalidArgument { .. })));
        assert!(queue.is_empty());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unencodable_request_is_rejected_before_io() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let cancel = CancellationToken::new();

        let long_type = Payload::new("t".repeat(70_000), b"{}".to_vec());
        let result = registry.perform_call("Echo", long_type, &cancel).await;
        assert!(matches!(result, Err(RpcError::InvalidArgument { .. })));

        let long_name = "x".repeat(u16::MAX as usize + 1);
        let result = registry.perform_call(&long_name, Payload::empty(), &cancel).await;
        assert!(matches!(result, Err(RpcError::InvalidArgument { .. })));

        let huge = Payload::new("t", vec![0u8; FrameConfig::MAX_FRAME_SIZE]);
        let result = registry.perform_call("Echo", huge, &cancel).await;
        assert!(matches!(result, Err(RpcError::InvalidArgument { .. })));

        assert!(queue.is_empty());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unbound_calls_are_replayed_on_bind() {
        let registry = Arc::new(CallRegistry::new(Side::Initiator));
        let reg = registry.clone();
        let call = tokio::spawn(async move {
            reg.perform_call("Echo", Payload::empty(), &CancellationToken::new())
                .await
        });

        while registry.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.pending_requests().len(), 1);

        let queue = OutboundQueue::new();
        registry.bind(queue.clone());
        let request = next_request(&queue).await;
        registry.on_response(Response::success(
            request.token,
            Direction::Forward,
            Payload::empty(),
        ));
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_acceptor_tokens_carry_top_bit() {
        let (registry, queue) = bound_registry(Side::Acceptor);
        let reg = registry.clone();
        tokio::spawn(async move {
            let _ = reg
                .perform_call("Echo", Payload::empty(), &CancellationToken::new())
                .await;
        });
        let request = next_request(&queue).await;
        assert_ne!(request.token & (1 << 63), 0);
        assert_eq!(request.direction, Direction::Reverse);
        registry.dispose();
    }

    #[tokio::test]
    async fn test_dispose_cancels_pending_and_is_idempotent() {
        let (registry, queue) = bound_registry(Side::Initiator);
        let mut calls = Vec::new();
        for _ in 0..3 {
            let reg = registry.clone();
            calls.push(tokio::spawn(async move {
                reg.perform_call("Slow", Payload::empty(), &CancellationToken::new())
                    .await
            }));
        }
        while registry.pending_count() < 3 {
            tokio::task::yield_now().await;
        }
        queue.drain();

        registry.dispose();
        registry.dispose();

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));
        }
        assert!(queue.is_empty(), "dispose must not notify the peer");
        assert!(registry.is_disposed());

        let later = registry
            .perform_call("Echo", Payload::empty(), &CancellationToken::new())
            .await;
        assert!(matches!(later, Err(RpcError::Disposed)));
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let (registry, _queue) = bound_registry(Side::Initiator);
        registry.on_response(Response::success(77, Direction::Forward, Payload::empty()));
        assert_eq!(registry.pending_count(), 0);
    }
}
