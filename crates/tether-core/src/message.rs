//! Request, response and frame types exchanged between two endpoints.
//!
//! The runtime routes and correlates on these envelopes only. The payload
//! body stays opaque: a type id plus whatever bytes the payload codec
//! produced.

use crate::error::{FaultCode, Result, RpcError};
use bytes::Bytes;

/// Typed-opaque message body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    /// Identifier of the serialized type, checked on unpack.
    pub type_id: String,
    /// Serialized body, never inspected by the runtime.
    pub body: Bytes,
}

impl Payload {
    pub fn new(type_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            type_id: type_id.into(),
            body: body.into(),
        }
    }

    /// The payload of control requests, which carry no message.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.type_id.is_empty() && self.body.is_empty()
    }
}

/// Which side started the exchange a frame belongs to.
///
/// Requests from the initiating side and the responses to them are
/// `Forward`; calls made by the accepting side over the same connection are
/// `Reverse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn is_reverse(&self) -> bool {
        matches!(self, Direction::Reverse)
    }

    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

/// Role of an endpoint on its physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The endpoint that connected (classic client).
    Initiator,
    /// The endpoint that accepted (classic server).
    Acceptor,
}

impl Side {
    /// Direction tag this side puts on the calls it makes.
    pub fn caller_direction(&self) -> Direction {
        match self {
            Side::Initiator => Direction::Forward,
            Side::Acceptor => Direction::Reverse,
        }
    }

    /// Direction tag carried by calls arriving from the peer.
    pub fn callee_direction(&self) -> Direction {
        self.peer().caller_direction()
    }

    pub fn peer(&self) -> Side {
        match self {
            Side::Initiator => Side::Acceptor,
            Side::Acceptor => Side::Initiator,
        }
    }

    /// First token of this side's token space.
    ///
    /// Acceptor tokens carry the top bit so the two sides can never issue
    /// the same token over one connection.
    pub fn token_base(&self) -> u64 {
        match self {
            Side::Initiator => 0,
            Side::Acceptor => 1 << 63,
        }
    }
}

/// A call, or a control message carrying cancellations only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Target function; empty for control messages.
    pub function_name: String,
    pub payload: Payload,
    pub token: u64,
    /// Tokens of earlier calls the sender no longer waits for.
    pub cancel_tokens: Vec<u64>,
    pub direction: Direction,
}

impl Request {
    /// Build a call request.
    pub fn call(
        token: u64,
        function_name: impl Into<String>,
        payload: Payload,
        direction: Direction,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            payload,
            token,
            cancel_tokens: Vec::new(),
            direction,
        }
    }

    /// Build a control request that cancels the given tokens.
    pub fn cancel(tokens: Vec<u64>, direction: Direction) -> Self {
        Self {
            function_name: String::new(),
            payload: Payload::empty(),
            token: 0,
            cancel_tokens: tokens,
            direction,
        }
    }

    /// Control messages carry no call of their own.
    pub fn is_control(&self) -> bool {
        self.function_name.is_empty()
    }
}

/// Outcome of a call as carried by its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Payload),
    Failure { code: FaultCode, message: String },
}

/// The answer to one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub token: u64,
    pub direction: Direction,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(token: u64, direction: Direction, payload: Payload) -> Self {
        Self {
            token,
            direction,
            outcome: Outcome::Success(payload),
        }
    }

    pub fn failure(
        token: u64,
        direction: Direction,
        code: FaultCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            token,
            direction,
            outcome: Outcome::Failure {
                code,
                message: message.into(),
            },
        }
    }

    /// Build the failed response matching a local error.
    pub fn from_error(token: u64, direction: Direction, err: &RpcError) -> Self {
        Self::failure(token, direction, err.fault_code(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// Turn a failed outcome into `RpcError::Remote`.
    pub fn into_result(self) -> Result<Payload> {
        match self.outcome {
            Outcome::Success(payload) => Ok(payload),
            Outcome::Failure { code, message } => Err(RpcError::Remote { code, message }),
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    pub fn token(&self) -> u64 {
        match self {
            Frame::Request(r) => r.token,
            Frame::Response(r) => r.token,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Frame::Request(r) => r.direction,
            Frame::Response(r) => r.direction,
        }
    }
}

impl From<Request> for Frame {
    fn from(request: Request) -> Self {
        Frame::Request(request)
    }
}

impl From<Response> for Frame {
    fn from(response: Response) -> Self {
        Frame::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_directions() {
        assert_eq!(Side::Initiator.caller_direction(), Direction::Forward);
        assert_eq!(Side::Initiator.callee_direction(), Direction::Reverse);
        assert_eq!(Side::Acceptor.caller_direction(), Direction::Reverse);
        assert_eq!(Side::Acceptor.callee_direction(), Direction::Forward);
    }

    #[test]
    fn test_token_spaces_are_disjoint() {
        assert_eq!(Side::Initiator.token_base() & (1 << 63), 0);
        assert_ne!(Side::Acceptor.token_base() & (1 << 63), 0);
    }

    #[test]
    fn test_control_request() {
        let request = Request::cancel(vec![3, 4], Direction::Forward);
        assert!(request.is_control());
        assert!(request.payload.is_empty());
        assert_eq!(request.cancel_tokens, vec![3, 4]);
    }

    #[test]
    fn test_failed_response_into_remote_error() {
        let response = Response::from_error(
            9,
            Direction::Forward,
            &RpcError::UnknownFunction("Nope".into()),
        );
        assert!(!response.is_success());
        match response.into_result() {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, FaultCode::UnknownFunction);
                assert!(message.contains("Nope"));
            }
            other => panic!("Expected Remote error, got: {:?}", other),
        }
    }
}
