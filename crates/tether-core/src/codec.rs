//! Payload codec boundary.
//!
//! The runtime never looks inside a payload. Stubs turn typed messages into
//! `(type id, bytes)` with a [`PayloadCodec`] and back again; [`JsonCodec`]
//! is the default.

use crate::error::{Result, RpcError};
use crate::message::Payload;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A message type that can travel as a payload.
pub trait TypedMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier written next to the serialized body.
    const TYPE_ID: &'static str;
}

/// Serialization format for payload bodies.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON payload bodies via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Payload {
    /// Pack a typed message with the default JSON codec.
    pub fn pack<T: TypedMessage>(message: &T) -> Result<Self> {
        Self::pack_with(&JsonCodec, message)
    }

    pub fn pack_with<C: PayloadCodec, T: TypedMessage>(codec: &C, message: &T) -> Result<Self> {
        Ok(Payload::new(T::TYPE_ID, codec.encode(message)?))
    }

    /// Unpack a typed message with the default JSON codec.
    pub fn unpack<T: TypedMessage>(&self) -> Result<T> {
        self.unpack_with(&JsonCodec)
    }

    pub fn unpack_with<C: PayloadCodec, T: TypedMessage>(&self, codec: &C) -> Result<T> {
        if self.type_id != T::TYPE_ID {
            return Err(RpcError::PayloadType {
                expected: T::TYPE_ID.to_string(),
                actual: self.type_id.clone(),
            });
        }
        codec.decode(&self.body)
    }
}

/// The empty message, for functions without arguments or results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Empty {}

impl TypedMessage for Empty {
    const TYPE_ID: &'static str = "tether.Empty";
}
