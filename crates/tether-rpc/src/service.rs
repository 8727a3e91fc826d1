//! The sample `SimpleService`: message types, server handlers and a typed
//! client, written the way a generated stub would be.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    typed_handler, CallRegistry, CancellationToken, Empty, HandlerTable, Result, RpcError,
    TypedMessage,
};
use tracing::debug;

pub const SQRT: &str = "Sqrt";
pub const INDEFINITE: &str = "Indefinite";

/// JSON has no NaN, so non-finite values travel as `null`.
mod lossless_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqrtRequest {
    pub value: f64,
}

impl TypedMessage for SqrtRequest {
    const TYPE_ID: &'static str = "simple.SqrtRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqrtResponse {
    #[serde(with = "lossless_f64")]
    pub root: f64,
}

impl TypedMessage for SqrtResponse {
    const TYPE_ID: &'static str = "simple.SqrtResponse";
}

/// Square root, or NaN for negative input.
pub fn sqrt(value: f64) -> f64 {
    if value >= 0.0 {
        value.sqrt()
    } else {
        f64::NAN
    }
}

/// Handler table served by `tether-rpc serve`.
pub fn table() -> HandlerTable {
    HandlerTable::builder()
        .route(
            SQRT,
            typed_handler(|req: SqrtRequest, _cancel| async move {
                Ok(SqrtResponse {
                    root: sqrt(req.value),
                })
            }),
        )
        .route(
            INDEFINITE,
            typed_handler(|_: Empty, cancel: CancellationToken| async move {
                cancel.cancelled().await;
                debug!("Indefinite call cancelled by caller");
                Err::<Empty, _>(RpcError::Cancelled)
            }),
        )
        .build()
}

/// Typed client for `SimpleService`.
#[derive(Clone)]
pub struct SimpleClient {
    registry: Arc<CallRegistry>,
}

impl SimpleClient {
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self { registry }
    }

    pub async fn sqrt(&self, value: f64, timeout: Duration) -> Result<f64> {
        let reply: SqrtResponse = self
            .registry
            .call_with_timeout(
                SQRT,
                &SqrtRequest { value },
                &CancellationToken::new(),
                timeout,
            )
            .await?;
        Ok(reply.root)
    }

    /// Runs until `cancel` fires.
    pub async fn indefinite(&self, cancel: &CancellationToken) -> Result<()> {
        self.registry
            .call::<Empty, Empty>(INDEFINITE, &Empty {}, cancel)
            .await
            .map(|_| ())
    }
}
