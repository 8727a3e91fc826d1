//! Shared helpers for integration tests.
//!
//! A hand-written `SimpleService` stub in the shape a generated one takes:
//! typed messages, a server handler table and a thin client wrapper over a
//! [`CallRegistry`].

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    typed_handler, CallRegistry, CancellationToken, Empty, HandlerTable, Result, RpcError,
    TypedMessage,
};

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

/// Counters the handlers update so tests can observe the server side.
#[derive(Debug, Default)]
pub struct Observed {
    pub sqrt_calls: AtomicUsize,
    pub indefinite_started: AtomicUsize,
    pub indefinite_cancelled: AtomicUsize,
}

impl Observed {
    pub fn sqrt_calls(&self) -> usize {
        self.sqrt_calls.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.indefinite_started.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.indefinite_cancelled.load(Ordering::SeqCst)
    }
}

/// Handler table for `SimpleService`.
pub fn simple_service(observed: Arc<Observed>) -> HandlerTable {
    let on_sqrt = observed.clone();
    HandlerTable::builder()
        .route(
            "Sqrt",
            typed_handler(move |req: SqrtRequest, _cancel| {
                let observed = on_sqrt.clone();
                async move {
                    observed.sqrt_calls.fetch_add(1, Ordering::SeqCst);
                    let root = if req.value >= 0.0 {
                        req.value.sqrt()
                    } else {
                        f64::NAN
                    };
                    Ok(SqrtResponse { root })
                }
            }),
        )
        .route(
            "Indefinite",
            typed_handler(move |_: Empty, cancel: CancellationToken| {
                let observed = observed.clone();
                async move {
                    observed.indefinite_started.fetch_add(1, Ordering::SeqCst);
                    cancel.cancelled().await;
                    observed.indefinite_cancelled.fetch_add(1, Ordering::SeqCst);
                    Err::<Empty, _>(RpcError::Cancelled)
                }
            }),
        )
        .build()
}

/// Client wrapper over a registry.
pub struct SimpleClient<'a> {
    registry: &'a CallRegistry,
}

impl<'a> SimpleClient<'a> {
    pub fn new(registry: &'a CallRegistry) -> Self {
        Self { registry }
    }

    pub async fn sqrt(&self, value: f64) -> Result<f64> {
        let reply: SqrtResponse = self
            .registry
            .call("Sqrt", &SqrtRequest { value }, &CancellationToken::new())
            .await?;
        Ok(reply.root)
    }

    pub async fn indefinite(&self, cancel: &CancellationToken) -> Result<()> {
        self.registry
            .call::<Empty, Empty>("Indefinite", &Empty {}, cancel)
            .await
            .map(|_| ())
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
