//! Inbound adapter endpoint: accepts raw event JSON and publishes it onto
//! the in-process durable log, keyed by the best recipient identifier the
//! payload carries. The pipeline workers consume from the log, so ordering
//! per recipient is preserved from this point on.

use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::SharedState;

#[derive(Debug, Serialize)]
pub struct IngestAck {
    pub partition: u32,
    pub offset: u64,
}

/// Routing key: universal ID when the adapter already resolved one,
/// otherwise the strongest identifier present. Stable per recipient.
fn routing_key(payload: &serde_json::Value) -> Option<String> {
    let top = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let meta = |key: &str| {
        payload
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    top("universal_id")
        .or_else(|| top("recipient_email"))
        .or_else(|| top("phone"))
        .or_else(|| meta("klaviyo_id"))
        .or_else(|| meta("shopify_customer_id"))
        .or_else(|| meta("esp_user_id"))
}

pub async fn post_ingest(
    State(state): State<SharedState>,
    Json(payload): Json<serde_json::Value>,
) -> Json<IngestAck> {
    let key = routing_key(&payload);
    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
    let (partition, offset) = state.event_log.publish(key.as_deref(), &bytes);
    tracing::debug!(partition, offset, "event published to ingest log");
    Json(IngestAck { partition, offset })
}
