//! Serializable payloads for the SSE stream between the gateway and open
//! tabs. Every request ends with exactly one terminal event (`complete`,
//! `cancelled`, or `error`) after zero or more `progress` events.

use serde::{Deserialize, Serialize};

/// Payload of a `progress` event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressPayload {
    pub message: String,
    pub progress: u8,
}

/// Payload of the `cancelled` terminal event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CancelledPayload {
    pub message: String,
}

/// Payload of the `error` terminal event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
}
