//! Inbound telemetry events.

use crate::metric::Scope;

/// One decoded observation handed to the dispatcher by a receiver.
///
/// Receivers (protocol frontends) are expected to have already decoded
/// their wire format; the dispatcher only validates the identity
/// fields it needs to derive metric samples.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    /// Finest scope this event carries information for.
    pub scope: Scope,
    /// Service name, required and non-empty.
    pub service: String,
    /// Whether the service is directly instrumented (`true`) or only
    /// conjectured from a peer's traffic.
    pub normal: bool,
    /// Endpoint within the service, when known.
    pub endpoint: Option<String>,
    /// Observation time, unix epoch milliseconds.
    pub timestamp_ms: u64,
    /// End-to-end latency of the observed call.
    pub latency_ms: i64,
    /// Protocol status code.
    pub status: u16,
    /// Whether the call counts against the service's SLA.
    pub success: bool,
}
