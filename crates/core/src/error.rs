//! Error taxonomy for control-service calls.

use reqwest::StatusCode;

/// Why a control or login call failed.
///
/// Rate-limit suppression is not an error; a suppressed call is a successful
/// no-op and surfaces as a `Throttled` outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The request never completed: connect failure, timeout, TLS, DNS.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("control service returned {0}")]
    Status(StatusCode),

    /// The service answered 2xx but the body did not decode. Kept distinct
    /// from `Transport` so a broken deployment is tellable from a broken
    /// network.
    #[error("malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
}
