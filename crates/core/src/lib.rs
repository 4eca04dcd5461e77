//! Maika Control Link core library.
//!
//! Client-side session, command-dispatch and realtime-listener layer for the
//! Maika voice-assistant control service. The `maika-blocks` crate wraps this
//! into the palette-facing surface; everything stateful lives here.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod realtime;
pub mod session;

pub use config::{Config, ConfigError, Environment};
pub use dispatch::{AccountId, ControlClient, Dispatch, Login};
pub use error::ControlError;
pub use realtime::{ChannelCredentials, LinkState, ReconnectPolicy, UtteranceListener};
pub use session::{DISPATCH_WINDOW, Session};
