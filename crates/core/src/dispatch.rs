//! Command dispatch against the user-device control API.
//!
//! One `ControlClient` is one logical session: it signs the user in, forwards
//! discrete commands to the device under the shared rate limit, and arms the
//! realtime listener once credentials are known. Handles are cheap to clone;
//! all clones share the same session and dispatch window.

use crate::config::Config;
use crate::error::ControlError;
use crate::realtime::{ChannelCredentials, LinkState, UtteranceListener};
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const CONTROL_PATH: &str = "/v1/user-device/control";
const LOGIN_PATH: &str = "/v1/auth/login";
const OTP_LOGIN_PATH: &str = "/v1/auth/otp/login";

const SPEAK_PREFIX: &str = "repeat after me ";
const ECHO_ON_UTTERANCE: &str = "turn on echo mode";
const ECHO_OFF_UTTERANCE: &str = "stop";

#[derive(Serialize)]
struct ControlRequest<'a> {
    calling_name: &'a str,
    utterance: &'a str,
}

#[derive(Deserialize)]
struct ControlReply {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_number: Option<&'a str>,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginReply {
    data: LoginData,
}

#[derive(Deserialize)]
struct LoginData {
    access_token: String,
    id: AccountId,
}

/// The login response's `id` arrives as a number or a string depending on the
/// account type; either way it is treated as an opaque identifier.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AccountId {
    Number(i64),
    Text(String),
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountId::Number(n) => write!(f, "{}", n),
            AccountId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Outcome of a command dispatch. `Throttled` means the call landed inside
/// the shared window and no request was made; it is not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Sent { message: Option<String> },
    Throttled,
}

/// Outcome of an authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Login {
    Authenticated { account_id: String },
    Throttled,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    session: Mutex<Session>,
    listener: UtteranceListener,
}

/// Client for one authenticated control session.
#[derive(Clone)]
pub struct ControlClient {
    inner: Arc<Inner>,
}

impl ControlClient {
    pub fn new(config: &Config) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(config.control_timeout)
            .build()?;
        let listener = UtteranceListener::new(config.channel_url(), config.reconnect);
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
                session: Mutex::new(Session::new()),
                listener,
            }),
        })
    }

    /// Signs in with an email address or a phone number.
    ///
    /// An identity containing `'@'` goes to the password-login endpoint,
    /// anything else to the OTP-login endpoint. On success the bearer token
    /// and account id are stored and the utterance listener is armed. Any
    /// failure leaves the session exactly as it was: unauthenticated stays
    /// unauthenticated.
    pub async fn authenticate(&self, identity: &str, secret: &str) -> Result<Login, ControlError> {
        if !self.claim_dispatch_slot().await {
            debug!("login attempt inside the dispatch window, suppressed");
            return Ok(Login::Throttled);
        }

        let email_identity = identity.contains('@');
        let path = if email_identity { LOGIN_PATH } else { OTP_LOGIN_PATH };
        let body = LoginRequest {
            email: email_identity.then_some(identity),
            phone_number: (!email_identity).then_some(identity),
            password: secret,
        };

        let reply: LoginReply = self.post_json(path, &body, None).await?;
        let token = reply.data.access_token;
        let account_id = reply.data.id.to_string();

        {
            let mut session = self.inner.session.lock().await;
            session.set_credentials(token.clone(), account_id.clone());
        }
        info!(account_id = %account_id, "authenticated against the control service");

        self.inner
            .listener
            .arm(ChannelCredentials {
                user_id: account_id.clone(),
                token,
                email: email_identity.then(|| identity.to_string()),
                phone_number: (!email_identity).then(|| identity.to_string()),
            })
            .await;

        Ok(Login::Authenticated { account_id })
    }

    /// Forwards a free-form utterance to the named device.
    pub async fn send_utterance(
        &self,
        calling_name: &str,
        utterance: &str,
    ) -> Result<Dispatch, ControlError> {
        self.dispatch(calling_name, utterance).await
    }

    /// Has the device repeat `text` aloud.
    pub async fn speak(&self, calling_name: &str, text: &str) -> Result<Dispatch, ControlError> {
        let utterance = format!("{}{}", SPEAK_PREFIX, text);
        self.dispatch(calling_name, &utterance).await
    }

    /// Puts the device into echo mode.
    pub async fn enable_echo_mode(&self, calling_name: &str) -> Result<Dispatch, ControlError> {
        self.dispatch(calling_name, ECHO_ON_UTTERANCE).await
    }

    /// Takes the device out of echo mode.
    pub async fn disable_echo_mode(&self, calling_name: &str) -> Result<Dispatch, ControlError> {
        self.dispatch(calling_name, ECHO_OFF_UTTERANCE).await
    }

    /// The most recent recognized utterance, empty before any channel event.
    pub fn last_utterance(&self) -> String {
        self.inner.listener.last_utterance()
    }

    /// Current state of the realtime channel.
    pub fn link_state(&self) -> LinkState {
        self.inner.listener.link_state()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.session.lock().await.is_authenticated()
    }

    /// Claims the shared rate-limit slot. Every attempt refreshes the window,
    /// suppressed ones included; see [`Session::note_dispatch`].
    async fn claim_dispatch_slot(&self) -> bool {
        self.inner
            .session
            .lock()
            .await
            .note_dispatch(Instant::now())
    }

    async fn dispatch(
        &self,
        calling_name: &str,
        utterance: &str,
    ) -> Result<Dispatch, ControlError> {
        if !self.claim_dispatch_slot().await {
            debug!(calling_name, utterance, "dispatch inside the window, suppressed");
            return Ok(Dispatch::Throttled);
        }

        // An empty token is sent as an empty bearer; the service rejects it
        // with an authorization error like any other stale credential.
        let token = self.inner.session.lock().await.token().to_string();
        let reply: ControlReply = self
            .post_json(
                CONTROL_PATH,
                &ControlRequest {
                    calling_name,
                    utterance,
                },
                Some(&token),
            )
            .await?;
        debug!(calling_name, utterance, message = ?reply.message, "command delivered");
        Ok(Dispatch::Sent {
            message: reply.message,
        })
    }

    async fn post_json<B, R>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<R, ControlError>
    where
        B: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.inner.base_url, path);
        let mut request = self.inner.http.post(&url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::Status(status));
        }
        // Decode from text so an unparseable body is tellable from a
        // transport failure.
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
