//! Realtime utterance channel.
//!
//! Once a login succeeds, the dispatcher arms a listener task that keeps a
//! websocket open against the control service and mirrors every recognized
//! speech event into a single-writer cell. Reads of that cell are synchronous
//! and never touch the network; the channel task runs independently of
//! command dispatch and may interleave with it freely.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

/// Event name carrying recognized speech.
pub const UTTERANCE_EVENT: &str = "utterances";

const SUBSCRIBE_EVENT: &str = "subscribe";

/// Connection lifecycle of the listener.
///
/// `Disconnected -> Connecting -> Connected`, back to `Disconnected` when the
/// channel drops. `Failed` is terminal and only reached when a connect attempt
/// fails under [`ReconnectPolicy::Never`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// What the listener does after losing the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Give up after the first loss.
    Never,
    /// Sleep for the given delay, then dial again.
    FixedDelay(Duration),
}

/// Identity presented when subscribing to the event channel.
#[derive(Clone, Debug, Serialize)]
pub struct ChannelCredentials {
    pub user_id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

#[derive(Serialize)]
struct SubscribeFrame<'a> {
    event: &'static str,
    payload: &'a ChannelCredentials,
}

#[derive(Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    payload: EventPayload,
}

#[derive(Default, Deserialize)]
struct EventPayload {
    utterance: Option<String>,
}

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the channel task and the last-utterance cell.
pub struct UtteranceListener {
    channel_url: Url,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    utterance_tx: watch::Sender<String>,
    utterance_rx: watch::Receiver<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UtteranceListener {
    /// A disarmed listener. Nothing connects until [`arm`](Self::arm) is
    /// called with channel credentials.
    pub fn new(channel_url: Url, policy: ReconnectPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (utterance_tx, utterance_rx) = watch::channel(String::new());
        Self {
            channel_url,
            policy,
            state_tx,
            state_rx,
            utterance_tx,
            utterance_rx,
            task: Mutex::new(None),
        }
    }

    /// The most recent recognized utterance, empty before any event has
    /// arrived. Non-blocking; never initiates a connection.
    pub fn last_utterance(&self) -> String {
        self.utterance_rx.borrow().clone()
    }

    pub fn link_state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Starts (or restarts) the channel task with fresh credentials.
    ///
    /// A previous task is aborted first so the cell keeps a single writer.
    /// The utterance cell itself is never cleared: the last value survives
    /// re-arms and reconnects.
    pub async fn arm(&self, credentials: ChannelCredentials) {
        info!(user_id = %credentials.user_id, "arming utterance listener");
        let mut slot = self.task.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(run(
            self.channel_url.clone(),
            credentials,
            self.policy,
            self.state_tx.clone(),
            self.utterance_tx.clone(),
        )));
    }
}

/// Channel supervisor: dial, pump, and apply the reconnect policy.
async fn run(
    url: Url,
    credentials: ChannelCredentials,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<LinkState>,
    utterance_tx: watch::Sender<String>,
) {
    loop {
        state_tx.send_replace(LinkState::Connecting);
        match open_channel(&url, &credentials).await {
            Ok(channel) => {
                info!(url = %url, "utterance channel connected");
                state_tx.send_replace(LinkState::Connected);
                if let Err(e) = pump(channel, &utterance_tx).await {
                    warn!(error = ?e, "utterance channel dropped");
                }
                state_tx.send_replace(LinkState::Disconnected);
            }
            Err(e) => {
                warn!(error = ?e, "utterance channel connect failed");
                if policy == ReconnectPolicy::Never {
                    state_tx.send_replace(LinkState::Failed);
                    return;
                }
                state_tx.send_replace(LinkState::Disconnected);
            }
        }
        match policy {
            ReconnectPolicy::Never => return,
            ReconnectPolicy::FixedDelay(delay) => sleep(delay).await,
        }
    }
}

/// Dials the endpoint and presents the subscribe envelope.
async fn open_channel(url: &Url, credentials: &ChannelCredentials) -> Result<Channel> {
    let (mut channel, _) = connect_async(url.as_str())
        .await
        .context("event channel handshake failed")?;
    let frame = serde_json::to_string(&SubscribeFrame {
        event: SUBSCRIBE_EVENT,
        payload: credentials,
    })
    .context("subscribe frame did not serialize")?;
    channel
        .send(WsMessage::Text(frame))
        .await
        .context("subscribe frame was not accepted")?;
    Ok(channel)
}

/// Reads events until the channel ends. Every `utterances` event overwrites
/// the cell unconditionally; whatever arrives last wins.
async fn pump(mut channel: Channel, utterance_tx: &watch::Sender<String>) -> Result<()> {
    while let Some(frame) = channel.next().await {
        match frame.context("event channel read failed")? {
            WsMessage::Text(text) => match serde_json::from_str::<EventFrame>(&text) {
                Ok(event) if event.event == UTTERANCE_EVENT => {
                    if let Some(utterance) = event.payload.utterance {
                        debug!(utterance = %utterance, "recognized speech received");
                        utterance_tx.send_replace(utterance);
                    }
                }
                Ok(event) => debug!(event = %event.event, "ignoring channel event"),
                Err(e) => debug!(error = %e, "ignoring undecodable channel frame"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
