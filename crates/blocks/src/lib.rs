//! Palette-facing surface for the Maika control link.
//!
//! The host block-runtime calls these operations synchronously with flat
//! string-keyed argument records and reads reporter values in place. Every
//! command spawns its network work on the ambient runtime and returns at
//! once, so state read immediately after a call may still be the pre-update
//! value. Nothing here ever fails to the host: dispatch outcomes and errors
//! are logged and discarded, and reporters always produce a value.

use maika_core::{ControlClient, ControlError, Dispatch, Login};
use std::collections::HashMap;
use std::future::Future;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub const ARG_EMAIL: &str = "EMAIL";
pub const ARG_PHONE_NUMBER: &str = "PHONE_NUMBER";
pub const ARG_PASSWORD: &str = "PASSWORD";
pub const ARG_CALLING_NAME: &str = "CALLING_NAME";
pub const ARG_UTTERANCE: &str = "UTTERANCE";
pub const ARG_TEXT: &str = "TEXT";

/// The flat argument record the host passes to every block.
pub type ArgRecord = HashMap<String, String>;

/// One palette extension instance bound to one control session.
pub struct MaikaBlocks {
    client: ControlClient,
    runtime: Handle,
}

impl MaikaBlocks {
    /// Binds the surface to the runtime it was created on. Must be called
    /// from within a tokio runtime.
    pub fn new(client: ControlClient) -> Self {
        Self::with_handle(client, Handle::current())
    }

    pub fn with_handle(client: ControlClient, runtime: Handle) -> Self {
        Self { client, runtime }
    }

    /// The login block. Reporter-shaped: produces a value immediately while
    /// authentication completes in the background. A non-empty `EMAIL` wins
    /// over `PHONE_NUMBER` as the identity.
    pub fn login(&self, args: &ArgRecord) -> String {
        let email = arg(args, ARG_EMAIL);
        let phone_number = arg(args, ARG_PHONE_NUMBER);
        let password = arg(args, ARG_PASSWORD).to_string();
        let identity = if email.is_empty() { phone_number } else { email }.to_string();

        let client = self.client.clone();
        self.runtime.spawn(async move {
            match client.authenticate(&identity, &password).await {
                Ok(Login::Authenticated { account_id }) => {
                    debug!(account_id = %account_id, "login block completed");
                }
                Ok(Login::Throttled) => debug!("login block inside the dispatch window"),
                Err(e) => warn!(error = %e, "login block failed"),
            }
        });
        String::new()
    }

    /// The free-form command block.
    pub fn send_message(&self, args: &ArgRecord) {
        let calling_name = arg(args, ARG_CALLING_NAME).to_string();
        let utterance = arg(args, ARG_UTTERANCE).to_string();
        let client = self.client.clone();
        self.spawn_command("send_message", async move {
            client.send_utterance(&calling_name, &utterance).await
        });
    }

    /// The repeat-aloud block.
    pub fn speak(&self, args: &ArgRecord) {
        let calling_name = arg(args, ARG_CALLING_NAME).to_string();
        let text = arg(args, ARG_TEXT).to_string();
        let client = self.client.clone();
        self.spawn_command("speak", async move { client.speak(&calling_name, &text).await });
    }

    pub fn enable_echo_mode(&self, args: &ArgRecord) {
        let calling_name = arg(args, ARG_CALLING_NAME).to_string();
        let client = self.client.clone();
        self.spawn_command("enable_echo_mode", async move {
            client.enable_echo_mode(&calling_name).await
        });
    }

    pub fn disable_echo_mode(&self, args: &ArgRecord) {
        let calling_name = arg(args, ARG_CALLING_NAME).to_string();
        let client = self.client.clone();
        self.spawn_command("disable_echo_mode", async move {
            client.disable_echo_mode(&calling_name).await
        });
    }

    /// The reporter block: the last recognized utterance, empty string until
    /// the channel has delivered one.
    pub fn last_utterance(&self) -> String {
        self.client.last_utterance()
    }

    fn spawn_command<F>(&self, block: &'static str, op: F)
    where
        F: Future<Output = Result<Dispatch, ControlError>> + Send + 'static,
    {
        self.runtime.spawn(async move {
            match op.await {
                Ok(Dispatch::Sent { .. }) => debug!(block, "command delivered"),
                Ok(Dispatch::Throttled) => {
                    debug!(block, "command inside the dispatch window, skipped")
                }
                Err(e) => warn!(block, error = %e, "command failed"),
            }
        });
    }
}

fn arg<'a>(args: &'a ArgRecord, key: &str) -> &'a str {
    args.get(key).map(String::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use maika_core::{Config, ReconnectPolicy};

    fn offline_blocks() -> MaikaBlocks {
        // Nothing listens here; every dispatch fails and must be swallowed.
        let mut config = Config::for_base_url("http://127.0.0.1:9").unwrap();
        config.reconnect = ReconnectPolicy::Never;
        MaikaBlocks::new(ControlClient::new(&config).unwrap())
    }

    fn record(entries: &[(&str, &str)]) -> ArgRecord {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn reporter_defaults_to_the_empty_string() {
        let blocks = offline_blocks();
        assert_eq!(blocks.last_utterance(), "");
    }

    #[tokio::test]
    async fn login_reports_immediately_and_never_fails_the_host() {
        let blocks = offline_blocks();
        let value = blocks.login(&record(&[
            (ARG_EMAIL, "a@b.com"),
            (ARG_PASSWORD, "x"),
        ]));
        assert_eq!(value, "");
    }

    #[tokio::test]
    async fn commands_with_missing_args_are_still_harmless() {
        let blocks = offline_blocks();
        blocks.send_message(&record(&[]));
        blocks.speak(&record(&[(ARG_CALLING_NAME, "Maika")]));
        blocks.enable_echo_mode(&record(&[]));
        blocks.disable_echo_mode(&record(&[]));
        // Let the spawned work run into its transport failures.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(blocks.last_utterance(), "");
    }

    #[test]
    fn missing_keys_read_as_empty() {
        let args = record(&[(ARG_CALLING_NAME, "Maika")]);
        assert_eq!(arg(&args, ARG_CALLING_NAME), "Maika");
        assert_eq!(arg(&args, ARG_UTTERANCE), "");
    }
}
