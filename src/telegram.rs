use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grammers_client::types::{Chat, Message};
use grammers_client::{Client, Config, InputMessage};
use log::info;
use thiserror::Error;

use crate::store::RecipientRow;

/// One message event, captured for the duration of a single pipeline pass.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message_id: String,
    pub chat_id: String,
    pub chat_name: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub sender_username: Option<String>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Connect to Telegram using an already-provisioned session file.
/// Session creation is operational glue handled outside this binary, so an
/// unauthorized session is a startup error rather than a login prompt.
pub async fn connect(api_id: i32, api_hash: &str, session_file: &str) -> anyhow::Result<Client> {
    let client = Client::connect(Config {
        session: grammers_client::session::Session::load_file_or_create(session_file)
            .with_context(|| format!("failed to load session file {}", session_file))?,
        api_id,
        api_hash: api_hash.to_string(),
        params: Default::default(),
    })
    .await
    .context("failed to connect to Telegram")?;

    if !client.is_authorized().await? {
        bail!(
            "session file {} is not authorized; provision a logged-in session first",
            session_file
        );
    }

    info!("Telegram client connected and authorized");
    Ok(client)
}

/// Convert a raw update message into the pipeline's ephemeral record.
/// The chat name here is whatever Telegram reports; the pipeline replaces it
/// with the admin-configured name once the chat passes the allow-list gate.
pub fn incoming_from_message(message: &Message) -> IncomingMessage {
    let chat = message.chat();
    let (sender_id, sender_display_name, sender_username) = match message.sender() {
        Some(Chat::User(user)) => (
            user.id().to_string(),
            non_empty_or(user.full_name(), format!("User {}", user.id())),
            user.username().map(str::to_string),
        ),
        Some(sender) => (
            sender.id().to_string(),
            sender.name().to_string(),
            sender.username().map(str::to_string),
        ),
        None => ("unknown".to_string(), "Unknown User".to_string(), None),
    };

    IncomingMessage {
        message_id: message.id().to_string(),
        chat_id: chat.id().to_string(),
        chat_name: chat.name().to_string(),
        sender_id,
        sender_display_name,
        sender_username,
        text: message.text().to_string(),
        received_at: message.date(),
    }
}

fn non_empty_or(value: String, fallback: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}

/// Per-recipient notification failure. Never aborts the fan-out.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("recipient has no telegram handle (phone-only contacts cannot be messaged)")]
    NoHandle,
    #[error("username '{0}' did not resolve to a chat")]
    UnknownRecipient(String),
    #[error("telegram send failed: {0}")]
    Telegram(#[from] grammers_client::InvocationError),
}

/// Outbound send capability, kept behind a trait so the pipeline can be
/// exercised without a live Telegram connection.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &RecipientRow, text: &str) -> Result<(), SendError>;
}

/// Sends notifications through the connected user account, addressed by the
/// recipient's username.
pub struct TelegramNotifier {
    client: Client,
}

impl TelegramNotifier {
    pub fn new(client: Client) -> Self {
        TelegramNotifier { client }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, recipient: &RecipientRow, text: &str) -> Result<(), SendError> {
        let username = recipient.username.as_deref().ok_or(SendError::NoHandle)?;
        let username = username.trim_start_matches('@');
        let chat = self
            .client
            .resolve_username(username)
            .await?
            .ok_or_else(|| SendError::UnknownRecipient(username.to_string()))?;
        self.client
            .send_message(&chat, InputMessage::text(text))
            .await?;
        info!(
            "notification sent to {} (@{})",
            recipient.display_name(),
            username
        );
        Ok(())
    }
}
