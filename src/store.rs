use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the configuration/persistence store. All of them are treated
/// as transient by the pipeline: dedup reads fail open, failed persistence
/// writes drop the message and bump the error counter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("store returned no rows for insert")]
    EmptyInsert,
}

/// Active keyword as configured by the admin surface.
#[derive(Debug, Clone, Deserialize)]
pub struct KeywordRow {
    pub keyword: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Chat on the monitoring allow-list.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoredChatRow {
    pub chat_id: String,
    pub chat_name: String,
}

/// Notification recipient attached to a category.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipientRow {
    #[serde(default)]
    pub name: Option<String>,
    pub category: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl RecipientRow {
    /// Contact identity used for deduplication: phone if present, else handle.
    pub fn contact_identity(&self) -> Option<&str> {
        self.phone.as_deref().or(self.username.as_deref())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed recipient")
    }
}

/// Previously stored message returned by the dedup lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct ExistingMessage {
    pub id: i64,
    pub message_text: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Message record inserted after a Unique classification.
#[derive(Debug, Clone, Serialize)]
pub struct NewStoredMessage {
    pub message_text: String,
    pub chat_id: String,
    pub chat_name: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub message_id: String,
    pub content_hash: String,
    pub platform: String,
    pub contains_keywords: bool,
    pub matched_keywords: Vec<String>,
}

/// Link from a rejected occurrence back to the original message.
#[derive(Debug, Clone, Serialize)]
pub struct NewDuplicate {
    pub original_message_id: i64,
    pub duplicate_user_id: String,
    pub duplicate_chat_id: String,
    pub content_hash: String,
    pub detected_at: DateTime<Utc>,
}

/// Read/write surface of the external store. The pipeline only ever issues
/// equality-filtered fetches and single-row inserts.
#[async_trait]
pub trait Store: Send + Sync {
    async fn active_keywords(&self) -> Result<Vec<KeywordRow>, StoreError>;
    async fn active_chats(&self) -> Result<Vec<MonitoredChatRow>, StoreError>;
    /// Category of one keyword, matched by exact (case-sensitive) equality.
    async fn keyword_category(&self, keyword: &str) -> Result<Option<String>, StoreError>;
    async fn recipients_for_category(&self, category: &str)
        -> Result<Vec<RecipientRow>, StoreError>;
    /// Newest stored message with this content hash created at or after `since`.
    async fn find_recent_by_hash(
        &self,
        content_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ExistingMessage>, StoreError>;
    /// Insert a message record, returning its row id.
    async fn insert_message(&self, row: &NewStoredMessage) -> Result<i64, StoreError>;
    async fn insert_duplicate(&self, row: &NewDuplicate) -> Result<(), StoreError>;
}

/// Supabase-backed store speaking the PostgREST wire format.
pub struct SupabaseStore {
    http: reqwest::Client,
    base: String,
    key: String,
}

#[derive(Deserialize)]
struct InsertedId {
    id: i64,
}

impl SupabaseStore {
    pub fn new(url: &str, service_key: &str) -> Self {
        SupabaseStore {
            http: reqwest::Client::new(),
            base: format!("{}/rest/v1", url.trim_end_matches('/')),
            key: service_key.to_string(),
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let response = self
            .http
            .get(format!("{}/{}", self.base, table))
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    async fn insert<R: Serialize>(
        &self,
        table: &str,
        row: &R,
        want_id: bool,
    ) -> Result<Option<i64>, StoreError> {
        let prefer = if want_id { "return=representation" } else { "return=minimal" };
        let response = self
            .http
            .post(format!("{}/{}", self.base, table))
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Prefer", prefer)
            .json(row)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }
        if !want_id {
            return Ok(None);
        }
        let rows: Vec<InsertedId> = response.json().await?;
        match rows.first() {
            Some(inserted) => Ok(Some(inserted.id)),
            None => Err(StoreError::EmptyInsert),
        }
    }
}

#[async_trait]
impl Store for SupabaseStore {
    async fn active_keywords(&self) -> Result<Vec<KeywordRow>, StoreError> {
        self.fetch(
            "keywords",
            &[
                ("select", "keyword,category".to_string()),
                ("active", "eq.true".to_string()),
            ],
        )
        .await
    }

    async fn active_chats(&self) -> Result<Vec<MonitoredChatRow>, StoreError> {
        self.fetch(
            "monitored_chats",
            &[
                ("select", "chat_id,chat_name".to_string()),
                ("active", "eq.true".to_string()),
            ],
        )
        .await
    }

    async fn keyword_category(&self, keyword: &str) -> Result<Option<String>, StoreError> {
        let rows: Vec<KeywordRow> = self
            .fetch(
                "keywords",
                &[
                    ("select", "keyword,category".to_string()),
                    ("keyword", format!("eq.{}", keyword)),
                    ("active", "eq.true".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().find_map(|row| row.category))
    }

    async fn recipients_for_category(
        &self,
        category: &str,
    ) -> Result<Vec<RecipientRow>, StoreError> {
        self.fetch(
            "recipient_categories",
            &[
                ("select", "name,category,username,phone".to_string()),
                ("category", format!("eq.{}", category)),
                ("active", "eq.true".to_string()),
            ],
        )
        .await
    }

    async fn find_recent_by_hash(
        &self,
        content_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ExistingMessage>, StoreError> {
        let rows: Vec<ExistingMessage> = self
            .fetch(
                "messages",
                &[
                    ("select", "id,message_text,user_id,created_at".to_string()),
                    ("content_hash", format!("eq.{}", content_hash)),
                    ("created_at", format!("gte.{}", since.to_rfc3339())),
                    ("order", "created_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_message(&self, row: &NewStoredMessage) -> Result<i64, StoreError> {
        match self.insert("messages", row, true).await? {
            Some(id) => Ok(id),
            None => Err(StoreError::EmptyInsert),
        }
    }

    async fn insert_duplicate(&self, row: &NewDuplicate) -> Result<(), StoreError> {
        self.insert("message_duplicates", row, false).await?;
        Ok(())
    }
}
