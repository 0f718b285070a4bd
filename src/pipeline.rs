use chrono::Utc;
use grammers_client::{Client, Update};
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::{sleep, Duration};

use crate::store::{NewDuplicate, NewStoredMessage, Store};
use crate::telegram::{self, IncomingMessage, Notifier};
use crate::{dedup, hasher, matcher, notify, recipients};

/// Keyword and chat configuration is re-read from the store on this cadence.
pub const CONFIG_REFRESH_SECS: u64 = 300;

/// Immutable configuration snapshot. Replaced wholesale on refresh so a
/// reader mid-message never observes a partial update.
pub struct ConfigSnapshot {
    pub version: u64,
    /// Case-folded keyword specs in admin order.
    pub keywords: Vec<String>,
    /// chat_id -> admin-configured chat name.
    pub chats: HashMap<String, String>,
}

impl ConfigSnapshot {
    fn empty() -> Self {
        ConfigSnapshot { version: 0, keywords: Vec::new(), chats: HashMap::new() }
    }
}

#[derive(Default)]
struct Stats {
    messages_processed: AtomicU64,
    duplicates: AtomicU64,
    keywords_found: AtomicU64,
    errors: AtomicU64,
}

/// Per-message ingestion flow plus the periodic configuration refresh.
pub struct Pipeline<S, N> {
    store: Arc<S>,
    notifier: N,
    config: RwLock<Arc<ConfigSnapshot>>,
    stats: Stats,
    // Short-lived locks keyed on the normalized fingerprint so two
    // near-simultaneous duplicates cannot both pass the dedup lookup.
    fingerprint_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: Store, N: Notifier> Pipeline<S, N> {
    pub fn new(store: Arc<S>, notifier: N) -> Self {
        Pipeline {
            store,
            notifier,
            config: RwLock::new(Arc::new(ConfigSnapshot::empty())),
            stats: Stats::default(),
            fingerprint_locks: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config.read().unwrap().clone()
    }

    /// Load active keywords and monitored chats and swap in a new snapshot.
    /// A failed load keeps the previous snapshot in place.
    pub async fn refresh_config(&self) {
        let keywords = match self.store.active_keywords().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("keyword reload failed, keeping previous snapshot: {}", e);
                return;
            }
        };
        let chats = match self.store.active_chats().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("chat reload failed, keeping previous snapshot: {}", e);
                return;
            }
        };

        let version = self.snapshot().version + 1;
        let snapshot = ConfigSnapshot {
            version,
            keywords: keywords.iter().map(|k| k.keyword.to_lowercase()).collect(),
            chats: chats
                .into_iter()
                .map(|c| (c.chat_id, c.chat_name))
                .collect(),
        };
        info!(
            "configuration v{}: {} keyword(s), {} monitored chat(s)",
            snapshot.version,
            snapshot.keywords.len(),
            snapshot.chats.len()
        );
        *self.config.write().unwrap() = Arc::new(snapshot);
    }

    async fn fingerprint_lock(&self, hash: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let cell = {
            let mut locks = self.fingerprint_locks.lock().unwrap();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(hash.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        cell.lock_owned().await
    }

    /// Process one message event end to end. All failures are absorbed here;
    /// nothing propagates out to the update loop.
    pub async fn handle_message(&self, mut message: IncomingMessage) {
        let snapshot = self.snapshot();

        // 1. Only chats on the allow-list are processed.
        let chat_name = match snapshot.chats.get(&message.chat_id) {
            Some(name) => name.clone(),
            None => {
                debug!("ignoring message from unmonitored chat {}", message.chat_id);
                return;
            }
        };
        message.chat_name = chat_name;

        // 2. Only messages with a text payload.
        if message.text.trim().is_empty() {
            return;
        }

        self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);
        info!(
            "new message {} in '{}' from user {}",
            message.message_id, message.chat_name, message.sender_id
        );

        // 3. Fingerprints.
        let strict_hash = hasher::strict_fingerprint(&message.text, &message.sender_id);
        let content_hash = hasher::normalized_fingerprint(&message.text);

        // 4. Classify, holding the fingerprint lock across classify-then-persist.
        let guard = self.fingerprint_lock(&content_hash).await;
        match dedup::classify(
            self.store.as_ref(),
            &message.text,
            &content_hash,
            &strict_hash,
            &message.sender_id,
        )
        .await
        {
            dedup::Classification::Duplicate { original, reason } => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                info!("rejected as duplicate of {}: {}", original.id, reason);
                let record = NewDuplicate {
                    original_message_id: original.id,
                    duplicate_user_id: message.sender_id.clone(),
                    duplicate_chat_id: message.chat_id.clone(),
                    content_hash,
                    detected_at: Utc::now(),
                };
                if let Err(e) = self.store.insert_duplicate(&record).await {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!("failed to record duplicate: {}", e);
                }
                return;
            }
            dedup::Classification::Unique => {}
        }

        // 5. Match keywords and persist. All traffic is retained for audit,
        // not only matches.
        let matched = matcher::match_keywords(&message.text, &snapshot.keywords);
        let row = NewStoredMessage {
            message_text: message.text.clone(),
            chat_id: message.chat_id.clone(),
            chat_name: message.chat_name.clone(),
            user_id: message.sender_id.clone(),
            username: message.sender_username.clone(),
            message_id: message.message_id.clone(),
            content_hash,
            platform: "telegram".to_string(),
            contains_keywords: !matched.is_empty(),
            matched_keywords: matched.clone(),
        };
        match self.store.insert_message(&row).await {
            Ok(id) => {
                info!("stored message {} | keywords: {:?}", id, matched);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!("failed to store message, dropping it: {}", e);
                return;
            }
        }
        drop(guard);

        // 6. Fan out to recipients on a keyword match.
        if matched.is_empty() {
            return;
        }
        self.stats.keywords_found.fetch_add(1, Ordering::Relaxed);

        let resolved = recipients::resolve(self.store.as_ref(), &matched).await;
        if resolved.is_empty() {
            info!("no recipients configured for {:?}, nothing to send", matched);
            return;
        }

        let text = notify::render(&message, &matched);
        for recipient in &resolved {
            if let Err(e) = self.notifier.send(recipient, &text).await {
                error!(
                    "failed to notify {}: {}",
                    recipient.display_name(),
                    e
                );
            }
        }
    }

    pub fn log_stats(&self) {
        info!(
            "stats: processed={} duplicates={} keyword_matches={} errors={}",
            self.stats.messages_processed.load(Ordering::Relaxed),
            self.stats.duplicates.load(Ordering::Relaxed),
            self.stats.keywords_found.load(Ordering::Relaxed),
            self.stats.errors.load(Ordering::Relaxed),
        );
    }
}

/// Subscribe to the update stream and run until it ends. The configuration
/// refresh runs on its own timer, concurrently with message processing.
pub async fn run<S, N>(pipeline: Arc<Pipeline<S, N>>, client: Client) -> anyhow::Result<()>
where
    S: Store + 'static,
    N: Notifier + 'static,
{
    pipeline.refresh_config().await;

    let refresher = pipeline.clone();
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(CONFIG_REFRESH_SECS)).await;
            refresher.refresh_config().await;
            refresher.log_stats();
        }
    });

    info!("waiting for new messages");
    loop {
        match client.next_update().await {
            Ok(Update::NewMessage(message)) => {
                if message.outgoing() {
                    continue;
                }
                let incoming = telegram::incoming_from_message(&message);
                pipeline.handle_message(incoming).await;
            }
            Ok(_) => {}
            Err(e) => {
                // Stream errors are logged and the subscription continues.
                error!("update stream error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ExistingMessage, KeywordRow, MonitoredChatRow, RecipientRow, StoreError,
    };
    use crate::telegram::SendError;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use reqwest::StatusCode;

    struct StoredRow {
        id: i64,
        row: NewStoredMessage,
        created_at: DateTime<Utc>,
    }

    /// In-memory store mirroring the tables the pipeline touches.
    #[derive(Default)]
    struct MemoryStore {
        keywords: Vec<KeywordRow>,
        chats: Vec<MonitoredChatRow>,
        recipients: Vec<RecipientRow>,
        messages: Mutex<Vec<StoredRow>>,
        duplicates: Mutex<Vec<NewDuplicate>>,
        fail_message_inserts: bool,
    }

    impl MemoryStore {
        fn seed_message(&self, text: &str, user_id: &str, age: ChronoDuration) {
            let content_hash = hasher::normalized_fingerprint(text);
            let mut messages = self.messages.lock().unwrap();
            let id = messages.len() as i64 + 1;
            messages.push(StoredRow {
                id,
                row: NewStoredMessage {
                    message_text: text.to_string(),
                    chat_id: "-100123".to_string(),
                    chat_name: "Грузы Москва".to_string(),
                    user_id: user_id.to_string(),
                    username: None,
                    message_id: "0".to_string(),
                    content_hash,
                    platform: "telegram".to_string(),
                    contains_keywords: false,
                    matched_keywords: Vec::new(),
                },
                created_at: Utc::now() - age,
            });
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn active_keywords(&self) -> Result<Vec<KeywordRow>, StoreError> {
            Ok(self.keywords.clone())
        }
        async fn active_chats(&self) -> Result<Vec<MonitoredChatRow>, StoreError> {
            Ok(self.chats.clone())
        }
        async fn keyword_category(&self, keyword: &str) -> Result<Option<String>, StoreError> {
            Ok(self
                .keywords
                .iter()
                .find(|k| k.keyword == keyword)
                .and_then(|k| k.category.clone()))
        }
        async fn recipients_for_category(
            &self,
            category: &str,
        ) -> Result<Vec<RecipientRow>, StoreError> {
            Ok(self
                .recipients
                .iter()
                .filter(|r| r.category == category)
                .cloned()
                .collect())
        }
        async fn find_recent_by_hash(
            &self,
            content_hash: &str,
            since: DateTime<Utc>,
        ) -> Result<Option<ExistingMessage>, StoreError> {
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.row.content_hash == content_hash && m.created_at >= since)
                .max_by_key(|m| m.created_at)
                .map(|m| ExistingMessage {
                    id: m.id,
                    message_text: m.row.message_text.clone(),
                    user_id: m.row.user_id.clone(),
                    created_at: m.created_at,
                }))
        }
        async fn insert_message(&self, row: &NewStoredMessage) -> Result<i64, StoreError> {
            if self.fail_message_inserts {
                return Err(StoreError::Status {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: "down".to_string(),
                });
            }
            let mut messages = self.messages.lock().unwrap();
            let id = messages.len() as i64 + 1;
            messages.push(StoredRow { id, row: row.clone(), created_at: Utc::now() });
            Ok(id)
        }
        async fn insert_duplicate(&self, row: &NewDuplicate) -> Result<(), StoreError> {
            self.duplicates.lock().unwrap().push(row.clone());
            Ok(())
        }
    }

    /// Notifier that records sends instead of talking to Telegram. Sends to
    /// `fail_for` error out, like an unresolvable username would.
    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, recipient: &RecipientRow, text: &str) -> Result<(), SendError> {
            let identity = recipient
                .contact_identity()
                .unwrap_or("none")
                .to_string();
            if self.fail_for.as_deref() == Some(identity.as_str()) {
                return Err(SendError::UnknownRecipient(identity));
            }
            self.sent.lock().unwrap().push((identity, text.to_string()));
            Ok(())
        }
    }

    fn cargo_store() -> MemoryStore {
        MemoryStore {
            keywords: vec![KeywordRow {
                keyword: "тандем;140".to_string(),
                category: Some("cargo".to_string()),
            }],
            chats: vec![MonitoredChatRow {
                chat_id: "-100123".to_string(),
                chat_name: "Грузы Москва".to_string(),
            }],
            recipients: vec![RecipientRow {
                name: Some("Иван".to_string()),
                category: "cargo".to_string(),
                username: Some("ivan".to_string()),
                phone: None,
            }],
            ..MemoryStore::default()
        }
    }

    fn incoming(text: &str, chat_id: &str, sender_id: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: "555".to_string(),
            chat_id: chat_id.to_string(),
            chat_name: "raw telegram name".to_string(),
            sender_id: sender_id.to_string(),
            sender_display_name: "Иван Петров".to_string(),
            sender_username: Some("ivan_petrov".to_string()),
            text: text.to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn matched_message_is_stored_and_sent_once() {
        let store = Arc::new(cargo_store());
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline
            .handle_message(incoming("Нужен тандем 140 куб на завтра", "-100123", "1001"))
            .await;

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].row.contains_keywords);
        assert_eq!(messages[0].row.matched_keywords, vec!["тандем;140"]);
        assert_eq!(messages[0].row.chat_name, "Грузы Москва");
        assert_eq!(messages[0].row.platform, "telegram");
        drop(messages);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ivan");
        assert!(sent[0].1.contains("тандем;140"));
    }

    #[tokio::test]
    async fn replayed_message_creates_duplicate_record_and_no_send() {
        let store = Arc::new(cargo_store());
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        let text = "Нужен тандем 140 куб на завтра";
        pipeline.handle_message(incoming(text, "-100123", "1001")).await;
        // Same sender reposts five minutes later (same pipeline run).
        pipeline.handle_message(incoming(text, "-100123", "1001")).await;

        assert_eq!(store.messages.lock().unwrap().len(), 1);
        let duplicates = store.duplicates.lock().unwrap();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].original_message_id, 1);
        assert_eq!(duplicates[0].duplicate_user_id, "1001");
        drop(duplicates);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aged_out_fingerprint_is_stored_as_new() {
        let store = Arc::new(cargo_store());
        store.seed_message("Нужен тандем 140 куб на завтра", "1001", ChronoDuration::hours(25));
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline
            .handle_message(incoming("Нужен тандем 140 куб на завтра", "-100123", "1001"))
            .await;

        assert_eq!(store.messages.lock().unwrap().len(), 2);
        assert!(store.duplicates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmonitored_chat_is_ignored() {
        let store = Arc::new(cargo_store());
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline
            .handle_message(incoming("Нужен тандем 140 куб", "-100999", "1001"))
            .await;

        assert!(store.messages.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_message_is_stored_without_sends() {
        let store = Arc::new(cargo_store());
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline
            .handle_message(incoming("Просто болтовня без ключей", "-100123", "1001"))
            .await;

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].row.contains_keywords);
        assert!(messages[0].row.matched_keywords.is_empty());
        drop(messages);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_persist_drops_message_and_skips_fanout() {
        let store = Arc::new(MemoryStore {
            fail_message_inserts: true,
            ..cargo_store()
        });
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline
            .handle_message(incoming("Нужен тандем 140 куб", "-100123", "1001"))
            .await;

        assert!(store.messages.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(pipeline.stats.errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn send_failure_for_one_recipient_does_not_block_others() {
        let mut store = cargo_store();
        store.recipients.push(RecipientRow {
            name: Some("Олег".to_string()),
            category: "cargo".to_string(),
            username: Some("oleg".to_string()),
            phone: None,
        });
        let store = Arc::new(store);
        let notifier = RecordingNotifier {
            fail_for: Some("ivan".to_string()),
            ..RecordingNotifier::default()
        };
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline
            .handle_message(incoming("Нужен тандем 140 куб", "-100123", "1001"))
            .await;

        // The first recipient's failure is logged; the second still gets it.
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "oleg");
    }

    #[tokio::test]
    async fn empty_text_is_ignored() {
        let store = Arc::new(cargo_store());
        let notifier = RecordingNotifier::default();
        let pipeline = Pipeline::new(store.clone(), notifier.clone());
        pipeline.refresh_config().await;

        pipeline.handle_message(incoming("   ", "-100123", "1001")).await;

        assert!(store.messages.lock().unwrap().is_empty());
        assert_eq!(pipeline.stats.messages_processed.load(Ordering::Relaxed), 0);
    }
}
