use chrono::{Duration, Utc};
use log::{debug, error, info};
use strsim::normalized_levenshtein;

use crate::hasher;
use crate::store::{ExistingMessage, Store};

/// Postings expire as duplicates after 24 hours and may legitimately recur,
/// e.g. a daily repost of the same route.
pub const DEDUP_WINDOW_HOURS: i64 = 24;

/// Terminal classification of an incoming message.
#[derive(Debug)]
pub enum Classification {
    Unique,
    Duplicate {
        original: ExistingMessage,
        reason: String,
    },
}

/// Decide whether a message is a duplicate of a prior posting within the
/// trailing window. Exact lookup on the normalized fingerprint; the
/// similarity ratio is computed for the log line only and never changes the
/// decision. Any store failure classifies as Unique: over-storing a possible
/// duplicate beats silently losing a message.
pub async fn classify<S: Store + ?Sized>(
    store: &S,
    text: &str,
    content_hash: &str,
    strict_hash: &str,
    sender_id: &str,
) -> Classification {
    let since = Utc::now() - Duration::hours(DEDUP_WINDOW_HOURS);

    let existing = match store.find_recent_by_hash(content_hash, since).await {
        Ok(found) => found,
        Err(e) => {
            error!("dedup lookup failed, classifying as unique: {}", e);
            return Classification::Unique;
        }
    };

    let existing = match existing {
        Some(row) => row,
        None => {
            debug!("no prior message with hash {}..., unique", hash_prefix(content_hash));
            return Classification::Unique;
        }
    };

    let age_hours = (Utc::now() - existing.created_at).num_minutes() as f64 / 60.0;
    if age_hours > DEDUP_WINDOW_HOURS as f64 {
        // The query window should already exclude this, but the record's own
        // timestamp is authoritative: an aged-out posting is a fresh one.
        info!(
            "prior message {} is {:.1}h old, treating re-posting as new",
            existing.id, age_hours
        );
        return Classification::Unique;
    }

    let reason = duplicate_reason(text, strict_hash, sender_id, &existing, age_hours);
    info!("duplicate detected: hash {}...", hash_prefix(content_hash));
    info!("duplicate: original id {} from user {}", existing.id, existing.user_id);
    info!("duplicate: original text: {}", snippet(&existing.message_text, 50));
    info!("duplicate: new text: {}", snippet(text, 50));
    info!("duplicate: {}", reason);

    Classification::Duplicate { original: existing, reason }
}

/// Human-readable reason attached to a Duplicate classification. An exact
/// resubmission (same text, same sender, per the strict fingerprint) is
/// called out; otherwise the normalized edit-distance ratio is reported.
fn duplicate_reason(
    text: &str,
    strict_hash: &str,
    sender_id: &str,
    existing: &ExistingMessage,
    age_hours: f64,
) -> String {
    if existing.user_id == sender_id
        && hasher::strict_fingerprint(&existing.message_text, &existing.user_id) == strict_hash
    {
        return format!("exact resubmission by the same sender {:.1}h later", age_hours);
    }
    let ratio = normalized_levenshtein(text, &existing.message_text);
    format!("similar content ({:.0}% match) within the last {:.1}h", ratio * 100.0, age_hours)
}

/// Leading hash characters for log output. Hashes from the pipeline are
/// 64-char hex, but a shorter caller-supplied value must not panic here.
fn hash_prefix(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// First `max` characters of a message for log output.
fn snippet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}
