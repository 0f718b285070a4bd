use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

static NOISE: OnceLock<Regex> = OnceLock::new();

fn noise_re() -> &'static Regex {
    // Digits, whitespace and punctuation all count as noise between words.
    NOISE.get_or_init(|| Regex::new(r"[\d\s\W]+").unwrap())
}

/// Strict fingerprint: identifies an exact resubmission by the same sender.
pub fn strict_fingerprint(text: &str, sender_id: &str) -> String {
    let content = format!("{}_{}", text.to_lowercase().trim(), sender_id);
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Normalized fingerprint: stable under changed numbers and punctuation,
/// so a re-posted offer with an updated price or tonnage hashes the same.
/// Not scoped to the sender.
pub fn normalized_fingerprint(text: &str) -> String {
    let lowered = text.to_lowercase();
    let cleaned = noise_re().replace_all(&lowered, " ");
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(collapsed.as_bytes()))
}
