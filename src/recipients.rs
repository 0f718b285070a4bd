use log::{error, info};
use std::collections::HashSet;

use crate::store::{RecipientRow, Store};

/// Map matched keywords to the recipients subscribed to their categories.
///
/// The keyword table is matched by case-sensitive equality on lookup, so the
/// resolver compensates by trying several casings of each matched keyword.
/// A failed lookup for one keyword or category is logged and skipped; it
/// never aborts resolution for the rest. Recipients are deduplicated by
/// contact identity (phone if present, else handle).
pub async fn resolve<S: Store + ?Sized>(
    store: &S,
    matched_keywords: &[String],
) -> Vec<RecipientRow> {
    // 1. Collect the categories the matched keywords belong to.
    let mut categories: Vec<String> = Vec::new();
    for keyword in matched_keywords {
        for variant in casing_variants(keyword) {
            match store.keyword_category(&variant).await {
                Ok(Some(category)) => {
                    if !categories.contains(&category) {
                        info!("keyword '{}' maps to category '{}'", keyword, category);
                        categories.push(category);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("category lookup for '{}' failed: {}", variant, e);
                }
            }
        }
    }

    // 2. Fetch every active recipient of every category found.
    let mut recipients: Vec<RecipientRow> = Vec::new();
    for category in &categories {
        match store.recipients_for_category(category).await {
            Ok(rows) => recipients.extend(rows),
            Err(e) => {
                error!("recipient lookup for category '{}' failed: {}", category, e);
            }
        }
    }

    // 3. Deduplicate by contact identity, keeping first appearance.
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::new();
    for recipient in recipients {
        let identity = match recipient.contact_identity() {
            Some(id) => id.to_string(),
            None => {
                error!("recipient '{}' has no phone or handle, skipping", recipient.display_name());
                continue;
            }
        };
        if seen.insert(identity) {
            unique.push(recipient);
        }
    }

    info!(
        "resolved {} recipient(s) for keywords {:?}",
        unique.len(),
        matched_keywords
    );
    unique
}

/// Casings tried against the store: original, lower, UPPER, Capitalized.
fn casing_variants(keyword: &str) -> Vec<String> {
    let mut variants = vec![
        keyword.to_string(),
        keyword.to_lowercase(),
        keyword.to_uppercase(),
        capitalize(keyword),
    ];
    let mut seen = HashSet::new();
    variants.retain(|v| seen.insert(v.clone()));
    variants
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
