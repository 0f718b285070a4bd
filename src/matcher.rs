use log::debug;

/// Check a message against the active keyword list.
///
/// Keywords are expected to be case-folded already (they are lowered when the
/// configuration snapshot is built). A keyword containing `;` is a compound
/// spec: every non-empty part must occur in the text. Matching is plain
/// substring containment, so "тон" also matches inside "тонна".
///
/// The result keeps the keyword list order and contains no duplicates.
pub fn match_keywords(text: &str, keywords: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    if text.is_empty() {
        return found;
    }
    let text_lower = text.to_lowercase();

    for keyword in keywords {
        if found.iter().any(|k| k == keyword) {
            continue;
        }
        if keyword.contains(';') {
            if compound_matches(keyword, &text_lower) {
                found.push(keyword.clone());
            }
        } else if text_lower.contains(keyword.as_str()) {
            found.push(keyword.clone());
        }
    }

    found
}

/// Evaluate a compound spec: split on `;`, trim, drop empty parts, require
/// every part to be present. A spec left with fewer than two parts (e.g. a
/// stray trailing `;`) is excluded from matching entirely.
fn compound_matches(keyword: &str, text_lower: &str) -> bool {
    let parts: Vec<&str> = keyword
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if parts.len() < 2 {
        debug!("keyword '{}' has fewer than two usable parts, skipping", keyword);
        return false;
    }

    parts.iter().all(|part| text_lower.contains(part))
}
