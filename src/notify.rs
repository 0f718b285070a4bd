use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::telegram::IncomingMessage;

static PHONE_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Number formats seen in cargo postings: Russian +7/8 spellings first,
/// then generic international and dashed forms.
fn phone_patterns() -> &'static [Regex] {
    PHONE_PATTERNS.get_or_init(|| {
        [
            r"\+7\s?\d{3}\s?\d{3}\s?\d{2}\s?\d{2}",
            r"\+7\d{10}",
            r"8\s?\d{3}\s?\d{3}\s?\d{2}\s?\d{2}",
            r"8\d{10}",
            r"\+\d{1,3}\s?\d{7,15}",
            r"\d{3}[-\s]?\d{3}[-\s]?\d{4}",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Pull phone numbers out of a message text, first appearance order,
/// duplicates removed.
pub fn extract_phone_numbers(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut numbers = Vec::new();
    for pattern in phone_patterns() {
        for found in pattern.find_iter(text) {
            let number = found.as_str().to_string();
            if seen.insert(number.clone()) {
                numbers.push(number);
            }
        }
    }
    numbers
}

/// Normalize a raw phone for a tel: link. "8 999 ..." becomes "+7999...".
pub fn format_phone_for_link(phone: &str) -> String {
    let mut clean: String = phone.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    if clean.starts_with('8') && clean.len() == 11 {
        clean = format!("+7{}", &clean[1..]);
    }
    if !clean.starts_with('+') {
        clean = format!("+{}", clean);
    }
    clean
}

/// Build the notification sent to each resolved recipient: chat, sender
/// (linked when a username exists), matched keywords, any phone numbers
/// found in the text, the original text and a timestamp.
pub fn render(message: &IncomingMessage, matched_keywords: &[String]) -> String {
    let sender_text = match &message.sender_username {
        Some(username) => format!(
            "[{}](https://t.me/{})",
            message.sender_display_name, username
        ),
        None => message.sender_display_name.clone(),
    };

    let phones = extract_phone_numbers(&message.text);
    let phone_text = if phones.is_empty() {
        String::new()
    } else {
        let links: Vec<String> = phones
            .iter()
            .map(|p| format!("[{}](tel:{})", p, format_phone_for_link(p)))
            .collect();
        format!("\n📞 Номера: {}", links.join(", "))
    };

    format!(
        "🔔 **НОВОЕ СООБЩЕНИЕ ПО КЛЮЧЕВЫМ СЛОВАМ**\n\n\
         **Чат:** {}\n\
         **От:** {}\n\
         **Ключевые слова:** {}{}\n\n\
         **Текст сообщения:**\n```\n{}\n```\n\n\
         ---\n\
         ⏰ **Время:** {}",
        message.chat_name,
        sender_text,
        matched_keywords.join(", "),
        phone_text,
        message.text,
        message.received_at.format("%Y-%m-%d %H:%M:%S"),
    )
}
