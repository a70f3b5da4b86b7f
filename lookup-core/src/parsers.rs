use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::scraper::Platform;

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@(\w+)").expect("mention pattern is valid"))
}

/// Every `@handle` token in `text`, in order of appearance.
pub fn extract_mentions(text: &str) -> Vec<String> {
    mention_pattern()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|handle| handle.as_str().to_string())
        .collect()
}

/// Whether `handle` can be a username on `platform`.
pub fn is_valid_handle(platform: Platform, handle: &str) -> bool {
    let ascii_word = handle
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ascii_word || handle.is_empty() {
        return false;
    }
    match platform {
        Platform::Telegram => {
            (5..=32).contains(&handle.len())
                && handle.starts_with(|c: char| c.is_ascii_alphabetic())
        }
        Platform::Twitter => handle.len() <= 15,
        Platform::Instagram => handle.len() <= 30,
        Platform::Facebook => handle.len() >= 5,
        Platform::Whatsapp => handle.chars().all(|c| c.is_ascii_digit()),
    }
}

/// Mentions worth following from a profile's own text: no self references
/// (compared case-insensitively), no duplicates, only valid handles.
pub fn mentions_to_follow(platform: Platform, own_handle: &str, text: &str) -> Vec<String> {
    let own = own_handle.to_lowercase();
    let mut seen = HashSet::new();
    extract_mentions(text)
        .into_iter()
        .filter(|handle| handle.to_lowercase() != own)
        .filter(|handle| is_valid_handle(platform, handle))
        .filter(|handle| seen.insert(handle.to_lowercase()))
        .collect()
}
