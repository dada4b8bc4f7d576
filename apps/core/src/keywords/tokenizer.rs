//! Mixed-script tokenizer.
//!
//! Latin text is split on whitespace; CJK ideographs carry no word
//! boundaries, so any whitespace segment containing one is decomposed
//! character by character while Latin/digit/hyphen runs stay whole.

use std::collections::HashSet;

/// Returns `true` for CJK unified ideographs (basic block, extension A and
/// compatibility ideographs).
pub fn is_cjk_ideograph(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

/// Lower-cases the text and replaces every character that is not a word
/// character, CJK ideograph, whitespace or hyphen with a space.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c.is_whitespace() || is_cjk_ideograph(c) {
                c
            } else {
                ' '
            }
        })
        .collect()
}

/// Splits normalized text into raw tokens, before any filtering.
pub fn segment(normalized: &str) -> Vec<String> {
    let mut tokens = Vec::new();

    for part in normalized.split_whitespace() {
        if !part.chars().any(is_cjk_ideograph) {
            tokens.push(part.to_string());
            continue;
        }

        let mut run = String::new();
        for c in part.chars() {
            if is_cjk_ideograph(c) {
                if !run.is_empty() {
                    tokens.push(std::mem::take(&mut run));
                }
                tokens.push(c.to_string());
            } else {
                run.push(c);
            }
        }
        if !run.is_empty() {
            tokens.push(run);
        }
    }

    tokens
}

/// Decides whether a raw token survives the length, stopword and numeric filters.
pub fn keep_token(token: &str, stopwords: &HashSet<String>, min_word_length: usize) -> bool {
    let mut chars = token.chars();
    let (first, len) = match chars.next() {
        Some(c) => (c, 1 + chars.count()),
        None => return false,
    };

    let single_cjk = len == 1 && is_cjk_ideograph(first);
    if len == 1 && !single_cjk {
        return false;
    }
    if len < min_word_length && !single_cjk {
        return false;
    }
    if stopwords.contains(token) {
        return false;
    }
    !token.chars().all(|c| c.is_numeric())
}

/// Tokenizes and filters one document.
pub fn tokenize(text: &str, stopwords: &HashSet<String>, min_word_length: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    segment(&normalize(text))
        .into_iter()
        .filter(|token| keep_token(token, stopwords, min_word_length))
        .collect()
}
