//! Token estimation.
//!
//! A tokenizer-free estimate close enough for billing and context trimming:
//! roughly four ASCII characters per token, one token per non-ASCII
//! character, plus the per-message framing overhead chat models charge.

use super::ChatMessage;

/// Tokens added to every completion for the assistant reply priming.
const REPLY_PRIMING_TOKENS: usize = 3;

/// Context windows by model prefix. Longer prefixes must come first.
const CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gpt-3.5-turbo-16k", 16_385),
    ("gpt-3.5-turbo", 4_096),
    ("gpt-4-32k", 32_768),
    ("gpt-4-turbo", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4", 8_192),
    ("claude", 200_000),
];

const DEFAULT_CONTEXT_WINDOW: usize = 4_096;

/// Context window for `model`, in tokens.
pub fn context_window(model: &str) -> usize {
    CONTEXT_WINDOWS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

fn per_message_overhead(model: &str) -> usize {
    if model.starts_with("gpt-3.5-turbo-0301") {
        4
    } else {
        3
    }
}

/// Estimate tokens in a piece of text.
pub fn estimate_text(text: &str) -> usize {
    let mut tokens = 0;
    let mut ascii_run = 0usize;
    for ch in text.chars() {
        if ch.is_ascii() {
            ascii_run += 1;
        } else {
            tokens += ascii_run.div_ceil(4) + 1;
            ascii_run = 0;
        }
    }
    tokens + ascii_run.div_ceil(4)
}

/// Estimate tokens for a conversation sent to `model`.
pub fn count_messages(messages: &[ChatMessage], model: &str) -> usize {
    let overhead = per_message_overhead(model);
    messages
        .iter()
        .map(|m| overhead + estimate_text(&m.role) + estimate_text(&m.content))
        .sum::<usize>()
        + REPLY_PRIMING_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_text_is_about_four_chars_per_token() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
        assert_eq!(estimate_text(&"a".repeat(400)), 100);
    }

    #[test]
    fn non_ascii_counts_per_char() {
        assert_eq!(estimate_text("你好"), 2);
        assert_eq!(estimate_text("hi 你好"), 3);
    }

    #[test]
    fn message_overhead_applies() {
        let messages = vec![ChatMessage::user("abcd")];
        // 3 overhead + 1 role + 1 content + 3 priming
        assert_eq!(count_messages(&messages, "gpt-4"), 8);
        assert_eq!(count_messages(&messages, "gpt-3.5-turbo-0301"), 9);
        assert_eq!(count_messages(&[], "gpt-4"), REPLY_PRIMING_TOKENS);
    }

    #[test]
    fn context_window_prefers_longest_prefix() {
        assert_eq!(context_window("gpt-4-32k-0613"), 32_768);
        assert_eq!(context_window("gpt-4-0613"), 8_192);
        assert_eq!(context_window("gpt-4o-mini"), 128_000);
        assert_eq!(context_window("gpt-3.5-turbo-16k"), 16_385);
        assert_eq!(context_window("mystery"), DEFAULT_CONTEXT_WINDOW);
    }
}
