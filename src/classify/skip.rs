//! Deterministic pre-checks that classify a message without an LLM call.
//!
//! A skipped message is always `{fan, ignore, no reply}` with confidence 1.0.

use std::sync::OnceLock;

use regex::Regex;

/// Why a message bypassed the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Content is emoji and whitespace only
    EmojiOnly,
    /// Fewer than 3 words AND under 15 characters
    TooShort,
    /// One of the common short acknowledgments ("ok", "valeu", "obrigado"…)
    CommonResponse,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmojiOnly => "emoji_only",
            Self::TooShort => "too_short",
            Self::CommonResponse => "common_response",
        }
    }
}

fn emoji_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[\p{Emoji}\p{Emoji_Modifier}\p{Emoji_Component}\p{Emoji_Modifier_Base}\p{Emoji_Presentation}\s]+$",
        )
        .unwrap()
    })
}

fn common_response_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(ok|sim|não|nao|obrigado|obrigada|valeu|vlw|tmj|top|show|boa|blz|kk+|haha+|rs+|legal|massa|dahora|brigado|brigada|❤️|👍|🙏|😊|🔥|💯)$",
        )
        .unwrap()
    })
}

/// Decide whether `content` should skip LLM classification.
pub fn should_skip(content: &str) -> Option<SkipReason> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Some(SkipReason::TooShort);
    }

    if emoji_only_re().is_match(trimmed) {
        return Some(SkipReason::EmojiOnly);
    }

    // Checked before the length test — most common responses are also
    // short, and the more specific reason wins.
    if common_response_re().is_match(trimmed) {
        return Some(SkipReason::CommonResponse);
    }

    let word_count = trimmed.split_whitespace().count();
    if word_count < 3 && trimmed.chars().count() < 15 {
        return Some(SkipReason::TooShort);
    }

    None
}
