//! Secret redaction for log output.
//!
//! Two shapes are masked: the Telegram bot-token format (`12345678:AA...`)
//! and any long base64url run, which covers callback tokens, encrypted
//! blobs, and most API keys.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static BOT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{8,10}:[A-Za-z0-9_-]{30,}").expect("bot token regex"));

static LONG_B64: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9_-]{40,}\b").expect("base64url regex"));

pub const MASK: &str = "[redacted]";

/// Mask token-like substrings. Returns the input untouched when clean.
pub fn redact(input: &str) -> Cow<'_, str> {
    if !BOT_TOKEN.is_match(input) && !LONG_B64.is_match(input) {
        return Cow::Borrowed(input);
    }
    let pass1 = BOT_TOKEN.replace_all(input, MASK);
    match LONG_B64.replace_all(&pass1, MASK) {
        Cow::Borrowed(_) => Cow::Owned(pass1.into_owned()),
        Cow::Owned(s) => Cow::Owned(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_bot_token_shape() {
        let line = "registering bot with token 1234567890:AAEhBOweik6ad9r_QXMENQjcrGbqCr4KpM";
        let out = redact(line);
        assert!(!out.contains("AAEhBOweik6ad9r"));
        assert!(out.contains(MASK));
    }

    #[test]
    fn masks_long_base64url_runs() {
        let line = format!("callback token {}", "a".repeat(48));
        let out = redact(&line);
        assert!(out.contains(MASK));
        assert!(!out.contains(&"a".repeat(48)));
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        let line = "user 111 on bot 42 sent a message";
        assert_eq!(redact(line), line);
    }

    #[test]
    fn short_ids_survive() {
        let line = "tracker code abc12345 attributed";
        assert_eq!(redact(line), line);
    }
}
