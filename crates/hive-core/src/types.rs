use serde::{Deserialize, Serialize};

pub type BotId = i64;
pub type AdminId = i64;
/// Telegram user id (also the private chat id for DM bots).
pub type TgUserId = i64;
pub type ChatId = i64;

/// Media kinds a content block may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Voice,
    Document,
    Animation,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
            MediaKind::Animation => "animation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            "voice" => Some(MediaKind::Voice),
            "document" => Some(MediaKind::Document),
            "animation" => Some(MediaKind::Animation),
            _ => None,
        }
    }
}

/// Correlation id attached to every task log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_roundtrip() {
        for kind in [
            MediaKind::Photo,
            MediaKind::Video,
            MediaKind::Voice,
            MediaKind::Document,
            MediaKind::Animation,
        ] {
            assert_eq!(MediaKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::parse("sticker"), None);
    }
}
