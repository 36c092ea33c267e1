//! Telegram Bot API client.
//!
//! One instance per bot token (`Bot::new` is cheap); webhooks deliver the
//! inbound side, so this wrapper only makes outbound calls. Long texts are
//! chunked below the 4096-char API limit; MarkdownV2 is tried first with a
//! plain-text retry when Telegram rejects the entities.

use std::sync::Arc;
use std::time::Duration;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, MessageId, ParseMode};
use tracing::{debug, warn};

use hive_core::config::TELEGRAM_TIMEOUT_SECS;
use hive_core::types::MediaKind;
use hive_core::{HiveError, Result};

use crate::breaker::CircuitBreaker;
use crate::error::classify_telegram;

/// Max characters per message; the API limit is 4096, kept under for safety.
const CHUNK_MAX: usize = 4090;

pub struct TelegramClient {
    bot: Bot,
    breaker: Arc<CircuitBreaker>,
}

/// Media source for a send: a (possibly cached) identifier, or raw bytes
/// re-uploaded after an identifier expired.
#[derive(Debug, Clone)]
pub enum MediaPayload {
    FileId(String),
    Upload { bytes: Vec<u8>, file_name: String },
}

#[derive(Debug, Clone)]
pub struct SentMedia {
    pub message_id: i32,
    /// Identifier Telegram assigned on this bot; cache it for the next send.
    pub file_id: Option<String>,
}

impl TelegramClient {
    pub fn new(token: &str, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            bot: Bot::new(token),
            breaker,
        }
    }

    async fn call<T, F>(&self, req: F) -> Result<T>
    where
        F: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
    {
        let fut = req.into_future();
        self.breaker
            .guard(async {
                match tokio::time::timeout(Duration::from_secs(TELEGRAM_TIMEOUT_SECS), fut).await {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(e)) => Err(classify_telegram(e)),
                    Err(_) => Err(HiveError::Timeout {
                        ms: TELEGRAM_TIMEOUT_SECS * 1000,
                    }),
                }
            })
            .await
    }

    /// Send `text` in order-preserving chunks. MarkdownV2 first; on a parse
    /// rejection the chunk is retried once as plain text. Returns the ids of
    /// every message sent.
    pub async fn send_text(&self, chat_id: i64, text: &str) -> Result<Vec<i32>> {
        let chat = ChatId(chat_id);
        let mut ids = Vec::new();
        let chunks = split_message(text);
        let total = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let sent = self
                .call(
                    self.bot
                        .send_message(chat, &chunk)
                        .parse_mode(ParseMode::MarkdownV2),
                )
                .await;
            let msg = match sent {
                Ok(m) => m,
                Err(e) if matches!(e, HiveError::PermanentExternal { .. }) => {
                    debug!(chat_id, error = %e, "MarkdownV2 rejected, retrying plain");
                    self.call(self.bot.send_message(chat, &chunk)).await?
                }
                Err(e) => return Err(e),
            };
            ids.push(msg.id.0);
            if i + 1 < total {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(ids)
    }

    /// Send one media block. The returned `file_id` (when present) is the
    /// identifier valid on *this* bot.
    pub async fn send_media(
        &self,
        chat_id: i64,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<&str>,
    ) -> Result<SentMedia> {
        let chat = ChatId(chat_id);
        let input = match payload {
            MediaPayload::FileId(id) => InputFile::file_id(id),
            MediaPayload::Upload { bytes, file_name } => {
                InputFile::memory(bytes).file_name(file_name)
            }
        };

        let msg = match kind {
            MediaKind::Photo => {
                let mut req = self.bot.send_photo(chat, input);
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                self.call(req).await?
            }
            MediaKind::Video => {
                let mut req = self.bot.send_video(chat, input);
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                self.call(req).await?
            }
            MediaKind::Voice => {
                let mut req = self.bot.send_voice(chat, input);
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                self.call(req).await?
            }
            MediaKind::Document => {
                let mut req = self.bot.send_document(chat, input);
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                self.call(req).await?
            }
            MediaKind::Animation => {
                let mut req = self.bot.send_animation(chat, input);
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                self.call(req).await?
            }
        };

        Ok(SentMedia {
            message_id: msg.id.0,
            file_id: extract_file_id(&msg, kind),
        })
    }

    /// Emit the chat action matching what is about to be sent.
    pub async fn chat_action(&self, chat_id: i64, kind: Option<MediaKind>) -> Result<()> {
        let action = match kind {
            None => ChatAction::Typing,
            Some(MediaKind::Photo) => ChatAction::UploadPhoto,
            Some(MediaKind::Video) | Some(MediaKind::Animation) => ChatAction::UploadVideo,
            Some(MediaKind::Voice) => ChatAction::RecordVoice,
            Some(MediaKind::Document) => ChatAction::UploadDocument,
        };
        self.call(self.bot.send_chat_action(ChatId(chat_id), action))
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.call(self.bot.delete_message(ChatId(chat_id), MessageId(message_id)))
            .await?;
        Ok(())
    }

    /// Register this bot's webhook with its per-bot secret header value.
    pub async fn set_webhook(&self, url: &str, secret: &str) -> Result<()> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| HiveError::Validation(format!("bad webhook url: {e}")))?;
        self.call(self.bot.set_webhook(parsed).secret_token(secret.to_string()))
            .await?;
        Ok(())
    }

    pub async fn get_me_username(&self) -> Result<String> {
        let me = self.call(self.bot.get_me()).await?;
        Ok(me.user.username.clone().unwrap_or_default())
    }

    pub async fn get_chat_title(&self, chat_id: i64) -> Result<Option<String>> {
        let chat = self.call(self.bot.get_chat(ChatId(chat_id))).await?;
        Ok(chat.title().map(|t| t.to_string()))
    }

    /// Fetch a file's bytes via `getFile` + download. Used for voice notes
    /// and for media-identifier re-resolution.
    pub async fn download(&self, file_id: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let file = self.call(self.bot.get_file(file_id.to_string())).await?;
        if u64::from(file.size) > max_bytes {
            return Err(HiveError::Validation(format!(
                "file {file_id} is {} bytes, limit {max_bytes}",
                file.size
            )));
        }
        let mut buf: Vec<u8> = Vec::new();
        let downloaded = self
            .breaker
            .guard(async {
                match tokio::time::timeout(
                    Duration::from_secs(TELEGRAM_TIMEOUT_SECS),
                    self.bot.download_file(&file.path, &mut buf),
                )
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(HiveError::TransientExternal {
                        service: "telegram".to_string(),
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(HiveError::Timeout {
                        ms: TELEGRAM_TIMEOUT_SECS * 1000,
                    }),
                }
            })
            .await;
        if let Err(e) = downloaded {
            warn!(file_id, error = %e, "media download failed");
            return Err(e);
        }
        Ok(buf)
    }
}

fn extract_file_id(msg: &Message, kind: MediaKind) -> Option<String> {
    match kind {
        MediaKind::Photo => msg.photo().and_then(|p| p.last()).map(|p| p.file.id.clone()),
        MediaKind::Video => msg.video().map(|v| v.file.id.clone()),
        MediaKind::Voice => msg.voice().map(|v| v.file.id.clone()),
        MediaKind::Document => msg.document().map(|d| d.file.id.clone()),
        MediaKind::Animation => msg.animation().map(|a| a.file.id.clone()),
    }
}

/// Split on line boundaries below the chunk limit; a single oversized line
/// is force-split at the last space before the limit.
pub fn split_message(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        let extra = if current.is_empty() { line.len() } else { line.len() + 1 };
        if !current.is_empty() && current.len() + extra > CHUNK_MAX {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let mut out = Vec::new();
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            out.push(chunk);
            continue;
        }
        let mut rest = chunk.as_str();
        while rest.len() > CHUNK_MAX {
            let mut cut = CHUNK_MAX;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            let split_at = rest[..cut].rfind(' ').unwrap_or(cut);
            out.push(rest[..split_at].to_string());
            rest = rest[split_at..].trim_start();
        }
        if !rest.is_empty() {
            out.push(rest.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("oi"), vec!["oi"]);
    }

    #[test]
    fn splits_on_newlines_under_limit() {
        let line = "x".repeat(3000);
        let text = format!("{line}\n{line}");
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_MAX));
    }

    #[test]
    fn force_splits_one_giant_line() {
        let words: Vec<String> = (0..2000).map(|i| format!("palavra{i}")).collect();
        let text = words.join(" ");
        let chunks = split_message(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_MAX));
        // No word is torn apart.
        assert!(chunks.iter().all(|c| !c.starts_with(' ') && !c.ends_with(' ')));
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_char() {
        let text = "ç".repeat(CHUNK_MAX);
        let chunks = split_message(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
            assert!(std::str::from_utf8(c.as_bytes()).is_ok());
        }
    }
}
