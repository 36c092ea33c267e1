//! Sequenced delivery of a container's blocks.
//!
//! For each block in order: pre-send delay, chat action matching the media
//! kind, cached-identifier send with re-resolution on expiry, `{pix}`
//! substitution, MarkdownV2 fallback (inside the client), and auto-delete
//! via a scheduled task — never a detached in-process timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{debug, info, warn};

use hive_clients::error::is_stale_file_id;
use hive_clients::{MediaPayload, TelegramClient};
use hive_core::config::PREVIEW_PIX_CODE;
use hive_core::metrics::Metrics;
use hive_core::Result;
use hive_queue::{TaskEnvelope, TaskQueue, QUEUE_SCHEDULER};
use hive_store::types::{Block, Container};
use hive_store::Store;

use crate::registry::BotRegistry;

/// Media files larger than this are not re-resolved (matches the upload cap
/// Telegram applies to bots).
const REUPLOAD_MAX_BYTES: u64 = 50 * 1024 * 1024;

pub struct BlockSender {
    store: Arc<Store>,
    queue: TaskQueue,
    registry: Arc<BotRegistry>,
    metrics: Arc<Metrics>,
}

/// Per-send behavior switches.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Substituted for `{pix}` placeholders. Preview mode overrides this.
    pub pix_code: Option<String>,
    /// Admin dry-run: no cache writes, `{pix}` renders as the preview
    /// placeholder, and no auto-delete tasks are scheduled.
    pub preview: bool,
    /// Skip per-block delays (used by debug commands).
    pub skip_delays: bool,
}

impl BlockSender {
    pub fn new(
        store: Arc<Store>,
        queue: TaskQueue,
        registry: Arc<BotRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<BotRegistry> {
        &self.registry
    }

    /// Send every block of `container` to `chat_id` through `bot_id`, in
    /// order. Returns the number of blocks sent.
    pub async fn send_container(
        &self,
        bot_id: i64,
        chat_id: i64,
        container: Container,
        opts: &SendOptions,
    ) -> Result<usize> {
        let blocks = self.store.list_blocks(container)?;
        if blocks.is_empty() {
            debug!(bot_id, chat_id, kind = container.kind.as_str(), container_id = container.id,
                   "container has no blocks");
            return Ok(0);
        }
        let client = self.registry.client_for(bot_id)?;

        let mut sent = 0;
        for block in &blocks {
            self.send_block(bot_id, chat_id, &client, block, opts).await?;
            sent += 1;
        }
        info!(bot_id, chat_id, kind = container.kind.as_str(), container_id = container.id,
              blocks = sent, "container delivered");
        Ok(sent)
    }

    /// Plain LLM output with no substitutions becomes a single text block.
    pub async fn send_plain_text(&self, bot_id: i64, chat_id: i64, text: &str) -> Result<()> {
        let client = self.registry.client_for(bot_id)?;
        client.send_text(chat_id, text).await?;
        self.metrics.blocks_sent.inc();
        Ok(())
    }

    async fn send_block(
        &self,
        bot_id: i64,
        chat_id: i64,
        client: &TelegramClient,
        block: &Block,
        opts: &SendOptions,
    ) -> Result<()> {
        if block.delay_secs > 0 && !opts.skip_delays {
            tokio::time::sleep(Duration::from_secs(block.delay_secs as u64)).await;
        }

        client.chat_action(chat_id, block.media_kind).await.ok();

        let text = block
            .text
            .as_deref()
            .map(|t| substitute_pix(t, opts))
            .unwrap_or_default();

        let message_ids = match (&block.media_ref, block.media_kind) {
            (Some(original_id), Some(kind)) => {
                let caption = if text.is_empty() { None } else { Some(text.as_str()) };
                let sent = self
                    .send_media_resilient(bot_id, chat_id, client, original_id, kind, caption, opts)
                    .await?;
                vec![sent]
            }
            _ => client.send_text(chat_id, &text).await?,
        };
        self.metrics.blocks_sent.inc();

        if block.auto_delete_secs > 0 && !opts.preview {
            for message_id in message_ids {
                self.schedule_auto_delete(bot_id, chat_id, message_id, block.auto_delete_secs)
                    .await?;
            }
        }
        Ok(())
    }

    /// Send media by cached identifier; on the "expired identifier" error
    /// class, invalidate the cache, stream the bytes from the origin bot,
    /// re-upload, and re-cache the fresh identifier.
    #[allow(clippy::too_many_arguments)]
    async fn send_media_resilient(
        &self,
        bot_id: i64,
        chat_id: i64,
        client: &TelegramClient,
        original_id: &str,
        kind: hive_core::types::MediaKind,
        caption: Option<&str>,
        opts: &SendOptions,
    ) -> Result<i32> {
        let cached = if opts.preview {
            None
        } else {
            self.store.media_cache_get(bot_id, original_id)?
        };
        let first_try = cached.clone().unwrap_or_else(|| original_id.to_string());

        match client
            .send_media(chat_id, kind, MediaPayload::FileId(first_try), caption)
            .await
        {
            Ok(sent) => {
                if !opts.preview {
                    if let Some(new_id) = sent.file_id {
                        self.store.media_cache_put(bot_id, original_id, &new_id)?;
                    }
                }
                Ok(sent.message_id)
            }
            Err(e) if is_stale_file_id(&e) => {
                warn!(bot_id, original_id, "media identifier expired, re-resolving");
                if cached.is_some() && !opts.preview {
                    self.store.media_cache_invalidate(bot_id, original_id)?;
                }
                let bytes = self
                    .registry
                    .manager()
                    .download(original_id, REUPLOAD_MAX_BYTES)
                    .await?;
                let sent = client
                    .send_media(
                        chat_id,
                        kind,
                        MediaPayload::Upload {
                            bytes,
                            file_name: format!("media.{}", extension_for(kind)),
                        },
                        caption,
                    )
                    .await?;
                if !opts.preview {
                    if let Some(new_id) = &sent.file_id {
                        self.store.media_cache_put(bot_id, original_id, new_id)?;
                    }
                }
                Ok(sent.message_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn schedule_auto_delete(
        &self,
        bot_id: i64,
        chat_id: i64,
        message_id: i32,
        delay_secs: u32,
    ) -> Result<()> {
        let task = TaskEnvelope::new(
            QUEUE_SCHEDULER,
            crate::delete::DELETE_MESSAGE_TASK,
            serde_json::json!({
                "bot_id": bot_id,
                "chat_id": chat_id,
                "message_id": message_id,
            }),
        );
        self.queue
            .schedule(task, ChronoDuration::seconds(delay_secs as i64))
            .await?;
        Ok(())
    }
}

/// Replace `{pix}` with the live code, or the preview placeholder in
/// preview mode (also when no code was provided).
pub fn substitute_pix(text: &str, opts: &SendOptions) -> String {
    if !text.contains("{pix}") {
        return text.to_string();
    }
    let code = if opts.preview {
        PREVIEW_PIX_CODE
    } else {
        opts.pix_code.as_deref().unwrap_or(PREVIEW_PIX_CODE)
    };
    text.replace("{pix}", code)
}

fn extension_for(kind: hive_core::types::MediaKind) -> &'static str {
    use hive_core::types::MediaKind;
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video => "mp4",
        MediaKind::Voice => "ogg",
        MediaKind::Document => "bin",
        MediaKind::Animation => "mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pix_substitution_with_live_code() {
        let opts = SendOptions {
            pix_code: Some("000201br.gov.bcb.pix123".into()),
            ..Default::default()
        };
        assert_eq!(
            substitute_pix("Pague aqui: {pix}", &opts),
            "Pague aqui: 000201br.gov.bcb.pix123"
        );
    }

    #[test]
    fn pix_substitution_in_preview_ignores_live_code() {
        let opts = SendOptions {
            pix_code: Some("real-code".into()),
            preview: true,
            ..Default::default()
        };
        assert_eq!(substitute_pix("{pix}", &opts), PREVIEW_PIX_CODE);
    }

    #[test]
    fn missing_code_falls_back_to_placeholder() {
        let opts = SendOptions::default();
        assert_eq!(substitute_pix("{pix}", &opts), PREVIEW_PIX_CODE);
    }

    #[test]
    fn text_without_placeholder_is_untouched() {
        let opts = SendOptions::default();
        assert_eq!(substitute_pix("sem código", &opts), "sem código");
    }
}
