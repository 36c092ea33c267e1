//! Voice-note handling on the `audio` queue.
//!
//! Ingress routes voice messages here with the Telegram file id and the
//! duration Telegram reports. The handler enforces the duration/size caps,
//! downloads the bytes through the receiving bot, transcribes via Whisper,
//! debits the per-minute rate, and feeds the text back into the message
//! pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hive_core::Result;
use hive_queue::{TaskEnvelope, TaskHandler};

use crate::pipeline::{enqueue_message, EngineCtx, MessageArgs};

pub const PROCESS_AUDIO_TASK: &str = "process-audio";

#[derive(Debug, Serialize, Deserialize)]
pub struct AudioArgs {
    pub bot_id: i64,
    pub chat_id: i64,
    pub user_tg_id: i64,
    pub file_id: String,
    pub duration_secs: u64,
}

pub struct ProcessAudioHandler {
    ctx: Arc<EngineCtx>,
}

impl ProcessAudioHandler {
    pub fn new(ctx: Arc<EngineCtx>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for ProcessAudioHandler {
    fn name(&self) -> &'static str {
        PROCESS_AUDIO_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let ctx = &self.ctx;
        let args: AudioArgs = serde_json::from_value(task.args.clone())?;

        let whisper_cfg = &ctx.config.whisper;
        if args.duration_secs > whisper_cfg.audio_max_duration {
            debug!(bot_id = args.bot_id, duration = args.duration_secs,
                   "voice note over duration cap, dropped");
            return Ok(());
        }

        let bot = match ctx.store.get_bot(args.bot_id)? {
            Some(b) if b.is_active => b,
            _ => return Ok(()),
        };

        let client = ctx.registry.client_for(args.bot_id)?;
        let max_bytes = whisper_cfg.audio_max_size_mb * 1024 * 1024;
        let bytes = client.download(&args.file_id, max_bytes).await?;

        ctx.metrics.whisper_calls.inc();
        let text = ctx.whisper.transcribe(bytes, args.duration_secs).await?;
        info!(bot_id = args.bot_id, user_tg_id = args.user_tg_id,
              duration = args.duration_secs, chars = text.len(), "voice note transcribed");

        ctx.credits.debit_audio(
            bot.owner_admin_id,
            args.duration_secs,
            &format!("audio:{}:{}", args.bot_id, args.user_tg_id),
        )?;

        if text.trim().is_empty() {
            return Ok(());
        }
        enqueue_message(
            &ctx.queue,
            MessageArgs {
                bot_id: args.bot_id,
                chat_id: args.chat_id,
                user_tg_id: args.user_tg_id,
                text,
            },
        )
        .await
    }
}
