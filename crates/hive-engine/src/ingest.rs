//! Update routing off the `default` queue.
//!
//! Ingress validates the secret, de-duplicates, and enqueues the *raw*
//! Telegram update; this router does the real parsing and forwards text to
//! the `ai` queue and voice notes to the `audio` queue. Updates with
//! nothing to process (edits, joins, stickers) are dropped here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use hive_core::Result;
use hive_queue::{TaskEnvelope, TaskHandler, QUEUE_AUDIO};
use hive_store::types::TxKind;

use crate::audio::{AudioArgs, PROCESS_AUDIO_TASK};
use crate::pipeline::{enqueue_message, EngineCtx, MessageArgs};

pub const PROCESS_UPDATE_TASK: &str = "process-update";
pub const MANAGER_UPDATE_TASK: &str = "manager-update";

#[derive(Debug, Deserialize)]
struct UpdateArgs {
    bot_id: i64,
    update: TgUpdate,
}

/// The slice of a Telegram update this platform consumes.
#[derive(Debug, Deserialize)]
struct TgUpdate {
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    voice: Option<TgVoice>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgVoice {
    file_id: String,
    #[serde(default)]
    duration: u64,
}

pub struct UpdateRouterHandler {
    ctx: Arc<EngineCtx>,
}

impl UpdateRouterHandler {
    pub fn new(ctx: Arc<EngineCtx>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for UpdateRouterHandler {
    fn name(&self) -> &'static str {
        PROCESS_UPDATE_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: UpdateArgs = serde_json::from_value(task.args.clone())?;
        let Some(message) = args.update.message else {
            return Ok(());
        };
        let Some(from) = message.from else {
            return Ok(());
        };
        if from.is_bot {
            return Ok(());
        }

        if let Some(voice) = message.voice {
            let audio = AudioArgs {
                bot_id: args.bot_id,
                chat_id: message.chat.id,
                user_tg_id: from.id,
                file_id: voice.file_id,
                duration_secs: voice.duration,
            };
            let task = TaskEnvelope::new(
                QUEUE_AUDIO,
                PROCESS_AUDIO_TASK,
                serde_json::to_value(audio)?,
            );
            self.ctx.queue.enqueue(task).await?;
            return Ok(());
        }

        let text = message
            .text
            .or(message.caption)
            .unwrap_or_default();
        if text.trim().is_empty() {
            debug!(bot_id = args.bot_id, "update with no processable content");
            return Ok(());
        }

        enqueue_message(
            &self.ctx.queue,
            MessageArgs {
                bot_id: args.bot_id,
                chat_id: message.chat.id,
                user_tg_id: from.id,
                text,
            },
        )
        .await
    }
}

/// Manager-bot updates. The menu UI lives outside the core; what the core
/// owns here is the credit top-up flow (`/recarga <valor>`).
pub struct ManagerUpdateHandler {
    ctx: Arc<EngineCtx>,
}

impl ManagerUpdateHandler {
    pub fn new(ctx: Arc<EngineCtx>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for ManagerUpdateHandler {
    fn name(&self) -> &'static str {
        MANAGER_UPDATE_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        #[derive(Deserialize)]
        struct ManagerArgs {
            update: TgUpdate,
        }
        let args: ManagerArgs = serde_json::from_value(task.args.clone())?;

        if let Some(callback) = args.update.callback_query {
            return self.handle_callback(callback).await;
        }
        let Some(message) = args.update.message else {
            return Ok(());
        };
        let Some(from) = message.from else {
            return Ok(());
        };
        let text = message.text.unwrap_or_default();
        let manager = self.ctx.registry.manager();

        if let Some(raw) = text.trim().strip_prefix("/recarga") {
            match parse_topup_amount(raw) {
                Some(amount_cents) => {
                    let tx = self
                        .ctx
                        .payments
                        .create_charge(0, from.id, TxKind::Topup, amount_cents, None, None, None)
                        .await?;
                    info!(admin_id = from.id, amount_cents, tx_id = tx.id, "top-up charge issued");
                    manager
                        .send_text(
                            message.chat.id,
                            &format!(
                                "Recarga de R$ {},{:02} criada. Pague com o código PIX:\n\n{}",
                                amount_cents / 100,
                                amount_cents % 100,
                                tx.pix_code
                            ),
                        )
                        .await?;
                }
                None => {
                    manager
                        .send_text(
                            message.chat.id,
                            "⚠️ Valor inválido. Use: /recarga 50 ou /recarga 49,90",
                        )
                        .await?;
                }
            }
            return Ok(());
        }

        if text.trim() == "/saldo" {
            let balance = self.ctx.store.wallet_balance(from.id)?;
            manager
                .send_text(
                    message.chat.id,
                    &format!("Saldo atual: R$ {},{:02}", balance / 100, balance % 100),
                )
                .await?;
        }
        Ok(())
    }
}

impl ManagerUpdateHandler {
    /// Signed menu buttons. The token binds action + invoker + TTL; an
    /// expired or foreign token gets the standard notice and nothing else.
    async fn handle_callback(&self, callback: TgCallbackQuery) -> Result<()> {
        let ctx = &self.ctx;
        let Some(data) = callback.data else {
            return Ok(());
        };
        let chat_id = callback
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .unwrap_or(callback.from.id);
        let manager = ctx.registry.manager();

        let payload = match ctx.signer.verify(&data, callback.from.id, 600) {
            Ok(p) => p,
            Err(e) => {
                debug!(admin_id = callback.from.id, error = %e, "callback token rejected");
                manager
                    .send_text(chat_id, "⚠️ Essa ação não é válida mais.")
                    .await?;
                return Ok(());
            }
        };

        // Suppress rapid duplicate taps on the same action.
        if !ctx
            .limiter
            .cooldown(0, callback.from.id, &payload.action, 3)
            .await?
        {
            return Ok(());
        }

        match payload.action.as_str() {
            "preview_offer" => {
                let (Some(bot_id), Some(offer_id)) = (
                    payload.target.get("bot_id").and_then(|v| v.as_i64()),
                    payload.target.get("offer_id").and_then(|v| v.as_i64()),
                ) else {
                    return Ok(());
                };
                ctx.sender
                    .send_container(
                        bot_id,
                        chat_id,
                        hive_store::types::Container::new(
                            hive_store::types::ContainerKind::OfferPitch,
                            offer_id,
                        ),
                        &hive_blocks::SendOptions {
                            preview: true,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            "preview_start" => {
                let Some(bot_id) = payload.target.get("bot_id").and_then(|v| v.as_i64()) else {
                    return Ok(());
                };
                ctx.sender
                    .send_container(
                        bot_id,
                        chat_id,
                        hive_store::types::Container::new(
                            hive_store::types::ContainerKind::Start,
                            bot_id,
                        ),
                        &hive_blocks::SendOptions {
                            preview: true,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            other => {
                debug!(action = other, "unhandled callback action");
            }
        }
        Ok(())
    }
}

fn parse_topup_amount(raw: &str) -> Option<i64> {
    let s = raw.trim().replace(',', ".");
    if s.is_empty() {
        return None;
    }
    let value: f64 = s.parse().ok()?;
    let cents = (value * 100.0).round() as i64;
    (cents > 0 && cents <= 100_000_00).then_some(cents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topup_amount_forms() {
        assert_eq!(parse_topup_amount(" 50"), Some(50_00));
        assert_eq!(parse_topup_amount(" 49,90"), Some(49_90));
        assert_eq!(parse_topup_amount(" 49.9"), Some(49_90));
        assert_eq!(parse_topup_amount(""), None);
        assert_eq!(parse_topup_amount(" zero"), None);
        assert_eq!(parse_topup_amount(" -5"), None);
    }

    #[test]
    fn update_parsing_extracts_voice() {
        let raw = serde_json::json!({
            "update_id": 1001,
            "message": {
                "message_id": 7,
                "from": {"id": 111, "is_bot": false},
                "chat": {"id": 111, "type": "private"},
                "voice": {"file_id": "voice-abc", "duration": 12}
            }
        });
        let update: TgUpdate = serde_json::from_value(raw).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.voice.unwrap().file_id, "voice-abc");
        assert_eq!(msg.from.unwrap().id, 111);
    }

    #[test]
    fn update_parsing_tolerates_unknown_fields() {
        let raw = serde_json::json!({
            "update_id": 1002,
            "message": {
                "message_id": 8,
                "from": {"id": 5, "is_bot": false, "language_code": "pt-br"},
                "chat": {"id": 5, "type": "private", "first_name": "Ana"},
                "text": "quero premium",
                "entities": []
            }
        });
        let update: TgUpdate = serde_json::from_value(raw).unwrap();
        assert_eq!(update.message.unwrap().text.as_deref(), Some("quero premium"));
    }
}
