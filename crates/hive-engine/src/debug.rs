//! Owner debug commands, checked before the LLM round.
//!
//! `/venda_aprovada` simulates the gateway confirming the latest open
//! transaction; `/debug_help` lists what is available; a verbatim offer or
//! action name previews its block sequence (no cache writes, placeholder
//! PIX, no ledger effect).

use chrono::{Duration, Utc};
use tracing::info;

use hive_blocks::SendOptions;
use hive_core::Result;
use hive_store::types::{Bot, Container, ContainerKind, TxStatus};

use crate::pipeline::{EngineCtx, MessageArgs};

const DEBUG_WINDOW_MIN: i64 = 15;

/// Returns true when the message was a debug command and the pipeline
/// should stop here.
pub async fn handle_debug_command(ctx: &EngineCtx, bot: &Bot, args: &MessageArgs) -> Result<bool> {
    let command = args.text.trim_start_matches('/').trim();

    if command.eq_ignore_ascii_case("venda_aprovada") {
        let recent = ctx.store.recent_open_transaction(
            args.bot_id,
            args.user_tg_id,
            Duration::minutes(DEBUG_WINDOW_MIN),
            Utc::now(),
        )?;
        match recent {
            Some(tx) if !tx.status.is_terminal() => {
                if tx.status != TxStatus::Paid {
                    ctx.store
                        .transition_transaction(tx.id, tx.status, TxStatus::Paid)?;
                }
                hive_payments::transactions::enqueue_sale_approved(&ctx.queue, tx.id).await?;
                info!(tx_id = tx.id, bot_id = bot.id, "debug sale approval forced");
                ctx.sender
                    .send_plain_text(args.bot_id, args.chat_id, "✅ venda aprovada (debug)")
                    .await?;
            }
            _ => {
                ctx.sender
                    .send_plain_text(
                        args.bot_id,
                        args.chat_id,
                        "Nenhuma transação aberta nos últimos 15 minutos.",
                    )
                    .await?;
            }
        }
        return Ok(true);
    }

    if command.eq_ignore_ascii_case("debug_help") {
        let mut lines = vec![
            "/venda_aprovada — aprova a última transação aberta".to_string(),
            "/debug_help — esta lista".to_string(),
        ];
        for offer in ctx.store.list_active_offers(args.bot_id)? {
            lines.push(format!("/{} — preview do pitch", offer.name));
        }
        for action in ctx.store.list_actions(args.bot_id)? {
            lines.push(format!("/{} — preview da ação", action.name));
        }
        ctx.sender
            .send_plain_text(args.bot_id, args.chat_id, &lines.join("\n"))
            .await?;
        return Ok(true);
    }

    // Verbatim offer name → preview its pitch.
    for offer in ctx.store.list_active_offers(args.bot_id)? {
        if command.eq_ignore_ascii_case(&offer.name) {
            ctx.sender
                .send_container(
                    args.bot_id,
                    args.chat_id,
                    Container::new(ContainerKind::OfferPitch, offer.id),
                    &SendOptions {
                        preview: true,
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(true);
        }
    }

    // Verbatim action name → preview its blocks.
    for action in ctx.store.list_actions(args.bot_id)? {
        if command.eq_ignore_ascii_case(&action.name) {
            ctx.sender
                .send_container(
                    args.bot_id,
                    args.chat_id,
                    Container::new(ContainerKind::Action, action.id),
                    &SendOptions {
                        preview: true,
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(true);
        }
    }

    Ok(false)
}
