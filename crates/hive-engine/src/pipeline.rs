//! The per-message conversation pipeline.
//!
//! One task per inbound user message, running on the `ai` queue. Stages are
//! numbered to match the platform's processing contract; every early return
//! is deliberate and silent toward the end user.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hive_blocks::{BlockSender, BotRegistry, SendOptions};
use hive_clients::{ChatMessage, LlmClient, WhisperClient};
use hive_core::config::HiveConfig;
use hive_core::crypto::CallbackSigner;
use hive_core::metrics::Metrics;
use hive_core::{HiveError, Result};
use hive_kv::{Kv, RateLimiter};
use hive_payments::{CreditService, DeliverUpsellHandler, PaymentService};
use hive_queue::{TaskEnvelope, TaskHandler, TaskQueue, QUEUE_AI};
use hive_scheduler::schedule_inactivity_check;
use hive_store::types::{
    ActionState, Bot, Container, ContainerKind, HistoryTurn, Offer, TxKind, TxStatus,
};
use hive_store::Store;

use crate::start::{handle_start, parse_start_payload, StartOutcome};
use crate::triggers::{
    contains_term, find_discount_amount, first_match, substitution_policy, Substitution,
};

pub const PROCESS_MESSAGE_TASK: &str = "process-message";

/// Window the manual-verification trigger searches for an open transaction.
const MANUAL_VERIFICATION_WINDOW_MIN: i64 = 15;

/// Everything the pipeline stages need. Built once at startup and shared.
pub struct EngineCtx {
    pub store: Arc<Store>,
    pub kv: Arc<Kv>,
    pub limiter: Arc<RateLimiter>,
    pub queue: TaskQueue,
    pub llm: Arc<LlmClient>,
    pub whisper: Arc<WhisperClient>,
    pub credits: Arc<CreditService>,
    pub sender: Arc<BlockSender>,
    pub registry: Arc<BotRegistry>,
    pub payments: Arc<PaymentService>,
    pub upsells: Arc<DeliverUpsellHandler>,
    pub signer: Arc<CallbackSigner>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<HiveConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageArgs {
    pub bot_id: i64,
    pub chat_id: i64,
    pub user_tg_id: i64,
    pub text: String,
}

/// Enqueue a message for the pipeline (used by ingress and by the audio
/// handler after transcription).
pub async fn enqueue_message(queue: &TaskQueue, args: MessageArgs) -> Result<()> {
    let task = TaskEnvelope::new(QUEUE_AI, PROCESS_MESSAGE_TASK, serde_json::to_value(args)?);
    queue.enqueue(task).await?;
    Ok(())
}

pub struct ProcessMessageHandler {
    ctx: Arc<EngineCtx>,
}

impl ProcessMessageHandler {
    pub fn new(ctx: Arc<EngineCtx>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for ProcessMessageHandler {
    fn name(&self) -> &'static str {
        PROCESS_MESSAGE_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: MessageArgs = serde_json::from_value(task.args.clone())?;
        process_message(&self.ctx, &args).await
    }
}

pub async fn process_message(ctx: &EngineCtx, args: &MessageArgs) -> Result<()> {
    let bot = ctx
        .store
        .get_bot(args.bot_id)?
        .ok_or_else(|| HiveError::Validation(format!("unknown bot {}", args.bot_id)))?;
    if !bot.is_active {
        return Ok(());
    }
    ctx.metrics.messages_processed.inc();

    // 1. Attribution and start-template flow.
    if let Some(payload) = parse_start_payload(&args.text) {
        match handle_start(ctx, args.bot_id, args.user_tg_id, payload).await? {
            StartOutcome::Dropped | StartOutcome::TemplateSent => return Ok(()),
            StartOutcome::Continue => {}
        }
    }

    // 2. Anti-spam gate. Over-limit drops silently on secondary bots;
    //    an unreachable KV is a real failure and retries.
    match ctx
        .limiter
        .check(args.bot_id, args.user_tg_id, "message")
        .await
    {
        Ok(()) => {}
        Err(e @ HiveError::RateLimited { .. }) => {
            debug!(bot_id = args.bot_id, user_tg_id = args.user_tg_id, error = %e,
                   "message rate-limited");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    // 3. Activity ping: bump the inactivity version and arm the watchdog.
    ctx.store.touch_user(args.bot_id, args.user_tg_id)?;
    let inactivity_version = ctx.store.touch_activity(args.bot_id, args.user_tg_id)?;
    if let Some(campaign) = ctx.store.get_recovery_campaign(args.bot_id)? {
        if campaign.is_active {
            schedule_inactivity_check(
                &ctx.queue,
                args.bot_id,
                args.user_tg_id,
                inactivity_version,
                campaign.inactivity_threshold_secs,
            )
            .await?;
        }
    }

    // 4. Credit pre-check. A failed check drops the message with a log line
    //    and no user-visible reply.
    ctx.credits.precheck_text(bot.owner_admin_id, &args.text)?;

    let is_owner_admin =
        args.user_tg_id == bot.owner_admin_id || ctx.config.is_unlimited_admin(args.user_tg_id);

    // 5. Owner debug commands short-circuit the pipeline.
    if is_owner_admin && args.text.starts_with('/') {
        if crate::debug::handle_debug_command(ctx, &bot, args).await? {
            return Ok(());
        }
    }

    // 6. Inbound pre-scan: admins can type a discount term directly.
    if is_owner_admin && negotiate_discount(ctx, &bot, args, &args.text).await? {
        return Ok(());
    }

    // 7. Load session state.
    let session = ctx
        .store
        .get_or_create_session(args.bot_id, args.user_tg_id)?;
    let general = ctx.store.general_phase(args.bot_id)?;
    let current_phase = match session.phase_id {
        Some(id) => ctx.store.get_phase(id)?,
        None => None,
    };
    let statuses = action_statuses(ctx, args.bot_id, args.user_tg_id)?;
    let armed_prompts = armed_upsell_prompts(ctx, args.bot_id, args.user_tg_id)?;

    // 8. Assemble the request.
    let system = crate::prompt::assemble_system(
        general.as_ref(),
        current_phase.as_ref(),
        &statuses,
        &armed_prompts,
    );
    let mut messages: Vec<ChatMessage> = session
        .history
        .iter()
        .map(|turn| ChatMessage {
            role: if turn.role == "assistant" {
                "assistant"
            } else {
                "user"
            },
            content: turn.text.clone(),
        })
        .collect();
    messages.push(ChatMessage::user(args.text.clone()));

    // 9. LLM round.
    ctx.metrics.llm_calls.inc();
    let reply = ctx.llm.complete(&system, &messages).await?;

    // 10. Post-debit with the real usage.
    ctx.credits.debit_text(
        bot.owner_admin_id,
        &reply.usage,
        &format!("msg:{}:{}", args.bot_id, args.user_tg_id),
    )?;

    // Persist both turns before any sends; CAS merge tolerates interleaving.
    ctx.store.append_turns_merged(
        args.bot_id,
        args.user_tg_id,
        &[
            HistoryTurn {
                role: "user".into(),
                text: args.text.clone(),
                media_ref: None,
                ts: Utc::now(),
            },
            HistoryTurn {
                role: "assistant".into(),
                text: reply.text.clone(),
                media_ref: None,
                ts: Utc::now(),
            },
        ],
    )?;

    // 11-12. Post-scan the output and send the result.
    post_scan_and_send(ctx, &bot, args, &reply.text).await
}

fn action_statuses(
    ctx: &EngineCtx,
    bot_id: i64,
    user_tg_id: i64,
) -> Result<Vec<(String, ActionState)>> {
    let mut out = Vec::new();
    for action in ctx.store.list_actions(bot_id)? {
        if action.track_usage {
            let state = ctx.store.action_state(bot_id, user_tg_id, action.id)?;
            out.push((action.name, state));
        }
    }
    Ok(out)
}

fn armed_upsell_prompts(ctx: &EngineCtx, bot_id: i64, user_tg_id: i64) -> Result<Vec<String>> {
    let armed = ctx.store.awaiting_trigger_deliveries(bot_id, user_tg_id)?;
    let mut prompts = Vec::new();
    for delivery in armed {
        if let Some(upsell) = ctx.store.get_upsell(delivery.upsell_id)? {
            if !upsell.phase_prompt.is_empty() {
                prompts.push(upsell.phase_prompt);
            }
        }
    }
    Ok(prompts)
}

/// Scan the model output in contract order: phase transition, discount,
/// offer, action, upsell trigger, manual verification — then deliver.
async fn post_scan_and_send(
    ctx: &EngineCtx,
    bot: &Bot,
    args: &MessageArgs,
    output: &str,
) -> Result<()> {
    let mut suppress_llm_text = false;
    // Containers queued for delivery after the LLM text, with the PIX code
    // each one substitutes.
    let mut sequences: Vec<(Container, Option<String>)> = Vec::new();

    // 11a. Phase transition: the first phase whose trigger term appears.
    let phases = ctx.store.list_phases(args.bot_id)?;
    if let Some(next_phase) = phases.iter().find(|p| {
        !p.is_general
            && p.trigger_terms
                .iter()
                .any(|term| contains_term(output, term))
    }) {
        ctx.store
            .set_session_phase(args.bot_id, args.user_tg_id, next_phase.id)?;
        info!(bot_id = args.bot_id, user_tg_id = args.user_tg_id,
              phase = %next_phase.name, "phase transition");
    }

    let offers = ctx.store.list_active_offers(args.bot_id)?;

    // 11b. Discount negotiation in the model output.
    let mut discount_matched = false;
    for offer in &offers {
        let Some(term) = offer.discount_trigger.as_deref() else {
            continue;
        };
        if let Some(amount_cents) = find_discount_amount(output, term) {
            let tx = create_offer_charge(ctx, bot, args, offer, TxKind::Discount, amount_cents)
                .await?;
            sequences.push((
                Container::new(ContainerKind::Discount, offer.id),
                Some(tx),
            ));
            if substitution_policy(output, term) == Substitution::Replace {
                suppress_llm_text = true;
            }
            discount_matched = true;
            break;
        }
    }

    // 11c. Offer detection (skipped when a discount already claimed it).
    if !discount_matched {
        if let Some(offer) = first_match(output, &offers, |o: &Offer| Some(o.name.as_str())) {
            let tx =
                create_offer_charge(ctx, bot, args, offer, TxKind::Offer, offer.price_cents)
                    .await?;
            sequences.push((
                Container::new(ContainerKind::OfferPitch, offer.id),
                Some(tx),
            ));
            if substitution_policy(output, &offer.name) == Substitution::Replace {
                suppress_llm_text = true;
            }
        }
    }

    // 11d. Action detection.
    let actions = ctx.store.list_actions(args.bot_id)?;
    if let Some(action) = first_match(output, &actions, |a| Some(a.name.as_str())) {
        if action.track_usage {
            let state = ctx
                .store
                .action_state(args.bot_id, args.user_tg_id, action.id)?;
            if state == ActionState::Inactive {
                ctx.store.set_action_state(
                    args.bot_id,
                    args.user_tg_id,
                    action.id,
                    ActionState::Activated,
                )?;
            }
        }
        sequences.push((Container::new(ContainerKind::Action, action.id), None));
        if substitution_policy(output, &action.name) == Substitution::Replace {
            suppress_llm_text = true;
        }
    }

    // 11e. Upsell trigger against armed awaiting-trigger deliveries.
    let mut upsell_to_announce = None;
    for delivery in ctx
        .store
        .awaiting_trigger_deliveries(args.bot_id, args.user_tg_id)?
    {
        let Some(upsell) = ctx.store.get_upsell(delivery.upsell_id)? else {
            continue;
        };
        let Some(term) = upsell.trigger_term.as_deref() else {
            continue;
        };
        if contains_term(output, term) {
            if substitution_policy(output, term) == Substitution::Replace {
                suppress_llm_text = true;
            }
            upsell_to_announce = Some(delivery.id);
            break;
        }
    }

    // 11f. Manual verification trigger.
    let mut manual_verification = None;
    for offer in &offers {
        let Some(term) = offer.manual_verification_trigger.as_deref() else {
            continue;
        };
        if contains_term(output, term) {
            manual_verification = Some(offer.id);
            break;
        }
    }

    // 12. Delivery, strictly ordered: LLM text first (unless replaced), then
    // each triggered sequence.
    if !suppress_llm_text && !output.trim().is_empty() {
        ctx.sender
            .send_plain_text(args.bot_id, args.chat_id, output)
            .await?;
    }
    for (container, pix_code) in sequences {
        let opts = SendOptions {
            pix_code,
            ..Default::default()
        };
        ctx.sender
            .send_container(args.bot_id, args.chat_id, container, &opts)
            .await?;
    }
    if let Some(delivery_id) = upsell_to_announce {
        ctx.upsells.announce_delivery(delivery_id).await?;
    }
    if let Some(offer_id) = manual_verification {
        resolve_manual_verification(ctx, args, offer_id).await?;
    }
    Ok(())
}

/// Create a charge and return its PIX code for `{pix}` substitution.
async fn create_offer_charge(
    ctx: &EngineCtx,
    _bot: &Bot,
    args: &MessageArgs,
    offer: &Offer,
    kind: TxKind,
    amount_cents: i64,
) -> Result<String> {
    let tracker_id = ctx.store.attribution_of(args.bot_id, args.user_tg_id)?;
    let tx = ctx
        .payments
        .create_charge(
            args.bot_id,
            args.user_tg_id,
            kind,
            amount_cents,
            Some(offer.id),
            None,
            tracker_id,
        )
        .await?;
    Ok(tx.pix_code)
}

/// Admin typed `{discount_term}{amount}`: negotiate the price down and hand
/// out a fresh PIX. Returns true when the message was fully handled.
async fn negotiate_discount(
    ctx: &EngineCtx,
    bot: &Bot,
    args: &MessageArgs,
    text: &str,
) -> Result<bool> {
    let offers = ctx.store.list_active_offers(args.bot_id)?;
    for offer in &offers {
        let Some(term) = offer.discount_trigger.as_deref() else {
            continue;
        };
        if let Some(amount_cents) = find_discount_amount(text, term) {
            let pix =
                create_offer_charge(ctx, bot, args, offer, TxKind::Discount, amount_cents).await?;
            ctx.sender
                .send_container(
                    args.bot_id,
                    args.chat_id,
                    Container::new(ContainerKind::Discount, offer.id),
                    &SendOptions {
                        pix_code: Some(pix),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// The model asked for payment proof: if a recent transaction is already
/// paid, fan out the delivery; otherwise walk the user through manual
/// verification.
async fn resolve_manual_verification(
    ctx: &EngineCtx,
    args: &MessageArgs,
    offer_id: i64,
) -> Result<()> {
    let recent = ctx.store.recent_open_transaction(
        args.bot_id,
        args.user_tg_id,
        Duration::minutes(MANUAL_VERIFICATION_WINDOW_MIN),
        Utc::now(),
    )?;
    match recent {
        Some(tx) if tx.status == TxStatus::Paid => {
            hive_payments::transactions::enqueue_sale_approved(&ctx.queue, tx.id).await?;
        }
        Some(tx) => {
            debug!(tx_id = tx.id, status = tx.status.as_str(), "manual verification blocks sent");
            ctx.sender
                .send_container(
                    args.bot_id,
                    args.chat_id,
                    Container::new(ContainerKind::OfferManualVerification, offer_id),
                    &SendOptions::default(),
                )
                .await?;
        }
        None => {
            warn!(bot_id = args.bot_id, user_tg_id = args.user_tg_id,
                  "manual verification trigger with no recent transaction");
            ctx.sender
                .send_container(
                    args.bot_id,
                    args.chat_id,
                    Container::new(ContainerKind::OfferManualVerification, offer_id),
                    &SendOptions::default(),
                )
                .await?;
        }
    }
    Ok(())
}

