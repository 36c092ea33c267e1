//! Inactivity watchdog and recovery-step delivery.
//!
//! Every user message bumps the session's `inactivity-version` and schedules
//! a `check-inactive` task carrying the new version. When the check fires it
//! re-reads the version: unchanged means the user really went quiet, so an
//! episode is minted and step 1 scheduled. Any message in between bumps the
//! version and every in-flight task for the old one aborts on its first
//! check, without side effects.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use hive_blocks::{BlockSender, SendOptions};
use hive_core::metrics::Metrics;
use hive_core::{HiveError, Result};
use hive_queue::{TaskEnvelope, TaskHandler, TaskQueue, QUEUE_RECOVERY};
use hive_store::types::{Container, ContainerKind, RecoveryCampaign, RecoveryStep};
use hive_store::Store;

use crate::expr::ScheduleExpr;

pub const CHECK_INACTIVE_TASK: &str = "check-inactive";
pub const RECOVERY_STEP_TASK: &str = "recovery-step";

#[derive(Debug, Serialize, Deserialize)]
struct CheckInactiveArgs {
    bot_id: i64,
    user_tg_id: i64,
    inactivity_version: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecoveryStepArgs {
    bot_id: i64,
    user_tg_id: i64,
    campaign_version: i64,
    inactivity_version: i64,
    episode_id: String,
    step_id: i64,
}

/// Called by the conversation pipeline on every user message, after the
/// activity ping bumped the version.
pub async fn schedule_inactivity_check(
    queue: &TaskQueue,
    bot_id: i64,
    user_tg_id: i64,
    inactivity_version: i64,
    threshold_secs: u64,
) -> Result<()> {
    let task = TaskEnvelope::new(
        QUEUE_RECOVERY,
        CHECK_INACTIVE_TASK,
        serde_json::to_value(CheckInactiveArgs {
            bot_id,
            user_tg_id,
            inactivity_version,
        })?,
    );
    queue
        .schedule(task, Duration::seconds(threshold_secs as i64))
        .await?;
    Ok(())
}

fn campaign_tz(campaign: &RecoveryCampaign) -> Result<Tz> {
    campaign.timezone.parse::<Tz>().map_err(|_| {
        HiveError::Validation(format!("bad campaign timezone {:?}", campaign.timezone))
    })
}

async fn schedule_step(
    store: &Store,
    queue: &TaskQueue,
    campaign: &RecoveryCampaign,
    step: &RecoveryStep,
    bot_id: i64,
    user_tg_id: i64,
    inactivity_version: i64,
    episode_id: &str,
    anchor: chrono::DateTime<Utc>,
) -> Result<()> {
    let tz = campaign_tz(campaign)?;
    let expr = ScheduleExpr::parse(&step.schedule_expr)?;
    let mut at = expr.next_occurrence(anchor, tz);
    let now = Utc::now();
    if at < now {
        at = now;
    }

    // Idempotent row creation; a racing scheduler loses the insert and stops.
    if !store.ensure_recovery_delivery(
        bot_id,
        user_tg_id,
        campaign.version,
        episode_id,
        step.id,
        at,
    )? {
        debug!(bot_id, user_tg_id, episode_id, step_id = step.id,
               "recovery delivery already scheduled");
        return Ok(());
    }

    let task = TaskEnvelope::new(
        QUEUE_RECOVERY,
        RECOVERY_STEP_TASK,
        serde_json::to_value(RecoveryStepArgs {
            bot_id,
            user_tg_id,
            campaign_version: campaign.version,
            inactivity_version,
            episode_id: episode_id.to_string(),
            step_id: step.id,
        })?,
    )
    .with_idempotency_key(format!("rec:{bot_id}:{user_tg_id}:{episode_id}:{}", step.id));
    queue.at(task, at).await?;
    info!(bot_id, user_tg_id, episode_id, step_id = step.id, at = %at,
          "recovery step scheduled");
    Ok(())
}

pub struct CheckInactiveHandler {
    store: Arc<Store>,
    queue: TaskQueue,
}

impl CheckInactiveHandler {
    pub fn new(store: Arc<Store>, queue: TaskQueue) -> Self {
        Self { store, queue }
    }
}

#[async_trait]
impl TaskHandler for CheckInactiveHandler {
    fn name(&self) -> &'static str {
        CHECK_INACTIVE_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: CheckInactiveArgs = serde_json::from_value(task.args.clone())?;

        let Some(campaign) = self.store.get_recovery_campaign(args.bot_id)? else {
            return Ok(());
        };
        if !campaign.is_active {
            return Ok(());
        }

        // The version gate: any activity since this task was scheduled
        // bumped it, and this episode never starts.
        let current = self
            .store
            .inactivity_version(args.bot_id, args.user_tg_id)?
            .unwrap_or(0);
        if current != args.inactivity_version {
            return Err(HiveError::Consistency(format!(
                "inactivity version moved {} -> {current}",
                args.inactivity_version
            )));
        }

        if campaign.ignore_paying_users
            && self
                .store
                .has_paid_transaction(args.bot_id, args.user_tg_id)?
        {
            debug!(bot_id = args.bot_id, user_tg_id = args.user_tg_id,
                   "paying user, recovery skipped");
            return Ok(());
        }

        let steps = self.store.list_recovery_steps(args.bot_id)?;
        let Some(first) = steps.first() else {
            return Ok(());
        };

        // Step 1 is anchored at the moment the user went quiet, so a "10m"
        // first step with a 600s threshold fires as soon as the check
        // confirms the silence.
        let session = self
            .store
            .get_or_create_session(args.bot_id, args.user_tg_id)?;
        let episode_id = Uuid::new_v4().to_string();
        info!(bot_id = args.bot_id, user_tg_id = args.user_tg_id, %episode_id,
              "inactivity confirmed, episode started");

        schedule_step(
            &self.store,
            &self.queue,
            &campaign,
            first,
            args.bot_id,
            args.user_tg_id,
            args.inactivity_version,
            &episode_id,
            session.last_active_at,
        )
        .await
    }
}

pub struct RecoveryStepHandler {
    store: Arc<Store>,
    queue: TaskQueue,
    sender: Arc<BlockSender>,
    metrics: Arc<Metrics>,
}

impl RecoveryStepHandler {
    pub fn new(
        store: Arc<Store>,
        queue: TaskQueue,
        sender: Arc<BlockSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            sender,
            metrics,
        }
    }
}

#[async_trait]
impl TaskHandler for RecoveryStepHandler {
    fn name(&self) -> &'static str {
        RECOVERY_STEP_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: RecoveryStepArgs = serde_json::from_value(task.args.clone())?;

        let Some(campaign) = self.store.get_recovery_campaign(args.bot_id)? else {
            return Ok(());
        };
        let delivery = self.store.get_recovery_delivery(
            args.bot_id,
            args.user_tg_id,
            &args.episode_id,
            args.step_id,
        )?;
        let Some(delivery) = delivery else {
            return Ok(());
        };
        if delivery.sent_at.is_some() {
            return Ok(());
        }

        // Campaign reconfigured since this step was scheduled.
        if !campaign.is_active || campaign.version != args.campaign_version {
            self.store.mark_recovery_skipped(delivery.id)?;
            return Err(HiveError::Consistency(format!(
                "campaign version moved {} -> {}",
                args.campaign_version, campaign.version
            )));
        }

        // The user spoke; the episode is over.
        let current = self
            .store
            .inactivity_version(args.bot_id, args.user_tg_id)?
            .unwrap_or(0);
        if current != args.inactivity_version {
            self.store.mark_recovery_skipped(delivery.id)?;
            return Err(HiveError::Consistency(format!(
                "inactivity version moved {} -> {current}",
                args.inactivity_version
            )));
        }

        // Claim before sending: `sent_at` is write-once, so a racing worker
        // hits Conflict here and exits as already-handled.
        self.store.mark_recovery_sent(delivery.id)?;

        self.sender
            .send_container(
                args.bot_id,
                args.user_tg_id,
                Container::new(ContainerKind::RecoveryStep, args.step_id),
                &SendOptions::default(),
            )
            .await?;
        self.metrics.recovery_steps_sent.inc();

        // Chain the next step from the moment this one went out.
        let steps = self.store.list_recovery_steps(args.bot_id)?;
        let Some(current_step) = steps.iter().find(|s| s.id == args.step_id) else {
            return Ok(());
        };
        if let Some(next) = self
            .store
            .next_recovery_step(args.bot_id, current_step.ordinal)?
        {
            schedule_step(
                &self.store,
                &self.queue,
                &campaign,
                &next,
                args.bot_id,
                args.user_tg_id,
                args.inactivity_version,
                &args.episode_id,
                Utc::now(),
            )
            .await?;
        } else {
            info!(bot_id = args.bot_id, user_tg_id = args.user_tg_id,
                  episode_id = %args.episode_id, "recovery episode complete");
        }
        Ok(())
    }
}
