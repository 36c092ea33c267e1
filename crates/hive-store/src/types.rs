use chrono::{DateTime, Utc};
use hive_core::types::MediaKind;
use serde::{Deserialize, Serialize};

/// A registered secondary bot. The token is encrypted at rest and only
/// decrypted inside workers.
#[derive(Debug, Clone)]
pub struct Bot {
    pub id: i64,
    pub owner_admin_id: i64,
    pub token_encrypted: String,
    pub username: String,
    pub webhook_secret: String,
    pub is_active: bool,
    pub associated_offer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub bot_id: i64,
    pub telegram_user_id: i64,
    pub first_interaction_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

/// One turn of conversation history, stored as JSON inside the session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryTurn {
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub bot_id: i64,
    pub user_tg_id: i64,
    pub phase_id: Option<i64>,
    pub history: Vec<HistoryTurn>,
    pub history_version: i64,
    pub last_active_at: DateTime<Utc>,
    pub inactivity_version: i64,
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub id: i64,
    pub bot_id: i64,
    pub name: String,
    pub prompt_text: String,
    pub trigger_terms: Vec<String>,
    pub ordering: i64,
    pub is_general: bool,
}

/// Which entity a block sequence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Start,
    OfferPitch,
    OfferDeliverable,
    OfferManualVerification,
    Action,
    UpsellAnnouncement,
    UpsellDeliverable,
    RecoveryStep,
    Discount,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Start => "start",
            ContainerKind::OfferPitch => "offer_pitch",
            ContainerKind::OfferDeliverable => "offer_deliverable",
            ContainerKind::OfferManualVerification => "offer_manual_verification",
            ContainerKind::Action => "action",
            ContainerKind::UpsellAnnouncement => "upsell_announcement",
            ContainerKind::UpsellDeliverable => "upsell_deliverable",
            ContainerKind::RecoveryStep => "recovery_step",
            ContainerKind::Discount => "discount",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "start" => ContainerKind::Start,
            "offer_pitch" => ContainerKind::OfferPitch,
            "offer_deliverable" => ContainerKind::OfferDeliverable,
            "offer_manual_verification" => ContainerKind::OfferManualVerification,
            "action" => ContainerKind::Action,
            "upsell_announcement" => ContainerKind::UpsellAnnouncement,
            "upsell_deliverable" => ContainerKind::UpsellDeliverable,
            "recovery_step" => ContainerKind::RecoveryStep,
            "discount" => ContainerKind::Discount,
            _ => return None,
        })
    }
}

/// Identifies one block sequence: kind + owning row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerKind,
    pub id: i64,
}

impl Container {
    pub fn new(kind: ContainerKind, id: i64) -> Self {
        Self { kind, id }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: i64,
    pub container: Container,
    pub ord: i64,
    pub text: Option<String>,
    pub media_ref: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub delay_secs: u32,
    pub auto_delete_secs: u32,
}

/// Bounds enforced when a block is created or edited.
pub const BLOCK_DELAY_MAX_SECS: u32 = 300;
pub const BLOCK_AUTO_DELETE_MAX_SECS: u32 = 86_400;

#[derive(Debug, Clone)]
pub struct Offer {
    pub id: i64,
    pub bot_id: i64,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub manual_verification_trigger: Option<String>,
    pub discount_trigger: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub id: i64,
    pub bot_id: i64,
    pub name: String,
    pub track_usage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Inactive,
    Activated,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Inactive => "inactive",
            ActionState::Activated => "activated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsellSchedule {
    Immediate,
    Relative,
}

#[derive(Debug, Clone)]
pub struct Upsell {
    pub id: i64,
    pub bot_id: i64,
    pub ordinal: i64,
    pub is_preset: bool,
    pub trigger_term: Option<String>,
    pub phase_prompt: String,
    pub price_cents: i64,
    pub schedule: UpsellSchedule,
    pub rel_days: i64,
    pub rel_hours: i64,
    pub rel_minutes: i64,
}

impl Upsell {
    /// Total relative delay for `Relative`-scheduled upsells.
    pub fn relative_delay(&self) -> chrono::Duration {
        chrono::Duration::days(self.rel_days)
            + chrono::Duration::hours(self.rel_hours)
            + chrono::Duration::minutes(self.rel_minutes)
    }
}

/// Upsell #1 lifecycle: armed (awaiting trigger or scheduled time) →
/// announced → delivered. `sent_at` is immutable once set.
#[derive(Debug, Clone)]
pub struct UpsellDelivery {
    pub id: i64,
    pub bot_id: i64,
    pub user_tg_id: i64,
    pub upsell_id: i64,
    pub status: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RecoveryCampaign {
    pub bot_id: i64,
    pub inactivity_threshold_secs: u64,
    pub timezone: String,
    pub ignore_paying_users: bool,
    pub is_active: bool,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct RecoveryStep {
    pub id: i64,
    pub campaign_bot_id: i64,
    pub ordinal: i64,
    pub schedule_expr: String,
}

#[derive(Debug, Clone)]
pub struct RecoveryDelivery {
    pub id: i64,
    pub bot_id: i64,
    pub user_tg_id: i64,
    pub campaign_version: i64,
    pub episode_id: String,
    pub step_id: i64,
    pub status: String,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Offer,
    Upsell,
    Topup,
    Discount,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Offer => "offer",
            TxKind::Upsell => "upsell",
            TxKind::Topup => "topup",
            TxKind::Discount => "discount",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "offer" => TxKind::Offer,
            "upsell" => TxKind::Upsell,
            "topup" => TxKind::Topup,
            "discount" => TxKind::Discount,
            _ => return None,
        })
    }
}

/// `created → pending → paid → delivered`, side branches `expired`/`failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Created,
    Pending,
    Paid,
    Delivered,
    Expired,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Created => "created",
            TxStatus::Pending => "pending",
            TxStatus::Paid => "paid",
            TxStatus::Delivered => "delivered",
            TxStatus::Expired => "expired",
            TxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => TxStatus::Created,
            "pending" => TxStatus::Pending,
            "paid" => TxStatus::Paid,
            "delivered" => TxStatus::Delivered,
            "expired" => TxStatus::Expired,
            "failed" => TxStatus::Failed,
            _ => return None,
        })
    }

    /// Legal transitions of the transaction state machine.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Created, Pending)
                | (Created, Paid)
                | (Created, Expired)
                | (Created, Failed)
                | (Pending, Paid)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Paid, Delivered)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Delivered | TxStatus::Expired | TxStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct PixTransaction {
    pub id: i64,
    pub bot_id: i64,
    pub user_tg_id: i64,
    pub kind: TxKind,
    pub offer_id: Option<i64>,
    pub upsell_id: Option<i64>,
    pub tracker_id: Option<i64>,
    pub amount_cents: i64,
    pub status: TxStatus,
    pub external_id: String,
    pub pix_code: String,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SaleNotification {
    pub transaction_id: i64,
    pub owner_admin_id: i64,
    pub channel_id: Option<i64>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCategory {
    Text,
    Whisper,
    Topup,
    Refund,
}

impl LedgerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerCategory::Text => "text",
            LedgerCategory::Whisper => "whisper",
            LedgerCategory::Topup => "topup",
            LedgerCategory::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tracker {
    pub id: i64,
    pub bot_id: i64,
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerDailyStat {
    pub starts: i64,
    pub sales: i64,
    pub revenue_cents: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BotTrackingConfig {
    pub require_tracked_start: bool,
    pub last_forced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_state_machine_transitions() {
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Paid));
        assert!(TxStatus::Paid.can_transition_to(TxStatus::Delivered));
        assert!(!TxStatus::Paid.can_transition_to(TxStatus::Expired));
        assert!(!TxStatus::Delivered.can_transition_to(TxStatus::Paid));
        assert!(!TxStatus::Expired.can_transition_to(TxStatus::Paid));
        assert!(TxStatus::Delivered.is_terminal());
        assert!(!TxStatus::Paid.is_terminal());
    }

    #[test]
    fn container_kind_roundtrip() {
        for kind in [
            ContainerKind::Start,
            ContainerKind::OfferPitch,
            ContainerKind::OfferDeliverable,
            ContainerKind::OfferManualVerification,
            ContainerKind::Action,
            ContainerKind::UpsellAnnouncement,
            ContainerKind::UpsellDeliverable,
            ContainerKind::RecoveryStep,
            ContainerKind::Discount,
        ] {
            assert_eq!(ContainerKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn relative_upsell_delay_adds_components() {
        let u = Upsell {
            id: 1,
            bot_id: 1,
            ordinal: 2,
            is_preset: false,
            trigger_term: None,
            phase_prompt: String::new(),
            price_cents: 990,
            schedule: UpsellSchedule::Relative,
            rel_days: 1,
            rel_hours: 2,
            rel_minutes: 30,
        };
        assert_eq!(u.relative_delay().num_minutes(), 24 * 60 + 150);
    }
}
