//! Credit pricing and admission control.
//!
//! The pre-check is conservative: estimated input tokens (chars / configured
//! ratio) plus a moving average of recent output sizes, priced in USD per
//! million tokens and converted to BRL cents. The post-debit uses the real
//! usage and is always applied. Unlimited admins bypass both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use hive_clients::ChatUsage;
use hive_core::config::PricingConfig;
use hive_core::metrics::Metrics;
use hive_core::{HiveError, Result};
use hive_store::types::LedgerCategory;
use hive_store::Store;

/// Seed for the output moving average before any response was observed.
const OUTPUT_AVG_SEED_TOKENS: u64 = 300;

/// EMA weight of the newest observation, percent.
const OUTPUT_AVG_ALPHA_PCT: u64 = 20;

pub struct CreditService {
    store: Arc<Store>,
    pricing: PricingConfig,
    unlimited: Vec<i64>,
    metrics: Arc<Metrics>,
    /// Process-wide advisory average of output tokens; feeds the estimate
    /// only, never the debit.
    output_avg_tokens: AtomicU64,
}

impl CreditService {
    pub fn new(
        store: Arc<Store>,
        pricing: PricingConfig,
        unlimited: Vec<i64>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            pricing,
            unlimited,
            metrics,
            output_avg_tokens: AtomicU64::new(OUTPUT_AVG_SEED_TOKENS),
        }
    }

    pub fn is_unlimited(&self, admin_id: i64) -> bool {
        self.unlimited.contains(&admin_id)
    }

    /// Character-based token estimate (provider tokenizer unavailable here).
    pub fn estimate_tokens(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        (chars / self.pricing.estimated_chars_per_token.max(1.0)).ceil() as u64
    }

    fn usd_to_cents(&self, usd: f64) -> i64 {
        (usd * self.pricing.usd_to_brl_rate * 100.0).ceil() as i64
    }

    /// Estimated BRL cents for a message of `input_tokens` plus the current
    /// output average.
    pub fn estimate_text_cost_cents(&self, input_tokens: u64) -> i64 {
        let out_avg = self.output_avg_tokens.load(Ordering::Relaxed);
        let usd = (input_tokens as f64 / 1e6) * self.pricing.text_input_per_mtok_usd
            + (out_avg as f64 / 1e6) * self.pricing.text_output_per_mtok_usd;
        self.usd_to_cents(usd)
    }

    /// True BRL cents from the provider-reported usage. Cached prompt tokens
    /// are billed at the cached rate.
    pub fn text_cost_cents(&self, usage: &ChatUsage) -> i64 {
        let fresh_in = usage.tokens_in.saturating_sub(usage.tokens_cached);
        let usd = (fresh_in as f64 / 1e6) * self.pricing.text_input_per_mtok_usd
            + (usage.tokens_cached as f64 / 1e6) * self.pricing.text_cached_per_mtok_usd
            + (usage.tokens_out as f64 / 1e6) * self.pricing.text_output_per_mtok_usd;
        self.usd_to_cents(usd)
    }

    /// Audio pricing: whole minutes, rounded up.
    pub fn audio_cost_cents(&self, seconds: u64) -> i64 {
        let minutes = seconds.div_ceil(60).max(1);
        self.usd_to_cents(minutes as f64 * self.pricing.whisper_cost_per_minute_usd)
    }

    /// Admission control before the LLM call. Fails with
    /// `InsufficientCredits`, which the secondary-bot pipeline turns into a
    /// silent drop.
    pub fn precheck_text(&self, admin_id: i64, message_text: &str) -> Result<()> {
        if self.is_unlimited(admin_id) {
            return Ok(());
        }
        let estimate = self.estimate_text_cost_cents(self.estimate_tokens(message_text));
        let balance = self.store.wallet_balance(admin_id)?;
        if balance < estimate {
            self.metrics.credit_drops.inc();
            return Err(HiveError::InsufficientCredits {
                admin_id,
                needed_cents: estimate,
                balance_cents: balance,
            });
        }
        Ok(())
    }

    /// Debit the true cost of a text exchange and feed the output average.
    pub fn debit_text(&self, admin_id: i64, usage: &ChatUsage, reference: &str) -> Result<i64> {
        // EMA update regardless of who paid; it is an estimate input.
        let prev = self.output_avg_tokens.load(Ordering::Relaxed);
        let next = (prev * (100 - OUTPUT_AVG_ALPHA_PCT) + usage.tokens_out * OUTPUT_AVG_ALPHA_PCT)
            / 100;
        self.output_avg_tokens.store(next.max(1), Ordering::Relaxed);

        if self.is_unlimited(admin_id) {
            return Ok(0);
        }
        let cost = self.text_cost_cents(usage);
        let applied = self
            .store
            .debit_wallet(admin_id, cost, LedgerCategory::Text, reference)?;
        self.metrics.credit_debits_cents.add(applied as u64);
        debug!(admin_id, cost, applied, reference, "text debit");
        Ok(applied)
    }

    pub fn debit_audio(&self, admin_id: i64, seconds: u64, reference: &str) -> Result<i64> {
        if self.is_unlimited(admin_id) {
            return Ok(0);
        }
        let cost = self.audio_cost_cents(seconds);
        let applied = self
            .store
            .debit_wallet(admin_id, cost, LedgerCategory::Whisper, reference)?;
        self.metrics.credit_debits_cents.add(applied as u64);
        debug!(admin_id, cost, applied, reference, "audio debit");
        Ok(applied)
    }

    /// Credit a paid top-up: BRL cents map 1:1 onto wallet cents.
    pub fn apply_topup(&self, admin_id: i64, amount_cents: i64, reference: &str) -> Result<()> {
        self.store
            .credit_wallet(admin_id, amount_cents, LedgerCategory::Topup, reference)?;
        info!(admin_id, amount_cents, reference, "top-up credited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(balance_cents: i64) -> CreditService {
        let store = Arc::new(Store::open_in_memory().unwrap());
        if balance_cents > 0 {
            store
                .credit_wallet(10, balance_cents, LedgerCategory::Topup, "seed")
                .unwrap();
        }
        CreditService::new(
            store,
            PricingConfig::default(),
            vec![999],
            Arc::new(Metrics::default()),
        )
    }

    #[test]
    fn token_estimate_uses_chars_over_ratio() {
        let svc = service(0);
        // Default ratio is 4 chars per token.
        assert_eq!(svc.estimate_tokens("abcd"), 1);
        assert_eq!(svc.estimate_tokens("abcde"), 2);
        assert_eq!(svc.estimate_tokens(""), 0);
    }

    #[test]
    fn precheck_drops_below_estimate() {
        // S6: wallet 10 BRL, estimate above it → InsufficientCredits.
        let svc = service(10_00);
        let big_message = "x".repeat(4_000_000);
        let err = svc.precheck_text(10, &big_message).unwrap_err();
        assert!(matches!(err, HiveError::InsufficientCredits { .. }));
        // Balance untouched.
        assert_eq!(svc.store.wallet_balance(10).unwrap(), 10_00);
    }

    #[test]
    fn precheck_passes_with_funds() {
        let svc = service(10_00);
        svc.precheck_text(10, "quero premium").unwrap();
    }

    #[test]
    fn unlimited_admin_bypasses_everything() {
        let svc = service(0);
        svc.precheck_text(999, &"x".repeat(1_000_000)).unwrap();
        let usage = ChatUsage {
            tokens_in: 1000,
            tokens_out: 500,
            tokens_cached: 0,
        };
        assert_eq!(svc.debit_text(999, &usage, "r").unwrap(), 0);
    }

    #[test]
    fn debit_uses_real_usage_and_cached_rate() {
        let svc = service(100_00);
        let usage = ChatUsage {
            tokens_in: 1_000_000,
            tokens_out: 0,
            tokens_cached: 1_000_000,
        };
        // Fully cached input bills at the cached rate only.
        let cached_cost = svc.text_cost_cents(&usage);
        let fresh = ChatUsage {
            tokens_in: 1_000_000,
            tokens_out: 0,
            tokens_cached: 0,
        };
        assert!(cached_cost < svc.text_cost_cents(&fresh));

        let applied = svc.debit_text(10, &usage, "msg").unwrap();
        assert_eq!(applied, cached_cost);
    }

    #[test]
    fn audio_rounds_up_to_whole_minutes() {
        let svc = service(0);
        assert_eq!(svc.audio_cost_cents(59), svc.audio_cost_cents(60));
        assert!(svc.audio_cost_cents(61) > svc.audio_cost_cents(60));
        // Zero-length audio still bills one minute.
        assert_eq!(svc.audio_cost_cents(0), svc.audio_cost_cents(60));
    }

    #[test]
    fn output_average_tracks_responses() {
        let svc = service(0);
        let before = svc.estimate_text_cost_cents(0);
        for _ in 0..20 {
            let usage = ChatUsage {
                tokens_in: 10,
                tokens_out: 100_000,
                tokens_cached: 0,
            };
            let _ = svc.debit_text(999, &usage, "r");
        }
        let after = svc.estimate_text_cost_cents(0);
        assert!(after > before, "estimate should grow with observed output");
    }
}
