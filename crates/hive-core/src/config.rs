use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Per-call I/O timeouts (seconds). Workers never issue an external call
// without one of these applied.
pub const SQL_TIMEOUT_SECS: u64 = 5;
pub const KV_TIMEOUT_SECS: u64 = 2;
pub const TELEGRAM_TIMEOUT_SECS: u64 = 15;
pub const LLM_TIMEOUT_SECS: u64 = 60;
pub const GATEWAY_TIMEOUT_SECS: u64 = 10;

/// TTL for the `update:seen:{bot}:{update_id}` de-dup key.
pub const UPDATE_DEDUP_TTL_SECS: u64 = 300;

/// Placeholder substituted for `{pix}` in preview mode.
pub const PREVIEW_PIX_CODE: &str = "PREVIEW_PIX_CODE";

/// Deployment environment. Toggles log verbosity and safety nets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    #[default]
    Dev,
    Staging,
    Prod,
}

/// Top-level config (hive.toml + HIVE_* env overrides + the well-known bare
/// env names listed in `apply_env_overrides`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HiveConfig {
    #[serde(default)]
    pub app_env: AppEnv,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    /// action -> {limit, window_s}; parsed from RATE_LIMITS_JSON when set.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitRule>,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub whisper: WhisperConfig,
    #[serde(default)]
    pub pix: PixConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    /// Public URL used when registering webhooks with Telegram.
    pub base_url: String,
    /// Global secret expected on the manager-bot webhook.
    pub manager_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Token for manager-bot outbound calls.
    pub bot_token: String,
    /// Unlimited-credit set and legacy admin allowlist. May be empty.
    #[serde(default)]
    pub allowed_admin_ids: Vec<i64>,
    /// Master switch for sale notifications.
    #[serde(default = "bool_true")]
    pub enable_sale_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path in this deployment; DB_URL overrides.
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_db_pool_size")]
    pub pool_size: u32,
    #[serde(default)]
    pub max_overflow: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            pool_size: default_db_pool_size(),
            max_overflow: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_connections: default_redis_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CryptoConfig {
    /// 32-byte base64 key. Symmetric encryption + HMAC base.
    pub encryption_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// queue name -> concurrent workers in this process.
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: HashMap<String, usize>,
    /// queue name -> hard task deadline in seconds.
    #[serde(default = "default_queue_deadlines")]
    pub deadline_secs: HashMap<String, u64>,
    /// Interval for promoting delayed tasks into their ready list.
    #[serde(default = "default_promote_interval")]
    pub promote_interval_secs: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            concurrency: default_queue_concurrency(),
            deadline_secs: default_queue_deadlines(),
            promote_interval_secs: default_promote_interval(),
        }
    }
}

impl QueuesConfig {
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.concurrency.get(queue).copied().unwrap_or(2)
    }

    pub fn deadline_for(&self, queue: &str) -> u64 {
        self.deadline_secs.get(queue).copied().unwrap_or(120)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_fail_max")]
    pub fail_max: u32,
    #[serde(default = "default_breaker_timeout")]
    pub open_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: default_breaker_fail_max(),
            open_secs: default_breaker_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_whisper_base")]
    pub api_base: String,
    #[serde(default = "default_whisper_model")]
    pub model: String,
    #[serde(default = "default_whisper_timeout")]
    pub timeout_secs: u64,
    /// Longest accepted voice note, seconds.
    #[serde(default = "default_audio_max_duration")]
    pub audio_max_duration: u64,
    #[serde(default = "default_audio_max_size_mb")]
    pub audio_max_size_mb: u64,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_whisper_base(),
            model: default_whisper_model(),
            timeout_secs: default_whisper_timeout(),
            audio_max_duration: default_audio_max_duration(),
            audio_max_size_mb: default_audio_max_size_mb(),
            ffmpeg_binary: default_ffmpeg_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixConfig {
    #[serde(default = "default_pix_base_url")]
    pub base_url: String,
    /// Gateway token used for sale charges.
    #[serde(default)]
    pub token: String,
    /// Gateway token dedicated to credit top-ups (PUSHINRECARGA).
    #[serde(default)]
    pub topup_token: String,
    #[serde(default = "default_pix_timeout")]
    pub timeout_secs: u64,
    /// Poll cadence for pending transactions, seconds.
    #[serde(default = "default_pix_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for PixConfig {
    fn default() -> Self {
        Self {
            base_url: default_pix_base_url(),
            token: String::new(),
            topup_token: String::new(),
            timeout_secs: default_pix_timeout(),
            poll_interval_secs: default_pix_poll_interval(),
        }
    }
}

/// Unit prices. LLM prices are USD per million tokens; the ledger is BRL cents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_price_input")]
    pub text_input_per_mtok_usd: f64,
    #[serde(default = "default_price_output")]
    pub text_output_per_mtok_usd: f64,
    #[serde(default = "default_price_cached")]
    pub text_cached_per_mtok_usd: f64,
    #[serde(default = "default_whisper_per_minute")]
    pub whisper_cost_per_minute_usd: f64,
    #[serde(default = "default_usd_to_brl")]
    pub usd_to_brl_rate: f64,
    #[serde(default = "default_chars_per_token")]
    pub estimated_chars_per_token: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            text_input_per_mtok_usd: default_price_input(),
            text_output_per_mtok_usd: default_price_output(),
            text_cached_per_mtok_usd: default_price_cached(),
            whisper_cost_per_minute_usd: default_whisper_per_minute(),
            usd_to_brl_rate: default_usd_to_brl(),
            estimated_chars_per_token: default_chars_per_token(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PaymentsConfig {
    /// When true, upsell activation fires on any prior paid transaction
    /// instead of only when no transaction has reached `delivered`.
    #[serde(default)]
    pub upsell_activation_any_paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_db_url() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.hive/hive.db")
}
fn default_db_pool_size() -> u32 {
    10
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_redis_max_connections() -> u32 {
    16
}
fn default_queue_concurrency() -> HashMap<String, usize> {
    [
        ("default", 10),
        ("ai", 4),
        ("audio", 4),
        ("media", 4),
        ("recovery", 2),
        ("notifications", 2),
        ("scheduler", 2),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
fn default_queue_deadlines() -> HashMap<String, u64> {
    [("default", 120), ("ai", 180), ("media", 300)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
fn default_promote_interval() -> u64 {
    1
}
fn default_breaker_fail_max() -> u32 {
    5
}
fn default_breaker_timeout() -> u64 {
    30
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_max_tokens() -> u32 {
    1024
}
fn default_llm_timeout() -> u64 {
    LLM_TIMEOUT_SECS
}
fn default_whisper_base() -> String {
    "https://api.openai.com".to_string()
}
fn default_whisper_model() -> String {
    "whisper-1".to_string()
}
fn default_whisper_timeout() -> u64 {
    120
}
fn default_audio_max_duration() -> u64 {
    300
}
fn default_audio_max_size_mb() -> u64 {
    20
}
fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}
fn default_pix_base_url() -> String {
    "https://api.pushinpay.com.br".to_string()
}
fn default_pix_timeout() -> u64 {
    GATEWAY_TIMEOUT_SECS
}
fn default_pix_poll_interval() -> u64 {
    45
}
fn default_price_input() -> f64 {
    0.15
}
fn default_price_output() -> f64 {
    0.60
}
fn default_price_cached() -> f64 {
    0.075
}
fn default_whisper_per_minute() -> f64 {
    0.006
}
fn default_usd_to_brl() -> f64 {
    5.5
}
fn default_chars_per_token() -> f64 {
    4.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl HiveConfig {
    /// Load config from a TOML file with HIVE_* env overrides, then apply
    /// the bare well-known env names (DB_URL, REDIS_URL, …).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: HiveConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HIVE_").split("__"))
            .extract()
            .map_err(|e| crate::error::HiveError::Config(e.to_string()))?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// The deployment surface documents a flat set of env names; they win
    /// over anything in the TOML file.
    fn apply_env_overrides(&mut self) -> crate::error::Result<()> {
        use std::env::var;

        if let Ok(v) = var("APP_ENV") {
            self.app_env = match v.as_str() {
                "prod" => AppEnv::Prod,
                "staging" => AppEnv::Staging,
                _ => AppEnv::Dev,
            };
        }
        if let Ok(v) = var("MANAGER_BOT_TOKEN") {
            self.manager.bot_token = v;
        }
        if let Ok(v) = var("TELEGRAM_WEBHOOK_SECRET") {
            self.webhook.manager_secret = v;
        }
        if let Ok(v) = var("WEBHOOK_BASE_URL") {
            self.webhook.base_url = v;
        }
        if let Ok(v) = var("DB_URL") {
            self.database.url = v;
        }
        if let Ok(v) = var("DB_POOL_SIZE") {
            self.database.pool_size = parse_env("DB_POOL_SIZE", &v)?;
        }
        if let Ok(v) = var("DB_MAX_OVERFLOW") {
            self.database.max_overflow = parse_env("DB_MAX_OVERFLOW", &v)?;
        }
        if let Ok(v) = var("REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = var("REDIS_MAX_CONNECTIONS") {
            self.redis.max_connections = parse_env("REDIS_MAX_CONNECTIONS", &v)?;
        }
        if let Ok(v) = var("ENCRYPTION_KEY") {
            self.crypto.encryption_key = v;
        }
        if let Ok(v) = var("ALLOWED_ADMIN_IDS") {
            self.manager.allowed_admin_ids = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<i64>()
                        .map_err(|_| bad_env("ALLOWED_ADMIN_IDS", s))
                })
                .collect::<std::result::Result<_, _>>()?;
        }
        if let Ok(v) = var("RATE_LIMITS_JSON") {
            self.rate_limits = serde_json::from_str(&v)
                .map_err(|e| crate::error::HiveError::Config(format!("RATE_LIMITS_JSON: {e}")))?;
        }
        if let Ok(v) = var("CIRCUIT_BREAKER_FAIL_MAX") {
            self.breaker.fail_max = parse_env("CIRCUIT_BREAKER_FAIL_MAX", &v)?;
        }
        if let Ok(v) = var("CIRCUIT_BREAKER_TIMEOUT") {
            self.breaker.open_secs = parse_env("CIRCUIT_BREAKER_TIMEOUT", &v)?;
        }
        if let Ok(v) = var("WHISPER_API_KEY") {
            self.whisper.api_key = v;
        }
        if let Ok(v) = var("WHISPER_API_BASE") {
            self.whisper.api_base = v;
        }
        if let Ok(v) = var("WHISPER_MODEL") {
            self.whisper.model = v;
        }
        if let Ok(v) = var("WHISPER_TIMEOUT") {
            self.whisper.timeout_secs = parse_env("WHISPER_TIMEOUT", &v)?;
        }
        if let Ok(v) = var("AUDIO_MAX_DURATION") {
            self.whisper.audio_max_duration = parse_env("AUDIO_MAX_DURATION", &v)?;
        }
        if let Ok(v) = var("AUDIO_MAX_SIZE_MB") {
            self.whisper.audio_max_size_mb = parse_env("AUDIO_MAX_SIZE_MB", &v)?;
        }
        if let Ok(v) = var("FFMPEG_BINARY") {
            self.whisper.ffmpeg_binary = v;
        }
        if let Ok(v) = var("PRICE_TEXT_INPUT_PER_MTOK_USD") {
            self.pricing.text_input_per_mtok_usd = parse_env("PRICE_TEXT_INPUT_PER_MTOK_USD", &v)?;
        }
        if let Ok(v) = var("PRICE_TEXT_OUTPUT_PER_MTOK_USD") {
            self.pricing.text_output_per_mtok_usd =
                parse_env("PRICE_TEXT_OUTPUT_PER_MTOK_USD", &v)?;
        }
        if let Ok(v) = var("PRICE_TEXT_CACHED_PER_MTOK_USD") {
            self.pricing.text_cached_per_mtok_usd =
                parse_env("PRICE_TEXT_CACHED_PER_MTOK_USD", &v)?;
        }
        if let Ok(v) = var("WHISPER_COST_PER_MINUTE_USD") {
            self.pricing.whisper_cost_per_minute_usd =
                parse_env("WHISPER_COST_PER_MINUTE_USD", &v)?;
        }
        if let Ok(v) = var("USD_TO_BRL_RATE") {
            self.pricing.usd_to_brl_rate = parse_env("USD_TO_BRL_RATE", &v)?;
        }
        if let Ok(v) = var("ESTIMATED_CHARS_PER_TOKEN") {
            self.pricing.estimated_chars_per_token = parse_env("ESTIMATED_CHARS_PER_TOKEN", &v)?;
        }
        if let Ok(v) = var("PUSHINRECARGA") {
            self.pix.topup_token = v;
        }
        if let Ok(v) = var("ENABLE_SALE_NOTIFICATIONS") {
            self.manager.enable_sale_notifications = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = var("SENTRY_DSN") {
            self.logging.sentry_dsn = Some(v);
        }
        Ok(())
    }

    /// Whether this admin bypasses credit checks entirely.
    pub fn is_unlimited_admin(&self, admin_id: i64) -> bool {
        self.manager.allowed_admin_ids.contains(&admin_id)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::error::Result<T> {
    value.parse().map_err(|_| bad_env(name, value))
}

fn bad_env(name: &str, value: &str) -> crate::error::HiveError {
    crate::error::HiveError::Config(format!("invalid value for {name}: {value:?}"))
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.hive/hive.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_concurrency_matches_documented_values() {
        let q = QueuesConfig::default();
        assert_eq!(q.concurrency_for("default"), 10);
        assert_eq!(q.concurrency_for("ai"), 4);
        assert_eq!(q.concurrency_for("recovery"), 2);
        // Unknown queues fall back to 2.
        assert_eq!(q.concurrency_for("nope"), 2);
    }

    #[test]
    fn default_queue_deadlines() {
        let q = QueuesConfig::default();
        assert_eq!(q.deadline_for("default"), 120);
        assert_eq!(q.deadline_for("ai"), 180);
        assert_eq!(q.deadline_for("media"), 300);
        assert_eq!(q.deadline_for("recovery"), 120);
    }

    #[test]
    fn unlimited_admin_lookup() {
        let mut cfg = HiveConfig::default();
        cfg.manager.allowed_admin_ids = vec![42, 99];
        assert!(cfg.is_unlimited_admin(42));
        assert!(!cfg.is_unlimited_admin(7));
    }

    #[test]
    fn rate_limits_json_shape_parses() {
        let parsed: HashMap<String, RateLimitRule> =
            serde_json::from_str(r#"{"message": {"limit": 20, "window_s": 60}}"#).unwrap();
        assert_eq!(parsed["message"].limit, 20);
        assert_eq!(parsed["message"].window_s, 60);
    }
}
