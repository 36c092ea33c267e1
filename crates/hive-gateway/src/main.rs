use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

mod app;
mod http;
mod logging;

use hive_blocks::{delete::DeleteMessageHandler, BlockSender, BotRegistry};
use hive_clients::{CircuitBreaker, LlmClient, PixClient, WhisperClient};
use hive_core::config::{AppEnv, HiveConfig};
use hive_core::crypto::{CallbackSigner, TokenCipher};
use hive_core::metrics::Metrics;
use hive_engine::{
    EngineCtx, ManagerUpdateHandler, ProcessAudioHandler, ProcessMessageHandler,
    UpdateRouterHandler,
};
use hive_kv::{Kv, RateLimiter};
use hive_payments::{
    CreditService, DeliverUpsellHandler, PaymentPoll, PaymentService, SaleApprovedHandler,
    SaleNotificationHandler,
};
use hive_queue::{TaskQueue, WorkerPool};
use hive_scheduler::{CheckInactiveHandler, RecoveryStepHandler, UpsellSweep};
use hive_store::Store;

#[derive(Parser, Debug)]
#[command(name = "hive-gateway", about = "Multi-tenant Telegram bot platform")]
struct Cli {
    /// Path to hive.toml (defaults to ~/.hive/hive.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(HiveConfig::load(cli.config.as_deref())?);
    init_tracing(&config);

    info!(env = ?config.app_env, "hive gateway starting");

    // --- shared infrastructure ---------------------------------------------
    let metrics = Arc::new(Metrics::default());
    let store = Arc::new(Store::open(&config.database.url)?);
    let kv = Arc::new(Kv::new(&config.redis.url)?);
    let queue = TaskQueue::new(Arc::clone(&kv));
    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&kv),
        config.rate_limits.clone(),
    ));

    let cipher = Arc::new(TokenCipher::new(&config.crypto.encryption_key)?);
    let signer = Arc::new(CallbackSigner::new(&config.crypto.encryption_key)?);

    // One breaker per external service, shared by every caller in-process.
    let telegram_breaker = Arc::new(CircuitBreaker::new("telegram", &config.breaker));
    let llm_breaker = Arc::new(CircuitBreaker::new("llm", &config.breaker));
    let whisper_breaker = Arc::new(CircuitBreaker::new("whisper", &config.breaker));
    let pix_breaker = Arc::new(CircuitBreaker::new("pix", &config.breaker));

    let registry = Arc::new(BotRegistry::new(
        Arc::clone(&store),
        Arc::clone(&cipher),
        Arc::clone(&telegram_breaker),
        &config.manager.bot_token,
    ));
    let sender = Arc::new(BlockSender::new(
        Arc::clone(&store),
        queue.clone(),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    ));

    let llm = Arc::new(LlmClient::new(&config.llm, Arc::clone(&llm_breaker)));
    let whisper = Arc::new(WhisperClient::new(
        &config.whisper,
        Arc::clone(&whisper_breaker),
    ));
    let pix = Arc::new(PixClient::new(
        &config.pix.base_url,
        &config.pix.token,
        config.pix.timeout_secs,
        Arc::clone(&pix_breaker),
    ));
    let pix_topup = Arc::new(PixClient::new(
        &config.pix.base_url,
        &config.pix.topup_token,
        config.pix.timeout_secs,
        Arc::clone(&pix_breaker),
    ));

    let credits = Arc::new(CreditService::new(
        Arc::clone(&store),
        config.pricing.clone(),
        config.manager.allowed_admin_ids.clone(),
        Arc::clone(&metrics),
    ));
    let payments = Arc::new(PaymentService::new(
        Arc::clone(&store),
        Arc::clone(&pix),
        Arc::clone(&pix_topup),
    ));
    let upsells = Arc::new(DeliverUpsellHandler::new(
        Arc::clone(&store),
        Arc::clone(&sender),
        Arc::clone(&payments),
    ));

    let engine = Arc::new(EngineCtx {
        store: Arc::clone(&store),
        kv: Arc::clone(&kv),
        limiter,
        queue: queue.clone(),
        llm,
        whisper,
        credits: Arc::clone(&credits),
        sender: Arc::clone(&sender),
        registry: Arc::clone(&registry),
        payments: Arc::clone(&payments),
        upsells: Arc::clone(&upsells),
        signer,
        metrics: Arc::clone(&metrics),
        config: Arc::clone(&config),
    });

    // --- task handlers -----------------------------------------------------
    let mut pool = WorkerPool::new(queue.clone(), config.queues.clone(), Arc::clone(&metrics));
    pool.register(Arc::new(UpdateRouterHandler::new(Arc::clone(&engine))));
    pool.register(Arc::new(ManagerUpdateHandler::new(Arc::clone(&engine))));
    pool.register(Arc::new(ProcessMessageHandler::new(Arc::clone(&engine))));
    pool.register(Arc::new(ProcessAudioHandler::new(Arc::clone(&engine))));
    pool.register(Arc::new(CheckInactiveHandler::new(
        Arc::clone(&store),
        queue.clone(),
    )));
    pool.register(Arc::new(RecoveryStepHandler::new(
        Arc::clone(&store),
        queue.clone(),
        Arc::clone(&sender),
        Arc::clone(&metrics),
    )));
    pool.register(upsells);
    pool.register(Arc::new(SaleApprovedHandler::new(
        Arc::clone(&store),
        Arc::clone(&kv),
        queue.clone(),
        Arc::clone(&sender),
        Arc::clone(&credits),
        Arc::clone(&metrics),
        config.manager.enable_sale_notifications,
        config.payments.upsell_activation_any_paid,
    )));
    pool.register(Arc::new(SaleNotificationHandler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
    )));
    pool.register(Arc::new(DeleteMessageHandler::new(Arc::clone(&registry))));

    // --- background loops --------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(pool);
    tokio::spawn(Arc::clone(&pool).run(shutdown_rx.clone()));

    let sweep = UpsellSweep::new(Arc::clone(&store), queue.clone(), 60);
    tokio::spawn(sweep.run(shutdown_rx.clone()));

    let poll = PaymentPoll::new(
        Arc::clone(&store),
        payments,
        queue.clone(),
        config.pix.poll_interval_secs,
    );
    tokio::spawn(poll.run(shutdown_rx.clone()));

    register_webhooks(&config, &store, &registry).await;

    // --- HTTP surface ------------------------------------------------------
    let state = Arc::new(app::AppState {
        config: Arc::clone(&config),
        store,
        kv,
        queue,
        metrics,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
    info!(%addr, "ingress listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

fn init_tracing(config: &HiveConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(logging::RedactingStdout);
    if config.app_env == AppEnv::Prod {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Point every active bot's webhook at this deployment. Failures are logged
/// and retried on the next restart rather than blocking startup.
async fn register_webhooks(config: &HiveConfig, store: &Store, registry: &BotRegistry) {
    if config.webhook.base_url.is_empty() {
        warn!("WEBHOOK_BASE_URL unset; skipping webhook registration");
        return;
    }
    let base = config.webhook.base_url.trim_end_matches('/');
    let bots = match store.list_active_bots() {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "could not list bots for webhook registration");
            return;
        }
    };
    for bot in bots {
        let url = format!("{base}/webhook/{}", bot.id);
        match registry.client_for(bot.id) {
            Ok(client) => {
                if let Err(e) = client.set_webhook(&url, &bot.webhook_secret).await {
                    warn!(bot_id = bot.id, error = %e, "webhook registration failed");
                }
            }
            Err(e) => warn!(bot_id = bot.id, error = %e, "bot client unavailable"),
        }
    }
    if !config.manager.bot_token.is_empty() {
        let url = format!("{base}/webhook/manager");
        if let Err(e) = registry
            .manager()
            .set_webhook(&url, &config.webhook.manager_secret)
            .await
        {
            warn!(error = %e, "manager webhook registration failed");
        }
    }
}
