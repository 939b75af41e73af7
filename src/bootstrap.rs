use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    alerts::{AlertSink, TracingAlertSink},
    api::{AppState, AsyncWebhookProcessor},
    config::Config,
    error::{AppError, AppResult},
    ledger::{InMemoryLedgerStore, LedgerRepository, LedgerStore, SettlementLedger},
    payout::{PayoutOrchestrator, RetryPolicy},
    provider::{ErrorClassifier, HttpPaymentProvider, PaymentProvider},
    records::WorkRecordService,
    settlement::SettlementScheduler,
    webhook::{SignatureVerifier, WebhookReconciler},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Ledger store
    let (store, store_kind): (Arc<dyn LedgerStore>, &'static str) = match &config.database_url {
        Some(url) => {
            let pool = initialize_database(url).await?;
            (Arc::new(LedgerRepository::new(pool)), "postgres")
        }
        None => {
            warn!("⚠️  No database url configured - using in-memory ledger (state is lost on restart)");
            (Arc::new(InMemoryLedgerStore::new()), "memory")
        }
    };

    // Payment provider
    let provider: Arc<dyn PaymentProvider> = Arc::new(HttpPaymentProvider::new(&config.provider)?);
    info!("✅ Payment provider client initialized: {}", config.provider.base_url);

    if config.webhook.secret.is_empty() {
        warn!("⚠️  Webhook secret not set - all provider webhooks will be rejected");
    }

    let state = assemble_state(config, store, store_kind, provider);

    if config.scheduler.enabled {
        let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink::new(state.ledger.store().clone()));
        let scheduler = Arc::new(SettlementScheduler::new(
            &config.scheduler,
            chrono::Duration::hours(config.webhook.dedup_window_hours),
            state.ledger.clone(),
            state.orchestrator.clone(),
            alerts,
        ));
        scheduler.start();
        info!("✅ Settlement scheduler started ({:?})", config.scheduler.mode);
    } else {
        info!("⏭️ Settlement scheduler disabled");
    }

    Ok(state)
}

/// Wire every component around an already chosen store and provider
pub fn assemble_state(
    config: &Config,
    store: Arc<dyn LedgerStore>,
    store_kind: &'static str,
    provider: Arc<dyn PaymentProvider>,
) -> AppState {
    let ledger = SettlementLedger::new(store.clone());
    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink::new(store));

    let orchestrator = Arc::new(PayoutOrchestrator::new(
        ledger.clone(),
        provider,
        alerts.clone(),
        ErrorClassifier::new(&config.classification),
        RetryPolicy::from_config(&config.retry, &config.provider),
        config.currency.clone(),
    ));
    info!("✅ Payout orchestrator initialized (currency: {})", config.currency);

    let reconciler = Arc::new(WebhookReconciler::new(
        ledger.clone(),
        alerts.clone(),
        chrono::Duration::hours(config.webhook.dedup_window_hours),
    ));

    AppState {
        records: WorkRecordService::new(ledger.clone()),
        ledger,
        orchestrator,
        webhooks: Arc::new(AsyncWebhookProcessor::new(reconciler, alerts)),
        verifier: SignatureVerifier::from_config(&config.webhook),
        store_kind,
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))?;

    info!("✓ Database initialized");
    Ok(pool)
}
