// Settlement Scheduler - periodic payout cycle
//
// Each cycle:
// - Fails obligations stuck InFlight past the bound that never reached the provider;
//   ones whose transfer was issued stay InFlight for the webhook and raise an alert
// - Settles every payee with Pending obligations, one lane per payee,
//   at most `max_parallel_payees` at a time
// - Purges webhook event ids older than the dedup window

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::config::{ScheduleMode, SchedulerConfig};
use crate::error::{AppError, AppResult};
use crate::ledger::SettlementLedger;
use crate::ledger::models::{ObligationStatus, SettlementObligation};
use crate::payout::{PayoutOrchestrator, SettlementOutcome, ABANDONED_REASON};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementFrequency {
    /// Once a day at this UTC hour
    Daily { hour: u32 },
    Interval(Duration),
}

impl SettlementFrequency {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        match config.mode {
            ScheduleMode::Daily => SettlementFrequency::Daily {
                hour: config.daily_hour_utc,
            },
            ScheduleMode::Interval => {
                SettlementFrequency::Interval(Duration::from_secs(config.interval_secs.max(1)))
            }
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Stale obligations failed because no transfer was ever issued
    pub swept: usize,
    /// Stale obligations with an issued transfer, left InFlight
    pub awaiting_confirmation: usize,
    pub paid: usize,
    pub failed: usize,
    pub unrecorded: usize,
    pub skipped: usize,
    pub errors: usize,
    pub purged_events: u64,
}

/// Settlement scheduler - drives the orchestrator for every payee
pub struct SettlementScheduler {
    frequency: SettlementFrequency,
    max_parallel_payees: usize,
    in_flight_timeout: chrono::Duration,
    dedup_window: chrono::Duration,
    ledger: SettlementLedger,
    orchestrator: Arc<PayoutOrchestrator>,
    alerts: Arc<dyn AlertSink>,
}

impl SettlementScheduler {
    pub fn new(
        config: &SchedulerConfig,
        dedup_window: chrono::Duration,
        ledger: SettlementLedger,
        orchestrator: Arc<PayoutOrchestrator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            frequency: SettlementFrequency::from_config(config),
            max_parallel_payees: config.max_parallel_payees.max(1),
            in_flight_timeout: chrono::Duration::seconds(config.in_flight_timeout_secs),
            dedup_window,
            ledger,
            orchestrator,
            alerts,
        }
    }

    /// Start the settlement scheduler (runs in background)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.frequency {
                SettlementFrequency::Daily { hour } => self.run_daily(hour).await,
                SettlementFrequency::Interval(period) => self.run_interval(period).await,
            }
        })
    }

    async fn run_daily(&self, hour: u32) {
        loop {
            let now = Utc::now();
            let next_execution = Self::calculate_next_daily_execution(now, hour);
            let until = next_execution.signed_duration_since(now);

            if until.num_seconds() > 0 {
                info!(
                    "⏰ Next settlement scheduled for: {} UTC",
                    next_execution.format("%Y-%m-%d %H:%M:%S")
                );
                tokio::time::sleep(Duration::from_secs(until.num_seconds() as u64)).await;
            }

            self.run_logged().await;
        }
    }

    async fn run_interval(&self, period: Duration) {
        let mut interval = interval(period);

        loop {
            interval.tick().await;
            self.run_logged().await;
        }
    }

    async fn run_logged(&self) {
        info!("🔄 Starting settlement cycle");
        match self.run_cycle().await {
            Ok(report) => info!(
                swept = report.swept,
                awaiting = report.awaiting_confirmation,
                paid = report.paid,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                purged = report.purged_events,
                "✓ Settlement cycle completed"
            ),
            Err(e) => error!("❌ Settlement cycle failed: {:?}", e),
        }
    }

    /// One full cycle: sweep, settle, purge
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let mut report = CycleReport::default();
        self.sweep_in_flight(&mut report).await?;

        let payees = self.ledger.payees_with_outstanding().await?;
        if payees.is_empty() {
            info!("✓ No payees with outstanding obligations");
        } else {
            info!("📊 Found {} payees with outstanding obligations", payees.len());
        }

        let results: Vec<(String, AppResult<SettlementOutcome>)> = stream::iter(payees)
            .map(|payee_id| {
                let orchestrator = self.orchestrator.clone();
                async move {
                    let result = orchestrator.settle(&payee_id).await;
                    (payee_id, result)
                }
            })
            .buffer_unordered(self.max_parallel_payees)
            .collect()
            .await;

        for (payee_id, result) in results {
            match result {
                Ok(SettlementOutcome::Paid { .. }) => report.paid += 1,
                Ok(SettlementOutcome::Failed { .. }) => report.failed += 1,
                Ok(SettlementOutcome::Unrecorded { .. }) => report.unrecorded += 1,
                Err(AppError::NothingToPay(_)) => report.skipped += 1,
                Err(AppError::PayeeAccountMissing(_)) => {
                    debug!("⏭️ Payee {} has no connected account yet", payee_id);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("❌ Settlement for {} failed: {:?}", payee_id, e);
                    report.errors += 1;
                }
            }
        }

        report.purged_events = self
            .ledger
            .store()
            .purge_events(Utc::now() - self.dedup_window)
            .await?;
        self.orchestrator.lanes().prune();

        Ok(report)
    }

    /// Resolve obligations that stayed InFlight longer than the bound.
    ///
    /// Runs under each payee's lane, so a settle in progress finishes first. An
    /// obligation with a batch key had its transfer issued and cannot be cancelled.
    async fn sweep_in_flight(&self, report: &mut CycleReport) -> AppResult<()> {
        let stale = self.ledger.stale_in_flight(self.in_flight_timeout).await?;
        if stale.is_empty() {
            return Ok(());
        }

        let mut by_payee: BTreeMap<String, Vec<SettlementObligation>> = BTreeMap::new();
        for obligation in stale {
            by_payee
                .entry(obligation.payee_id.clone())
                .or_default()
                .push(obligation);
        }

        let mut abandoned = Vec::new();
        let mut awaiting = Vec::new();

        for (payee_id, obligations) in by_payee {
            let _lane = self.orchestrator.lanes().acquire(&payee_id).await;

            for obligation in obligations {
                let current = self.ledger.get_obligation(obligation.id).await?;
                if current.status != ObligationStatus::InFlight {
                    continue;
                }

                if current.batch_key.is_some() {
                    awaiting.push(current);
                    continue;
                }

                match self.ledger.mark_failed(current.id, ABANDONED_REASON).await {
                    Ok(t) if t.was_applied() => abandoned.push(current),
                    Ok(_) => {}
                    Err(e) => debug!("Skipping sweep of {}: {:?}", current.id, e),
                }
            }
        }

        report.swept = abandoned.len();
        report.awaiting_confirmation = awaiting.len();

        if !abandoned.is_empty() {
            warn!("⚠️ {} claimed obligations never reached the provider", abandoned.len());
            self.alerts
                .raise(
                    Alert::new(
                        AlertKind::PayoutFailed,
                        format!(
                            "{} obligations were claimed but never sent; reset them to retry",
                            abandoned.len()
                        ),
                    )
                    .obligations(abandoned.iter().map(|o| o.id)),
                )
                .await;
        }

        if !awaiting.is_empty() {
            self.alerts
                .raise(
                    Alert::new(
                        AlertKind::InFlightTimeout,
                        format!(
                            "{} obligations have an issued transfer but no confirmation after {}s",
                            awaiting.len(),
                            self.in_flight_timeout.num_seconds()
                        ),
                    )
                    .obligations(awaiting.iter().map(|o| o.id))
                    .details(json!({
                        "batch_keys": awaiting.iter().map(|o| o.batch_key.clone()).collect::<Vec<_>>(),
                    })),
                )
                .await;
        }

        Ok(())
    }

    /// Calculate next daily execution time
    fn calculate_next_daily_execution(now: DateTime<Utc>, execution_hour: u32) -> DateTime<Utc> {
        let at = NaiveTime::from_hms_opt(execution_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));

        // If execution time has passed today, schedule for tomorrow
        if today <= now {
            today + chrono::Duration::days(1)
        } else {
            today
        }
    }
}
