use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult, LedgerError};
use crate::split::SplitBreakdown;

const WORK_RECORD_COLUMNS: &str = r#"
    id, finalize_key, booking_id, client_id, contractor_id, marketing_partner_id,
    training_center_id, started_at, ended_at, minutes_worked, client_hourly_rate,
    contractor_hourly_rate, marketing_commission_rate, training_commission_rate,
    client_charge, contractor_earnings, marketing_payout, training_payout,
    agency_retained, supersedes, created_at
"#;

const OBLIGATION_COLUMNS: &str = r#"
    id, work_record_id, payee_role, payee_id, amount_owed, status, idempotency_key,
    batch_key, external_transfer_id, attempt_count, attempt_started_at, paid_at,
    failure_reason, created_at, updated_at
"#;

const REVERSAL_COLUMNS: &str =
    "id, obligation_id, work_record_id, amount, transfer_id, event_id, reason, created_at";

/// Postgres ledger repository - THE source of truth for settlement state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn fetch_obligations(&self, sql: &str, bind: &str) -> AppResult<Vec<SettlementObligation>> {
        let rows = sqlx::query(sql).bind(bind).fetch_all(&self.pool).await?;
        rows.iter().map(obligation_from_row).collect()
    }
}

fn is_unique_violation(error: &sqlx::Error, constraint: Option<&str>) -> bool {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => match constraint {
            Some(name) => db.constraint() == Some(name),
            None => true,
        },
        _ => false,
    }
}

fn work_record_from_row(row: &PgRow) -> AppResult<WorkRecord> {
    Ok(WorkRecord {
        id: row.try_get("id")?,
        finalize_key: row.try_get("finalize_key")?,
        booking_id: row.try_get("booking_id")?,
        client_id: row.try_get("client_id")?,
        payees: PayeeRefs {
            contractor_id: row.try_get("contractor_id")?,
            marketing_partner_id: row.try_get("marketing_partner_id")?,
            training_center_id: row.try_get("training_center_id")?,
        },
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        minutes_worked: row.try_get("minutes_worked")?,
        rates: RateSnapshot {
            client_hourly_rate: row.try_get("client_hourly_rate")?,
            contractor_hourly_rate: row.try_get("contractor_hourly_rate")?,
            marketing_commission_rate: row.try_get("marketing_commission_rate")?,
            training_commission_rate: row.try_get("training_commission_rate")?,
        },
        breakdown: SplitBreakdown {
            client_charge: row.try_get("client_charge")?,
            contractor_earnings: row.try_get("contractor_earnings")?,
            marketing_payout: row.try_get("marketing_payout")?,
            training_payout: row.try_get("training_payout")?,
            agency_retained: row.try_get("agency_retained")?,
        },
        supersedes: row.try_get("supersedes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn obligation_from_row(row: &PgRow) -> AppResult<SettlementObligation> {
    let role: String = row.try_get("payee_role")?;
    let status: String = row.try_get("status")?;

    Ok(SettlementObligation {
        id: row.try_get("id")?,
        work_record_id: row.try_get("work_record_id")?,
        payee_role: role.parse()?,
        payee_id: row.try_get("payee_id")?,
        amount_owed: row.try_get("amount_owed")?,
        status: status.parse()?,
        idempotency_key: row.try_get("idempotency_key")?,
        batch_key: row.try_get("batch_key")?,
        external_transfer_id: row.try_get("external_transfer_id")?,
        attempt_count: row.try_get("attempt_count")?,
        attempt_started_at: row.try_get("attempt_started_at")?,
        paid_at: row.try_get("paid_at")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn reversal_from_row(row: &PgRow) -> AppResult<Reversal> {
    Ok(Reversal {
        id: row.try_get("id")?,
        obligation_id: row.try_get("obligation_id")?,
        work_record_id: row.try_get("work_record_id")?,
        amount: row.try_get("amount")?,
        transfer_id: row.try_get("transfer_id")?,
        event_id: row.try_get("event_id")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> AppResult<AuditEntry> {
    let event_type: String = row.try_get("event_type")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        event_type: event_type.parse()?,
        work_record_id: row.try_get("work_record_id")?,
        obligation_id: row.try_get("obligation_id")?,
        actor: row.try_get("actor")?,
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== WORK RECORD OPERATIONS ==========

    async fn insert_work_record(&self, record: &WorkRecord) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO work_records (
                id, finalize_key, booking_id, client_id, contractor_id, marketing_partner_id,
                training_center_id, started_at, ended_at, minutes_worked, client_hourly_rate,
                contractor_hourly_rate, marketing_commission_rate, training_commission_rate,
                client_charge, contractor_earnings, marketing_payout, training_payout,
                agency_retained, supersedes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(record.id)
        .bind(&record.finalize_key)
        .bind(&record.booking_id)
        .bind(&record.client_id)
        .bind(&record.payees.contractor_id)
        .bind(&record.payees.marketing_partner_id)
        .bind(&record.payees.training_center_id)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.minutes_worked)
        .bind(record.rates.client_hourly_rate)
        .bind(record.rates.contractor_hourly_rate)
        .bind(record.rates.marketing_commission_rate)
        .bind(record.rates.training_commission_rate)
        .bind(record.breakdown.client_charge)
        .bind(record.breakdown.contractor_earnings)
        .bind(record.breakdown.marketing_payout)
        .bind(record.breakdown.training_payout)
        .bind(record.breakdown.agency_retained)
        .bind(record.supersedes)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e, Some("work_records_supersedes_idx")) => {
                Err(AppError::StateConflict(format!(
                    "Work record {} was already superseded",
                    record.supersedes.map(|id| id.to_string()).unwrap_or_default()
                )))
            }
            Err(e) if is_unique_violation(&e, None) => {
                Err(LedgerError::DuplicateWorkRecord(record.finalize_key.clone()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_work_record(&self, id: Uuid) -> AppResult<Option<WorkRecord>> {
        let sql = format!("SELECT {} FROM work_records WHERE id = $1", WORK_RECORD_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(work_record_from_row)
            .transpose()
    }

    async fn find_work_record_by_key(&self, finalize_key: &str) -> AppResult<Option<WorkRecord>> {
        let sql = format!(
            "SELECT {} FROM work_records WHERE finalize_key = $1",
            WORK_RECORD_COLUMNS
        );
        sqlx::query(&sql)
            .bind(finalize_key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(work_record_from_row)
            .transpose()
    }

    async fn find_superseding(&self, id: Uuid) -> AppResult<Option<WorkRecord>> {
        let sql = format!(
            "SELECT {} FROM work_records WHERE supersedes = $1",
            WORK_RECORD_COLUMNS
        );
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(work_record_from_row)
            .transpose()
    }

    // ========== OBLIGATION OPERATIONS ==========

    /// All-or-nothing insert, serialized on the work record row
    async fn insert_obligations(
        &self,
        work_record_id: Uuid,
        obligations: &[SettlementObligation],
    ) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        // Lock the parent row so two concurrent creators cannot both see "no obligations"
        let locked = sqlx::query("SELECT id FROM work_records WHERE id = $1 FOR UPDATE")
            .bind(work_record_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(LedgerError::WorkRecordNotFound(work_record_id).into());
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM settlement_obligations WHERE work_record_id = $1",
        )
        .bind(work_record_id)
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            return Err(LedgerError::DuplicateObligation(work_record_id).into());
        }

        for obligation in obligations {
            let result = sqlx::query(
                r#"
                INSERT INTO settlement_obligations (
                    id, work_record_id, payee_role, payee_id, amount_owed, status,
                    idempotency_key, attempt_count, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(obligation.id)
            .bind(obligation.work_record_id)
            .bind(obligation.payee_role.as_str())
            .bind(&obligation.payee_id)
            .bind(obligation.amount_owed)
            .bind(obligation.status.as_str())
            .bind(&obligation.idempotency_key)
            .bind(obligation.attempt_count)
            .bind(obligation.created_at)
            .bind(obligation.updated_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e, None) => {
                    return Err(LedgerError::DuplicateObligation(work_record_id).into())
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        debug!(
            "Inserted {} obligations for work record {}",
            obligations.len(),
            work_record_id
        );
        Ok(())
    }

    async fn get_obligation(&self, id: Uuid) -> AppResult<Option<SettlementObligation>> {
        let sql = format!(
            "SELECT {} FROM settlement_obligations WHERE id = $1",
            OBLIGATION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(obligation_from_row)
            .transpose()
    }

    async fn obligations_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<SettlementObligation>> {
        let sql = format!(
            "SELECT {} FROM settlement_obligations WHERE work_record_id = $1 ORDER BY created_at, payee_role, id",
            OBLIGATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(work_record_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(obligation_from_row).collect()
    }

    async fn find_by_transfer_id(&self, transfer_id: &str) -> AppResult<Vec<SettlementObligation>> {
        let sql = format!(
            "SELECT {} FROM settlement_obligations WHERE external_transfer_id = $1 ORDER BY created_at, id",
            OBLIGATION_COLUMNS
        );
        self.fetch_obligations(&sql, transfer_id).await
    }

    async fn find_by_batch_key(&self, batch_key: &str) -> AppResult<Vec<SettlementObligation>> {
        let sql = format!(
            "SELECT {} FROM settlement_obligations WHERE batch_key = $1 ORDER BY created_at, id",
            OBLIGATION_COLUMNS
        );
        self.fetch_obligations(&sql, batch_key).await
    }

    async fn list_obligations(&self, filter: &ObligationFilter) -> AppResult<Vec<SettlementObligation>> {
        let sql = format!(
            r#"
            SELECT {} FROM settlement_obligations
            WHERE ($1::TEXT IS NULL OR payee_id = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR payee_role = $3)
              AND ($4::UUID IS NULL OR work_record_id = $4)
            ORDER BY created_at, payee_role, id
            "#,
            OBLIGATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(filter.payee_id.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.payee_role.map(|r| r.as_str()))
            .bind(filter.work_record_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(obligation_from_row).collect()
    }

    async fn in_flight_started_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<SettlementObligation>> {
        let sql = format!(
            r#"
            SELECT {} FROM settlement_obligations
            WHERE status = 'in_flight' AND (attempt_started_at IS NULL OR attempt_started_at < $1)
            ORDER BY attempt_started_at
            "#,
            OBLIGATION_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter().map(obligation_from_row).collect()
    }

    async fn payees_with_outstanding(&self) -> AppResult<Vec<String>> {
        let payees: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT payee_id FROM settlement_obligations WHERE status = 'pending' ORDER BY payee_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(payees)
    }

    /// SECURITY: the `status = $2` guard is the double-payment defense. Only one
    /// caller can move a row out of a given status.
    async fn transition(
        &self,
        id: Uuid,
        from: ObligationStatus,
        to: ObligationStatus,
        change: &StatusChange,
    ) -> AppResult<Option<SettlementObligation>> {
        let sql = format!(
            r#"
            UPDATE settlement_obligations
            SET status = $3,
                updated_at = NOW(),
                batch_key = CASE WHEN $4 THEN $5 ELSE batch_key END,
                external_transfer_id = CASE WHEN $6 THEN $7 ELSE external_transfer_id END,
                paid_at = CASE WHEN $8 THEN $9 ELSE paid_at END,
                failure_reason = CASE WHEN $10 THEN $11 ELSE failure_reason END,
                attempt_started_at = CASE WHEN $12 THEN $13 ELSE attempt_started_at END,
                attempt_count = attempt_count + $14
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            OBLIGATION_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(change.batch_key.is_some())
            .bind(change.batch_key.clone().flatten())
            .bind(change.external_transfer_id.is_some())
            .bind(change.external_transfer_id.clone().flatten())
            .bind(change.paid_at.is_some())
            .bind(change.paid_at.flatten())
            .bind(change.failure_reason.is_some())
            .bind(change.failure_reason.clone().flatten())
            .bind(change.attempt_started_at.is_some())
            .bind(change.attempt_started_at.flatten())
            .bind(if change.increment_attempts { 1i32 } else { 0i32 })
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(obligation_from_row(&row)?)),
            None => {
                let exists: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM settlement_obligations WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(LedgerError::ObligationNotFound(id).into()),
                }
            }
        }
    }

    // ========== REVERSALS ==========

    async fn insert_reversal(&self, reversal: &Reversal) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO obligation_reversals (
                id, obligation_id, work_record_id, amount, transfer_id, event_id, reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (obligation_id, event_id) DO NOTHING
            "#,
        )
        .bind(reversal.id)
        .bind(reversal.obligation_id)
        .bind(reversal.work_record_id)
        .bind(reversal.amount)
        .bind(&reversal.transfer_id)
        .bind(&reversal.event_id)
        .bind(&reversal.reason)
        .bind(reversal.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reversals_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<Reversal>> {
        let sql = format!(
            "SELECT {} FROM obligation_reversals WHERE work_record_id = $1 ORDER BY created_at",
            REVERSAL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(work_record_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(reversal_from_row).collect()
    }

    // ========== AUDIT LOG ==========

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_audit_log (id, event_type, work_record_id, obligation_id, actor, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_type.as_str())
        .bind(entry.work_record_id)
        .bind(entry.obligation_id)
        .bind(&entry.actor)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn audit_for_obligation(&self, obligation_id: Uuid) -> AppResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, work_record_id, obligation_id, actor, details, created_at
            FROM settlement_audit_log
            WHERE obligation_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(obligation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }

    // ========== PAYEE ACCOUNTS ==========

    async fn upsert_payee_account(&self, payee_id: &str, connected_account_id: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payee_accounts (payee_id, connected_account_id)
            VALUES ($1, $2)
            ON CONFLICT (payee_id)
            DO UPDATE SET connected_account_id = EXCLUDED.connected_account_id, updated_at = NOW()
            "#,
        )
        .bind(payee_id)
        .bind(connected_account_id)
        .execute(&self.pool)
        .await?;

        info!("Connected account updated for payee {}", payee_id);
        Ok(())
    }

    async fn payee_account(&self, payee_id: &str) -> AppResult<Option<String>> {
        let account: Option<String> = sqlx::query_scalar(
            "SELECT connected_account_id FROM payee_accounts WHERE payee_id = $1",
        )
        .bind(payee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    // ========== WEBHOOK DEDUP ==========

    async fn claim_event(&self, event_id: &str, now: DateTime<Utc>, window_start: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, claimed_at)
            VALUES ($1, $2)
            ON CONFLICT (event_id)
            DO UPDATE SET claimed_at = EXCLUDED.claimed_at
            WHERE processed_webhook_events.claimed_at < $3
            "#,
        )
        .bind(event_id)
        .bind(now)
        .bind(window_start)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_event(&self, event_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_events(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE claimed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}


/// Run against a live Postgres; each test returns early when DATABASE_URL is unset.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SettlementLedger;
    use crate::testing::{reference_record, seed_record};
    use chrono::Duration;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    async fn repository() -> Option<Arc<LedgerRepository>> {
        let url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty())?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Some(Arc::new(LedgerRepository::new(pool)))
    }

    fn claim(now: DateTime<Utc>) -> StatusChange {
        StatusChange {
            attempt_started_at: Some(Some(now)),
            increment_attempts: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transition_moves_a_row_out_of_a_status_once() {
        let Some(repo) = repository().await else {
            return;
        };
        let ledger = SettlementLedger::new(repo.clone());
        let record = reference_record(&format!("pg-{}", Uuid::new_v4()));
        let obligations = seed_record(&ledger, &record).await;
        let id = obligations[0].id;
        let now = Utc::now();

        let moved = repo
            .transition(id, ObligationStatus::Pending, ObligationStatus::InFlight, &claim(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.status, ObligationStatus::InFlight);
        assert_eq!(moved.attempt_count, 1);
        assert!(moved.attempt_started_at.is_some());
        assert_eq!(moved.batch_key, None);

        // the row already left Pending
        let second = repo
            .transition(id, ObligationStatus::Pending, ObligationStatus::InFlight, &claim(now))
            .await
            .unwrap();
        assert!(second.is_none());

        let paid = repo
            .transition(
                id,
                ObligationStatus::InFlight,
                ObligationStatus::Paid,
                &StatusChange {
                    external_transfer_id: Some(Some("tr_pg".to_string())),
                    paid_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paid.external_transfer_id.as_deref(), Some("tr_pg"));
        assert_eq!(paid.attempt_count, 1);
        assert!(paid.attempt_started_at.is_some());

        let missing = repo
            .transition(Uuid::new_v4(), ObligationStatus::Pending, ObligationStatus::InFlight, &claim(now))
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::Ledger(LedgerError::ObligationNotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let Some(repo) = repository().await else {
            return;
        };
        let ledger = SettlementLedger::new(repo.clone());
        let record = reference_record(&format!("pg-{}", Uuid::new_v4()));
        let id = seed_record(&ledger, &record).await[0].id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.transition(id, ObligationStatus::Pending, ObligationStatus::InFlight, &claim(Utc::now()))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(repo.get_obligation(id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_claim_event_within_and_after_window() {
        let Some(repo) = repository().await else {
            return;
        };
        let event_id = format!("evt_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let window_start = now - Duration::hours(72);

        assert!(repo.claim_event(&event_id, now, window_start).await.unwrap());
        assert!(!repo.claim_event(&event_id, now, window_start).await.unwrap());

        // a claim older than the window can be taken again
        let later = now + Duration::hours(73);
        assert!(repo
            .claim_event(&event_id, later, later - Duration::hours(72))
            .await
            .unwrap());

        repo.release_event(&event_id).await.unwrap();
        assert!(repo.claim_event(&event_id, later, window_start).await.unwrap());
        repo.release_event(&event_id).await.unwrap();
    }
}
