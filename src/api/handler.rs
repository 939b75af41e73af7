use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::async_webhook::{AsyncWebhookProcessor, WebhookAcceptedResponse};
use super::models::*;
use crate::{
    error::{AppError, AppResult},
    ledger::{
        models::{ObligationFilter, SettlementObligation},
        SettlementLedger,
    },
    payout::{PayoutOrchestrator, SettlementOutcome},
    records::{FinalizedRecord, NewWorkRecord, WorkRecordService, WorkRecordView},
    webhook::{ProviderEvent, SignatureVerifier, SIGNATURE_HEADER},
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: SettlementLedger,
    pub records: WorkRecordService,
    pub orchestrator: Arc<PayoutOrchestrator>,
    pub webhooks: Arc<AsyncWebhookProcessor>,
    pub verifier: SignatureVerifier,
    /// "postgres" or "memory"
    pub store_kind: &'static str,
}

// ========== WORK RECORDS ==========

/// Accept a finalized shift
/// POST /work-records
pub async fn finalize_work_record(
    State(state): State<AppState>,
    Json(request): Json<NewWorkRecord>,
) -> AppResult<(StatusCode, Json<FinalizedRecord>)> {
    info!(
        "📥 Finalizing shift {} for booking {}",
        request.shift_key, request.booking_id
    );
    validate_request(&request)?;

    let finalized = state.records.finalize(request).await?;
    let status = if finalized.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(finalized)))
}

/// GET /work-records/:id
pub async fn get_work_record(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkRecordView>> {
    Ok(Json(state.records.get(id).await?))
}

/// Supersede a work record with a corrected one
/// POST /work-records/:id/corrections
pub async fn correct_work_record(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CorrectionRequest>,
) -> AppResult<(StatusCode, Json<FinalizedRecord>)> {
    validate_request(&request)?;
    validate_request(&request.record)?;

    info!("✏️ Correction of work record {} by {}", id, request.operator_id);
    let finalized = state
        .records
        .supersede(id, request.record, &request.operator_id, &request.reason)
        .await?;

    Ok((StatusCode::CREATED, Json(finalized)))
}

// ========== OBLIGATIONS ==========

/// GET /obligations?payee_id&status&role
pub async fn list_obligations(
    State(state): State<AppState>,
    Query(query): Query<ObligationQuery>,
) -> AppResult<Json<ObligationListResponse>> {
    let filter: ObligationFilter = query.into();
    let obligations = state.ledger.list_obligations(&filter).await?;
    Ok(Json(obligations.into()))
}

/// Operator reset of a Failed obligation
/// POST /obligations/:id/reset
pub async fn reset_obligation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResetRequest>,
) -> AppResult<Json<SettlementObligation>> {
    validate_request(&request)?;

    let obligation = state
        .ledger
        .reset_to_pending(id, &request.operator_id, &request.justification)
        .await?;
    Ok(Json(obligation))
}

/// GET /obligations/:id/audit
pub async fn obligation_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<AuditTrailResponse>> {
    // 404 for unknown ids rather than an empty trail
    state.ledger.get_obligation(id).await?;
    let entries = state.ledger.audit_trail(id).await?;

    Ok(Json(AuditTrailResponse {
        obligation_id: id,
        entries,
    }))
}

// ========== PAYEES ==========

/// Settle everything outstanding for one payee now
/// POST /payees/:id/settle
pub async fn settle_payee(
    State(state): State<AppState>,
    Path(payee_id): Path<String>,
) -> AppResult<Json<SettlementOutcome>> {
    info!("💸 Manual settlement requested for payee {}", payee_id);
    Ok(Json(state.orchestrator.settle(&payee_id).await?))
}

/// PUT /payees/:id/account
pub async fn put_payee_account(
    State(state): State<AppState>,
    Path(payee_id): Path<String>,
    Json(request): Json<PayeeAccountRequest>,
) -> AppResult<Json<PayeeAccountResponse>> {
    validate_request(&request)?;

    state
        .ledger
        .store()
        .upsert_payee_account(&payee_id, &request.connected_account_id)
        .await?;
    info!("✓ Connected account set for payee {}", payee_id);

    Ok(Json(PayeeAccountResponse {
        payee_id,
        connected_account_id: request.connected_account_id,
    }))
}

// ========== WEBHOOKS ==========

/// Provider transfer events. The signature is checked against the raw body
/// before it is parsed; rejected deliveries never touch the ledger.
/// POST /webhooks/provider
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<WebhookAcceptedResponse>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if let Err(e) = state.verifier.verify(signature, &body, Utc::now()) {
        warn!("⚠️ Rejected provider webhook: {}", e);
        return Err(e);
    }

    let event: ProviderEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("Malformed webhook payload: {}", e)))?;
    info!("📥 Provider webhook {} ({})", event.id, event.event_type);

    let response = state.webhooks.process_webhook_async(event);
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Health check
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    state.ledger.payees_with_outstanding().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        store: state.store_kind.to_string(),
        timestamp: Utc::now(),
    }))
}
