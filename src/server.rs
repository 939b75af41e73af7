use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    correct_work_record, finalize_work_record, get_work_record, health_check, list_obligations,
    obligation_audit, provider_webhook, put_payee_account, reset_obligation, settle_payee, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Upstream booking system
                .route("/work-records", post(finalize_work_record))
                .route("/work-records/:id", get(get_work_record))
                .route("/work-records/:id/corrections", post(correct_work_record))
                // Provider webhooks
                .route("/webhooks/provider", post(provider_webhook))
                // Operator surface
                .route("/obligations", get(list_obligations))
                .route("/obligations/:id/reset", post(reset_obligation))
                .route("/obligations/:id/audit", get(obligation_audit))
                .route("/payees/:id/settle", post(settle_payee))
                .route("/payees/:id/account", put(put_payee_account)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::assemble_state;
    use crate::config::{Config, WebhookConfig};
    use crate::ledger::InMemoryLedgerStore;
    use crate::testing::FakeProvider;
    use crate::webhook::signature::signature_header;
    use crate::webhook::SIGNATURE_HEADER;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use std::str::FromStr;
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "whsec_test";

    async fn test_app() -> Router {
        let config = Config {
            webhook: WebhookConfig {
                secret: SECRET.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let state = assemble_state(
            &config,
            Arc::new(InMemoryLedgerStore::new()),
            "memory",
            Arc::new(FakeProvider::new()),
        );
        create_app(state).await
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn shift() -> Value {
        json!({
            "booking_id": "booking-42",
            "shift_key": "2024-06-01",
            "client_id": "client-1",
            "contractor_id": "worker-1",
            "marketing_partner_id": "mp-1",
            "training_center_id": "tc-1",
            "started_at": "2024-06-01T08:00:00Z",
            "ended_at": "2024-06-01T15:45:00Z",
            "client_hourly_rate": "40",
            "contractor_hourly_rate": "28",
            "marketing_commission_rate": "1",
            "training_commission_rate": "0.50"
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_finalize_settle_and_list() {
        let app = test_app().await;

        let (status, body) = send(&app, json_request(Method::POST, "/api/v1/work-records", shift())).await;
        assert_eq!(status, StatusCode::CREATED);
        let contractor = body["obligations"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["payee_id"] == "worker-1")
            .cloned()
            .unwrap();
        assert_eq!(
            Decimal::from_str(contractor["amount_owed"].as_str().unwrap()).unwrap(),
            dec!(217.00)
        );

        // replay of the same shift is accepted without creating anything
        let (status, replay) = send(&app, json_request(Method::POST, "/api/v1/work-records", shift())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay["record"]["id"], body["record"]["id"]);

        let (status, _) = send(
            &app,
            json_request(
                Method::PUT,
                "/api/v1/payees/worker-1/account",
                json!({ "connected_account_id": "acct_worker" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, outcome) = send(
            &app,
            json_request(Method::POST, "/api/v1/payees/worker-1/settle", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["status"], "paid");

        let request = Request::builder()
            .uri("/api/v1/obligations?payee_id=worker-1&status=paid")
            .body(Body::empty())
            .unwrap();
        let (status, list) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["count"], 1);
        assert_eq!(list["obligations"][0]["external_transfer_id"], outcome["transfer_id"]);

        // nothing left for this payee
        let (status, _) = send(
            &app,
            json_request(Method::POST, "/api/v1/payees/worker-1/settle", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reset_requires_justification() {
        let app = test_app().await;
        let uri = format!("/api/v1/obligations/{}/reset", uuid::Uuid::new_v4());

        let (status, body) = send(
            &app,
            json_request(Method::POST, &uri, json!({ "operator_id": "ops-1", "justification": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_webhook_signature_is_enforced() {
        let app = test_app().await;
        let payload = json!({
            "id": "evt_1",
            "type": "transfer.succeeded",
            "data": { "transfer_id": "tr_unknown" }
        })
        .to_string();

        let unsigned = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks/provider")
            .header(SIGNATURE_HEADER, "t=1,v1=deadbeef")
            .body(Body::from(payload.clone()))
            .unwrap();
        let (status, _) = send(&app, unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let header =
            signature_header(SECRET, chrono::Utc::now().timestamp(), payload.as_bytes()).unwrap();
        let signed = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks/provider")
            .header(SIGNATURE_HEADER, header)
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = send(&app, signed).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["event_id"], "evt_1");
    }
}
