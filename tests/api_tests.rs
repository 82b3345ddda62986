//! HTTP surface tests: routing, status codes and response bodies

mod common;

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use parcelvault_server::settlement::simulated::TransferScript;
    use parcelvault_server::state::AppState;

    use crate::common::*;

    fn router(h: &Harness) -> Router {
        parcelvault_server::app(AppState::new(h.engine.clone()))
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn open(h: &Harness) -> String {
        let response = router(h)
            .oneshot(post(
                "/api/loans",
                json!({
                    "borrower_id": h.borrower,
                    "asset_id": h.asset.id,
                    "terms": {
                        "principal": 1_000_000,
                        "interest_rate_bps": 850,
                        "duration_days": 30
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "open");
        body["data"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let response = router(&h).oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["ledger_mirroring"], true);
    }

    #[tokio::test]
    async fn test_open_then_get_loan() {
        let h = Harness::new();
        let id = open(&h).await;

        let response = router(&h)
            .oneshot(get(&format!("/api/loans/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["principal"], 1_000_000);
        assert_eq!(body["data"]["ltv_bps"], 1_000);
    }

    #[tokio::test]
    async fn test_unknown_loan_is_404() {
        let h = Harness::new();
        let response = router(&h)
            .oneshot(get(&format!("/api/loans/{}", Uuid::new_v4())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_terms_are_400() {
        let h = Harness::new();
        let response = router(&h)
            .oneshot(post(
                "/api/loans",
                json!({
                    "borrower_id": h.borrower,
                    "asset_id": h.asset.id,
                    "terms": { "principal": 0, "interest_rate_bps": 850, "duration_days": 30 }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pending_fund_is_202_with_retry_after() {
        let h = Harness::new();
        let id = open(&h).await;
        h.network.script_next_transfer(TransferScript::never_settles());

        let response = router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/fund", id),
                json!({ "lender_id": h.lender }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "SETTLEMENT_PENDING");
    }

    #[tokio::test]
    async fn test_fund_then_cancel_conflicts() {
        let h = Harness::new();
        let id = open(&h).await;

        let funded = router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/fund", id),
                json!({ "lender_id": h.lender }),
            ))
            .await
            .unwrap();
        assert_eq!(funded.status(), StatusCode::OK);
        assert_eq!(json_body(funded).await["data"]["status"], "active");

        let cancelled = router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/cancel", id),
                json!({ "requester_id": h.borrower }),
            ))
            .await
            .unwrap();
        assert_eq!(cancelled.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_early_claim_is_422() {
        let h = Harness::new();
        let id = open(&h).await;
        router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/fund", id),
                json!({ "lender_id": h.lender }),
            ))
            .await
            .unwrap();

        let response = router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/claim", id),
                json!({ "claimant_id": h.lender }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_repay_returns_receipt() {
        let h = Harness::new();
        let id = open(&h).await;
        router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/fund", id),
                json!({ "lender_id": h.lender }),
            ))
            .await
            .unwrap();

        let response = router(&h)
            .oneshot(post(
                &format!("/api/loans/{}/repay", id),
                json!({ "payer_id": h.borrower }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["total_owed"], 1_007_083);
        assert_eq!(body["data"]["loan"]["status"], "repaid");
        assert!(body["data"]["tx_ref"].as_str().unwrap().starts_with("sim_"));
    }
}
