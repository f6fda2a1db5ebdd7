// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Router-level tests
//!
//! Every route runs against the in-memory store and fake Stripe provider;
//! Supabase token verification is served by a mock server.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::RETRY_AFTER, Request, StatusCode},
    Router,
};
use nexo_billing::{
    models::NewUser,
    testing::{checkout_session, FakePaymentProvider},
    BillingEmailService, BillingService, EntitlementStore, IdentitySync, InMemoryStore,
    SessionPaymentStatus,
};
use nexo_shared::{RateLimitConfig, RateLimiter, Tier};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::{config::Config, routes::create_router, state::AppState};

struct TestApp {
    router: Router,
    store: InMemoryStore,
    payments: FakePaymentProvider,
    server: mockito::ServerGuard,
}

async fn test_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let server = mockito::Server::new_async().await;
    let mut config = Config::for_tests(&server.url());
    configure(&mut config);

    let store = InMemoryStore::new();
    let payments = FakePaymentProvider::new();
    let billing = BillingService::from_parts(
        Arc::new(store.clone()),
        Arc::new(payments.clone()),
        IdentitySync::disabled(),
        BillingEmailService::disabled(),
        config.stripe.webhook_secret.clone(),
    );
    let state = AppState::from_parts(
        config,
        billing,
        Arc::new(store.clone()),
        None,
        RateLimiter::new_in_memory(),
        reqwest::Client::new(),
    );

    TestApp {
        router: create_router(state),
        store,
        payments,
        server,
    }
}

async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn mock_user(&mut self, token: &str, id: &str, email: &str) {
        self.server
            .mock("GET", "/auth/v1/user")
            .match_header("authorization", format!("Bearer {}", token).as_str())
            .with_status(200)
            .with_body(json!({"id": id, "email": email}).to_string())
            .create_async()
            .await;
    }
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
}

mod activation_routes {
    use super::*;

    #[tokio::test]
    async fn test_validate_normalizes_lowercase() {
        let app = test_app().await;
        app.store
            .seed_activation_code("NEXO-A3B7-K9M2", Tier::Pro, None)
            .await;

        let (status, body) = app
            .get("/api/activation-codes/validate?code=nexo-a3b7-k9m2")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], true);
        assert_eq!(body["data"]["code"], "NEXO-A3B7-K9M2");
        assert_eq!(body["data"]["tier"], 2);
        assert_eq!(body["data"]["tierName"], "PRO");
    }

    #[tokio::test]
    async fn test_validate_bad_format_is_invalid_not_error() {
        let app = test_app().await;
        let (status, body) = app.get("/api/activation-codes/validate?code=NEXO-123").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], false);
        assert!(body["data"]["error"].is_string());
        assert!(body["data"].get("tier").is_none());
    }

    #[tokio::test]
    async fn test_redeem_requires_auth() {
        let app = test_app().await;
        let (status, body) = app
            .post_json(
                "/api/activation-codes/redeem",
                json!({"code": "NEXO-AAAA-BBBB"}),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_redeem_grants_tier_and_links_identity() {
        let mut app = test_app().await;
        app.mock_user("student-token", "auth-student", "student@example.com")
            .await;
        app.store
            .seed_activation_code("NEXO-STAR-T001", Tier::Starter, None)
            .await;

        let (status, body) = app
            .post_json(
                "/api/activation-codes/redeem",
                json!({"code": "nexo-star-t001"}),
                Some("student-token"),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["tier"], 1);
        assert_eq!(body["data"]["tierName"], "STARTER");
        assert_eq!(body["data"]["useCount"], 1);

        let user = app
            .store
            .find_user_by_email("student@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.auth_user_id.as_deref(), Some("auth-student"));
    }

    #[tokio::test]
    async fn test_redeem_unknown_code_is_not_found() {
        let mut app = test_app().await;
        app.mock_user("student-token", "auth-student", "student@example.com")
            .await;

        let (status, body) = app
            .post_json(
                "/api/activation-codes/redeem",
                json!({"code": "NEXO-NONE-0000"}),
                Some("student-token"),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_validate_is_rate_limited() {
        let app = test_app_with(|c| c.rate_limits.validate = RateLimitConfig::per_minute(1)).await;

        let (first, _) = app.get("/api/activation-codes/validate?code=NEXO-AAAA-BBBB").await;
        assert_eq!(first, StatusCode::OK);

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/activation-codes/validate?code=NEXO-AAAA-BBBB")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(RETRY_AFTER).is_some());
    }

    async fn validate_from(app: &TestApp, forwarded_for: &str) -> StatusCode {
        app.router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/activation-codes/validate?code=NEXO-AAAA-BBBB")
                    .header("X-Forwarded-For", forwarded_for)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_forwarded_for_ignored_without_trusted_proxy() {
        let app = test_app_with(|c| c.rate_limits.validate = RateLimitConfig::per_minute(1)).await;

        assert_eq!(validate_from(&app, "203.0.113.1").await, StatusCode::OK);
        assert_eq!(
            validate_from(&app, "203.0.113.2").await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_spoofed_forwarded_entries_share_the_proxy_reported_client() {
        let app = test_app_with(|c| {
            c.rate_limits.validate = RateLimitConfig::per_minute(1);
            c.trusted_proxy_hops = 1;
        })
        .await;

        assert_eq!(validate_from(&app, "10.9.9.1, 198.51.100.7").await, StatusCode::OK);
        // Client-chosen prefix changed, proxy-reported address did not
        assert_eq!(
            validate_from(&app, "10.9.9.2, 198.51.100.7").await,
            StatusCode::TOO_MANY_REQUESTS
        );
        // A different client behind the same proxy has its own budget
        assert_eq!(validate_from(&app, "198.51.100.8").await, StatusCode::OK);
    }
}

mod checkout_routes {
    use super::*;

    #[tokio::test]
    async fn test_verify_unknown_session() {
        let app = test_app().await;
        let (status, body) = app.get("/api/checkout/verify?sessionId=cs_unknown").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["processed"], false);
        assert!(body["data"]["orderId"].is_null());
    }

    #[tokio::test]
    async fn test_session_info_unpaid() {
        let app = test_app().await;
        app.payments.add_session(checkout_session(
            "cs_unpaid",
            "buyer@example.com",
            Tier::Pro,
            SessionPaymentStatus::Unpaid,
        ));

        let (status, body) = app.get("/api/checkout/session-info?sessionId=cs_unpaid").await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"], "NOT_PAID");
    }

    #[tokio::test]
    async fn test_session_info_requires_session_id() {
        let app = test_app().await;
        let (status, body) = app.get("/api/checkout/session-info").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let app = test_app().await;
        app.payments.add_session(checkout_session(
            "cs_paid",
            "buyer@example.com",
            Tier::Operator,
            SessionPaymentStatus::Paid,
        ));

        let (status, first) = app
            .post_json("/api/checkout/reconcile", json!({"sessionId": "cs_paid"}), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["data"]["tier"], 3);
        assert_eq!(first["data"]["tierName"], "OPERATOR");
        assert_eq!(first["data"]["orderCreated"], true);

        let (_, second) = app
            .post_json("/api/checkout/reconcile", json!({"sessionId": "cs_paid"}), None)
            .await;
        assert_eq!(second["data"]["orderCreated"], false);
        assert_eq!(second["data"]["orderId"], first["data"]["orderId"]);
        assert_eq!(app.store.order_count().await, 1);

        let (_, verify) = app.get("/api/checkout/verify?sessionId=cs_paid").await;
        assert_eq!(verify["data"]["processed"], true);

        let (_, info) = app.get("/api/checkout/session-info?sessionId=cs_paid").await;
        assert_eq!(info["data"]["userEmail"], "buyer@example.com");
        assert_eq!(info["data"]["needsAccountCreation"], true);
    }

    #[tokio::test]
    async fn test_code_available_after_polling_without_webhook() {
        let app = test_app().await;
        app.payments.add_session(checkout_session(
            "cs_hook_lost",
            "waiting@example.com",
            Tier::Pro,
            SessionPaymentStatus::Paid,
        ));

        let (status, _) = app
            .post_json("/api/checkout/reconcile", json!({"sessionId": "cs_hook_lost"}), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .get("/api/activation-codes/by-session?sessionId=cs_hook_lost")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["tierName"], "PRO");
        assert_eq!(body["data"]["email"], "waiting@example.com");
        assert!(body["data"]["code"].as_str().unwrap().starts_with("NEXO-"));
    }

    #[tokio::test]
    async fn test_provider_outage_is_generic_500() {
        let app = test_app().await;
        app.payments.set_unavailable(true);

        let (status, body) = app.get("/api/checkout/session-info?sessionId=cs_any").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "PROVIDER_ERROR");
        assert_eq!(app.store.user_count().await, 0);
    }
}

mod admin_routes {
    use super::*;

    async fn put_tier(app: &TestApp, user_id: uuid::Uuid, tier: i64, token: &str) -> (StatusCode, Value) {
        app.send(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/admin/users/{}/tier", user_id))
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {}", token))
                .body(Body::from(json!({"tier": tier}).to_string()))
                .unwrap(),
        )
        .await
    }

    #[tokio::test]
    async fn test_admin_sets_tier() {
        let mut app = test_app().await;
        app.mock_user("admin-token", "auth-admin", "admin@nexo.academy")
            .await;
        let (user, _) = app
            .store
            .create_user_if_absent(&NewUser::free("learner@example.com"))
            .await
            .unwrap();

        let (status, body) = put_tier(&app, user.id, 2, "admin-token").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["tier"], 2);
        assert_eq!(body["data"]["previousTier"], 0);

        let rows = app.store.list_entitlements(user.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].active);
    }

    #[tokio::test]
    async fn test_admin_rejects_out_of_range_tier() {
        let mut app = test_app().await;
        app.mock_user("admin-token", "auth-admin", "admin@nexo.academy")
            .await;
        let (user, _) = app
            .store
            .create_user_if_absent(&NewUser::free("learner@example.com"))
            .await
            .unwrap();

        let (status, body) = put_tier(&app, user.id, 7, "admin-token").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_non_admin_cannot_set_tier() {
        let mut app = test_app().await;
        app.mock_user("student-token", "auth-student", "student@example.com")
            .await;
        let (user, _) = app
            .store
            .create_user_if_absent(&NewUser::free("student@example.com"))
            .await
            .unwrap();

        let (status, _) = put_tier(&app, user.id, 3, "student-token").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let stored = app.store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.tier(), Tier::Free);
    }

    #[tokio::test]
    async fn test_cancel_subscription_demotes() {
        let mut app = test_app().await;
        app.mock_user("admin-token", "auth-admin", "admin@nexo.academy")
            .await;
        let mut new_user = NewUser::free("subscriber@example.com");
        new_user.tier = Tier::Pro;
        new_user.stripe_customer_id = Some("cus_sub".to_string());
        let (user, _) = app.store.create_user_if_absent(&new_user).await.unwrap();
        app.payments.add_subscription("cus_sub", "sub_123");

        let (status, body) = app
            .post_json(
                &format!("/api/admin/users/{}/cancel-subscription", user.id),
                json!({}),
                Some("admin-token"),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["cancelledSubscriptions"], json!(["sub_123"]));
        assert_eq!(app.payments.cancelled(), vec!["sub_123".to_string()]);

        let stored = app.store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.tier(), Tier::Free);
    }
}

mod misc_routes {
    use super::*;

    #[tokio::test]
    async fn test_webhook_without_signature_is_rejected() {
        let app = test_app().await;
        let (status, body) = app
            .post_json("/api/webhooks/stripe", json!({"id": "evt_1"}), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "WEBHOOK_SIGNATURE_INVALID");
    }

    #[tokio::test]
    async fn test_webhook_with_forged_signature_is_rejected() {
        let app = test_app().await;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let (status, _) = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/stripe")
                    .header("stripe-signature", format!("t={},v1=deadbeef", now))
                    .body(Body::from(r#"{"id":"evt_forged"}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quiz_recommendation_uses_built_in_quiz() {
        let app = test_app().await;
        let (status, body) = app
            .post_json(
                "/api/quiz/recommend",
                json!({"answers": {
                    "experience": "some",
                    "goal": "career",
                    "time": "medium",
                    "support": "self"
                }}),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["score"], 5);
        assert_eq!(body["data"]["tierName"], "PRO");
    }

    #[tokio::test]
    async fn test_quiz_incomplete_answers_rejected() {
        let app = test_app().await;
        let (status, body) = app
            .post_json("/api/quiz/recommend", json!({"answers": {"goal": "career"}}), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_malformed_json_uses_error_envelope() {
        let app = test_app().await;
        let (status, body) = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/checkout/reconcile")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "VALIDATION");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_missing_content_type_uses_error_envelope() {
        let app = test_app().await;
        let (status, body) = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/quiz/recommend")
                    .body(Body::from(r#"{"answers":{}}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_bad_query_type_uses_error_envelope() {
        let app = test_app().await;
        let (status, body) = app.get("/api/coupons/validate?code=LAUNCH&amount=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_bad_user_id_uses_error_envelope() {
        let mut app = test_app().await;
        app.mock_user("admin-token", "auth-admin", "admin@nexo.academy")
            .await;
        let (status, body) = app
            .send(
                Request::builder()
                    .method("PUT")
                    .uri("/api/admin/users/not-a-uuid/tier")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer admin-token")
                    .body(Body::from(json!({"tier": 1}).to_string()))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_unknown_coupon_is_invalid() {
        let app = test_app().await;
        let (status, body) = app.get("/api/coupons/validate?code=NOPE&amount=4900").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], false);
    }
}
