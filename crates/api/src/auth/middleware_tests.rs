//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Supabase token verification (valid, rejected, missing)
//! - Token cache reuse within the TTL
//! - Admin gate by configured email and by stored role

#[cfg(test)]
mod tests {
    use super::super::middleware::*;
    use axum::{
        body::Body,
        extract::Extension,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use nexo_billing::{models::NewUser, EntitlementStore, InMemoryStore};
    use std::sync::Arc;
    use tower::ServiceExt;

    const USER_BODY: &str =
        r#"{"id":"auth-123","email":"Student@Example.com","user_metadata":{"full_name":"Ana"}}"#;

    fn auth_state(server: &mockito::Server, store: InMemoryStore) -> AuthState {
        AuthState::new(
            server.url(),
            "anon-test-key",
            reqwest::Client::new(),
            vec!["admin@nexo.academy".to_string()],
            Arc::new(store),
        )
    }

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        format!("{}|{}", user.auth_user_id, user.email)
    }

    fn app(state: AuthState) -> Router {
        let protected = Router::new()
            .route("/me", get(whoami))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
        let admin = Router::new()
            .route("/admin", get(whoami))
            .route_layer(middleware::from_fn_with_state(state, require_admin));
        protected.merge(admin)
    }

    fn get_with_token(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let server = mockito::Server::new_async().await;
        let router = app(auth_state(&server, InMemoryStore::new()));

        let response = router
            .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(response).await.contains("\"success\":false"));
    }

    #[tokio::test]
    async fn test_valid_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/v1/user")
            .match_header("authorization", "Bearer good-token")
            .match_header("apikey", "anon-test-key")
            .with_status(200)
            .with_body(USER_BODY)
            .expect(1)
            .create_async()
            .await;
        let router = app(auth_state(&server, InMemoryStore::new()));

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(get_with_token("/me", "good-token"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "auth-123|student@example.com");
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cookie_token_is_accepted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .match_header("authorization", "Bearer cookie-token")
            .with_status(200)
            .with_body(USER_BODY)
            .create_async()
            .await;
        let router = app(auth_state(&server, InMemoryStore::new()));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header("cookie", "nexo_auth_token=cookie-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejected_token_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .with_status(401)
            .with_body(r#"{"msg":"invalid JWT"}"#)
            .create_async()
            .await;
        let router = app(auth_state(&server, InMemoryStore::new()));

        let response = router
            .oneshot(get_with_token("/me", "expired-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_admin_is_forbidden() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .with_status(200)
            .with_body(USER_BODY)
            .create_async()
            .await;
        let store = InMemoryStore::new();
        store
            .create_user_if_absent(&NewUser::free("student@example.com"))
            .await
            .unwrap();
        let router = app(auth_state(&server, store));

        let response = router
            .oneshot(get_with_token("/admin", "good-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_configured_admin_email_passes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .with_status(200)
            .with_body(r#"{"id":"auth-admin","email":"ADMIN@nexo.academy"}"#)
            .create_async()
            .await;
        let router = app(auth_state(&server, InMemoryStore::new()));

        let response = router
            .oneshot(get_with_token("/admin", "admin-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "auth-admin|admin@nexo.academy");
    }
}
