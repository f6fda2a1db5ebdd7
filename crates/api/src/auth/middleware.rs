//! Authentication middleware for Axum
//!
//! Callers authenticate with a Supabase access token, sent either as
//! `Authorization: Bearer <token>` or in the `nexo_auth_token` HttpOnly
//! cookie. Tokens are verified against Supabase `/auth/v1/user`.

use axum::{
    extract::{Request, State},
    http::header::{AUTHORIZATION, COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use nexo_billing::{normalize_email, EntitlementStore};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

use crate::error::ApiError;

/// Token cache TTL - cache Supabase verification results for 60 seconds
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Maximum cache entries; the oldest entry is evicted beyond this
const MAX_CACHE_ENTRIES: usize = 10_000;

/// How long a request waits on another request's verification of the same
/// token before verifying on its own
const IN_FLIGHT_WAIT: Duration = Duration::from_secs(15);

const AUTH_COOKIE: &str = "nexo_auth_token";

/// In-flight request result type for request coalescing
type InFlightResult = Result<SupabaseUserResponse, AuthError>;

/// Verifications currently running, keyed by token. Only held for map
/// operations, never across an await.
pub(crate) type InFlightRequests = Arc<Mutex<HashMap<String, broadcast::Sender<InFlightResult>>>>;

fn lock_in_flight(
    requests: &InFlightRequests,
) -> MutexGuard<'_, HashMap<String, broadcast::Sender<InFlightResult>>> {
    requests.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Leader's claim on an in-flight entry. Dropping it without [`finish`]
/// (the request was cancelled) removes the entry, which closes the channel
/// and sends waiters to their own lookup.
///
/// [`finish`]: InFlightGuard::finish
struct InFlightGuard<'a> {
    requests: &'a InFlightRequests,
    key: Option<String>,
}

impl InFlightGuard<'_> {
    fn finish(mut self, result: &InFlightResult) {
        if let Some(key) = self.key.take() {
            if let Some(tx) = lock_in_flight(self.requests).remove(&key) {
                // Receivers may have been dropped
                let _ = tx.send(result.clone());
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock_in_flight(self.requests).remove(&key);
        }
    }
}

/// Cached authentication result from Supabase
#[derive(Clone, Debug)]
pub(crate) struct CachedSupabaseAuth {
    user: SupabaseUserResponse,
    cached_at: Instant,
}

/// Thread-safe token cache type (crate-internal, not part of public API)
pub(crate) type TokenCache = Arc<RwLock<HashMap<String, CachedSupabaseAuth>>>;

/// Authenticated caller, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Supabase Auth user id
    pub auth_user_id: String,
    /// Normalized
    pub email: String,
    pub name: Option<String>,
}

/// Response from Supabase /auth/v1/user endpoint
#[derive(Debug, Clone, Deserialize)]
struct SupabaseUserResponse {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: SupabaseUserMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SupabaseUserMetadata {
    full_name: Option<String>,
    name: Option<String>,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub http_client: Client,
    /// Lowercased emails with admin access
    pub admin_emails: Arc<Vec<String>>,
    pub store: Arc<dyn EntitlementStore>,
    /// Cache for Supabase token verification results to prevent rate limiting
    pub(crate) token_cache: TokenCache,
    /// Coalesces parallel verifications of the same token
    pub(crate) in_flight_requests: InFlightRequests,
}

impl AuthState {
    pub fn new(
        supabase_url: impl Into<String>,
        supabase_anon_key: impl Into<String>,
        http_client: Client,
        admin_emails: Vec<String>,
        store: Arc<dyn EntitlementStore>,
    ) -> Self {
        Self {
            supabase_url: supabase_url.into().trim_end_matches('/').to_string(),
            supabase_anon_key: supabase_anon_key.into(),
            http_client,
            admin_emails: Arc::new(admin_emails),
            store,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight_requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .find_map(|cookie| {
                    cookie
                        .trim()
                        .strip_prefix(AUTH_COOKIE)
                        .and_then(|rest| rest.strip_prefix('='))
                })
                .filter(|token| !token.is_empty())
                .map(String::from)
        })
}

/// Extract bearer token from Authorization header or HttpOnly cookie
/// Prefers Authorization header but falls back to the cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match authenticate(&auth_state, &request).await {
        Ok(auth_user) => {
            tracing::debug!(path = %path, auth_user_id = %auth_user.auth_user_id, "require_auth: authenticated");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires an administrator: a configured admin email or a
/// user row with role `admin`
pub async fn require_admin(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_user = match authenticate(&auth_state, &request).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    match is_admin(&auth_state, &auth_user).await {
        Ok(true) => {
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Ok(false) => {
            tracing::warn!(email = %auth_user.email, path = %request.uri().path(), "Admin access denied");
            AuthError::InsufficientPermissions.into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn is_admin(auth_state: &AuthState, user: &AuthUser) -> Result<bool, AuthError> {
    if auth_state.admin_emails.iter().any(|e| *e == user.email) {
        return Ok(true);
    }
    let stored = auth_state
        .store
        .find_user_by_email(&user.email)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to load user role");
            AuthError::DatabaseError
        })?;
    Ok(stored.is_some_and(|u| u.role == "admin"))
}

// The token is read before the async body so the returned future does not
// borrow the (non-`Sync`) request and stays `Send`.
fn authenticate<'a>(
    auth_state: &'a AuthState,
    request: &Request,
) -> impl std::future::Future<Output = Result<AuthUser, AuthError>> + Send + 'a {
    let token = extract_bearer_token(request);
    async move {
        let token = token.ok_or(AuthError::MissingAuth)?;
        let user = verify_supabase_token_via_api(auth_state, &token).await?;
        let email = user
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|e| !e.is_empty())
            .ok_or(AuthError::InvalidToken)?;

        Ok(AuthUser {
            auth_user_id: user.id,
            email,
            name: user.user_metadata.full_name.or(user.user_metadata.name),
        })
    }
}

/// Verify a Supabase token by calling the Supabase Auth API
/// Uses caching and request coalescing to prevent Supabase rate limiting
async fn verify_supabase_token_via_api(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    if auth_state.supabase_anon_key.is_empty() {
        tracing::warn!("Supabase anon key not configured, cannot verify token via API");
        return Err(AuthError::InvalidToken);
    }

    {
        let cache = auth_state.token_cache.read().await;
        if let Some(cached) = cache.get(token) {
            if cached.cached_at.elapsed() < TOKEN_CACHE_TTL {
                tracing::debug!("Using cached Supabase auth for user {}", cached.user.id);
                return Ok(cached.user.clone());
            }
        }
    }

    // Join a verification already running for this token, or lead one
    let token_key = token.to_string();
    let follower = {
        let mut in_flight = lock_in_flight(&auth_state.in_flight_requests);
        match in_flight.get(&token_key) {
            Some(tx) => Some(tx.subscribe()),
            None => {
                let (tx, _) = broadcast::channel(1);
                in_flight.insert(token_key.clone(), tx);
                None
            }
        }
    };

    if let Some(mut rx) = follower {
        return match tokio::time::timeout(IN_FLIGHT_WAIT, rx.recv()).await {
            Ok(Ok(result)) => result,
            // Leader cancelled or too slow
            Ok(Err(_)) | Err(_) => {
                tracing::debug!("Coalesced token verification unavailable, verifying directly");
                let result = verify_supabase_token_api_call(auth_state, token).await;
                if let Ok(ref user) = result {
                    cache_user(auth_state, token, user).await;
                }
                result
            }
        };
    }

    let guard = InFlightGuard {
        requests: &auth_state.in_flight_requests,
        key: Some(token_key),
    };
    let result = verify_supabase_token_api_call(auth_state, token).await;
    guard.finish(&result);

    if let Ok(ref user) = result {
        cache_user(auth_state, token, user).await;
    }

    result
}

async fn cache_user(auth_state: &AuthState, token: &str, user: &SupabaseUserResponse) {
    let mut cache = auth_state.token_cache.write().await;

    if cache.len() >= MAX_CACHE_ENTRIES {
        if let Some(oldest_key) = cache
            .iter()
            .min_by_key(|(_, v)| v.cached_at)
            .map(|(k, _)| k.clone())
        {
            cache.remove(&oldest_key);
        }
    }

    cache.insert(
        token.to_string(),
        CachedSupabaseAuth {
            user: user.clone(),
            cached_at: Instant::now(),
        },
    );
}

async fn verify_supabase_token_api_call(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    let url = format!("{}/auth/v1/user", auth_state.supabase_url);

    let response = auth_state
        .http_client
        .get(&url)
        .header("apikey", &auth_state.supabase_anon_key)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to verify Supabase token");
            AuthError::ProviderUnavailable
        })?;

    if !response.status().is_success() {
        tracing::warn!(
            status = %response.status(),
            "Supabase token verification failed"
        );
        return Err(AuthError::InvalidToken);
    }

    response
        .json::<SupabaseUserResponse>()
        .await
        .map_err(|_| AuthError::InvalidToken)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Identity provider unavailable")]
    ProviderUnavailable,
    #[error("Database error")]
    DatabaseError,
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingAuth | AuthError::InvalidToken => ApiError::Unauthorized,
            AuthError::InsufficientPermissions => ApiError::Forbidden,
            AuthError::ProviderUnavailable => ApiError::Provider(e.to_string()),
            AuthError::DatabaseError => ApiError::Database(e.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: (&str, &str)) -> Request {
        Request::builder()
            .uri("/")
            .header(header.0, header.1)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut request = request_with(("authorization", "Bearer header-token"));
        request
            .headers_mut()
            .insert(COOKIE, "nexo_auth_token=cookie-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("header-token"));
    }

    #[test]
    fn cookie_token_is_found_among_others() {
        let request = request_with(("cookie", "theme=dark; nexo_auth_token=abc123; other=1"));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("abc123"));
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let request = request_with(("authorization", "Basic dXNlcjpwYXNz"));
        assert_eq!(extract_bearer_token(&request), None);
    }

    fn state_for(url: String) -> AuthState {
        AuthState::new(
            url,
            "anon-test-key",
            Client::new(),
            Vec::new(),
            Arc::new(nexo_billing::InMemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn cancelled_verification_releases_the_token() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let state = state_for(format!("http://{}", addr));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            verify_supabase_token_via_api(&state, "slow-token"),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(lock_in_flight(&state.in_flight_requests).is_empty());
    }

    #[tokio::test]
    async fn waiter_verifies_directly_when_leader_goes_away() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/v1/user")
            .with_status(200)
            .with_body(r#"{"id":"auth-7","email":"seven@example.com"}"#)
            .expect(1)
            .create_async()
            .await;
        let state = state_for(server.url());

        // A leader that will never report back
        let (tx, _) = broadcast::channel(1);
        lock_in_flight(&state.in_flight_requests).insert("shared-token".to_string(), tx);

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { verify_supabase_token_via_api(&state, "shared-token").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lock_in_flight(&state.in_flight_requests).remove("shared-token");

        let user = waiter.await.unwrap().unwrap();
        assert_eq!(user.id, "auth-7");
        mock.assert_async().await;
    }
}
