//! Login and logout routes for the session keys of the streaming endpoints

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};

use crate::auth::tokens::SessionStore;
use crate::config::config::AuthConfig;

/// Slows down password guessing.
pub const FAILED_LOGIN_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct AuthState {
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<AuthConfig>,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    key: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn auth_router(sessions: Arc<SessionStore>, credentials: AuthConfig) -> Router {
    let state = AuthState {
        sessions,
        credentials: Arc::new(credentials),
    };

    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .with_state(state)
}

fn verify(credentials: &AuthConfig, username: &str, password: &str) -> bool {
    if credentials.password_hash.is_empty() || username != credentials.username {
        return false;
    }
    bcrypt::verify(password, &credentials.password_hash).unwrap_or(false)
}

async fn login(State(state): State<AuthState>, Json(payload): Json<LoginRequest>) -> Response {
    let credentials = state.credentials.clone();
    let accepted = tokio::task::spawn_blocking(move || {
        verify(&credentials, &payload.username, &payload.password)
    })
    .await
    .unwrap_or(false);

    if !accepted {
        tracing::warn!("Rejected login attempt");
        tokio::time::sleep(FAILED_LOGIN_DELAY).await;
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "invalid username or password".to_string(),
            }),
        )
            .into_response();
    }

    match state.sessions.issue() {
        Ok(key) => (StatusCode::OK, Json(LoginResponse { key })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

/// Extract the key from `Authorization: Bearer <key>`
fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .filter(|key| !key.is_empty())
}

async fn logout(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let Some(key) = bearer_key(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "missing Bearer key".to_string(),
            }),
        )
            .into_response();
    };

    match state.sessions.revoke(key) {
        Ok(found) => (StatusCode::OK, Json(found)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> AuthConfig {
        AuthConfig {
            username: "admin".to_string(),
            password_hash: bcrypt::hash("hunter22", 4).unwrap(),
            session_ttl_secs: 60,
        }
    }

    #[test]
    fn test_verify() {
        let credentials = credentials();
        assert!(verify(&credentials, "admin", "hunter22"));
        assert!(!verify(&credentials, "admin", "hunter23"));
        assert!(!verify(&credentials, "root", "hunter22"));
    }

    #[test]
    fn test_unset_hash_rejects_everything() {
        let credentials = AuthConfig::default();
        assert!(!verify(&credentials, "admin", ""));
    }

    #[tokio::test]
    async fn test_login_issues_key() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.db"), 60).unwrap());
        let state = AuthState {
            sessions: sessions.clone(),
            credentials: Arc::new(credentials()),
        };

        let response = login(
            State(state),
            Json(LoginRequest {
                username: "admin".to_string(),
                password: "hunter22".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_login_is_delayed() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.db"), 60).unwrap());
        let state = AuthState {
            sessions,
            credentials: Arc::new(credentials()),
        };

        let started = tokio::time::Instant::now();
        let response = login(
            State(state),
            Json(LoginRequest {
                username: "admin".to_string(),
                password: "wrong".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(started.elapsed() >= FAILED_LOGIN_DELAY);
    }

    #[tokio::test]
    async fn test_logout_revokes_key() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.db"), 60).unwrap());
        let key = sessions.issue().unwrap();
        let state = AuthState {
            sessions: sessions.clone(),
            credentials: Arc::new(credentials()),
        };

        let response = logout(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {}", key).parse().unwrap());
        let response = logout(State(state), headers).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(sessions.session(&key).unwrap().is_none());
        assert!(!sessions.acquire(&key).unwrap());
    }
}
