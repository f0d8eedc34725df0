//! HTTP token API.
//!
//! The only endpoint that reports token errors explicitly.  Unlike the knock
//! port, callers here are expected to hold a token already, so a 401 with a
//! reason leaks nothing the caller does not know.
//!
//! | Method | Path            | Response                                   |
//! |--------|-----------------|--------------------------------------------|
//! | GET    | `/health`       | `{"status":"pass"}`                        |
//! | GET    | `/api/v1/token` | 200 + verified claims, or 401 + `{"error"}` |

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sdp_core::{TokenClaims, TokenError, TokenIssuer};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Error returned by the token API.
#[derive(Debug)]
pub enum ApiError {
    /// 401 with a short reason.
    Unauthorized(String),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        let reason = match e {
            TokenError::Expired { .. } => "token expired",
            TokenError::NotYetValid { .. } => "token not yet valid",
            TokenError::BadSignature => "bad signature",
            TokenError::WrongIssuer { .. } => "wrong issuer",
            TokenError::UnsupportedAlgorithm(_) => "unsupported algorithm",
            _ => "malformed token",
        };
        Self::unauthorized(reason)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Builds the router.
pub fn router(issuer: Arc<TokenIssuer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/token", get(introspect))
        .with_state(issuer)
}

/// Serves the token API on `listener` until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    issuer: Arc<TokenIssuer>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("controller token API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(issuer))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "pass" }))
}

async fn introspect(
    State(issuer): State<Arc<TokenIssuer>>,
    headers: HeaderMap,
) -> Result<Json<TokenClaims>, ApiError> {
    let token = bearer_token(&headers)?;
    let claims = issuer.verify(token).map_err(|e| {
        debug!("token introspection refused: {e}");
        ApiError::from(e)
    })?;
    Ok(Json(claims))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid authorization header"))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("expected a bearer token"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use sdp_core::time::ManualClock;
    use sdp_core::{Device, DeviceId, IdentityBinding, KnockSecret};
    use std::time::Duration;
    use tower::ServiceExt;

    fn fixture() -> (Arc<TokenIssuer>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let issuer = TokenIssuer::new(
            vec![0x5a; 32],
            "sdp-controller",
            Duration::from_secs(120),
            Arc::clone(&clock) as Arc<dyn sdp_core::Clock>,
        )
        .unwrap();
        (Arc::new(issuer), clock)
    }

    fn device() -> Device {
        Device::new(
            DeviceId::new("dev-1").unwrap(),
            KnockSecret::new(vec![1; 16]).unwrap(),
            IdentityBinding::CertFingerprint([0; 32]),
            vec!["ssh".to_string()],
        )
    }

    async fn call(app: Router, auth: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().uri("/api/v1/token");
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_pass() {
        // Arrange
        let (issuer, _) = fixture();

        // Act
        let response = router(issuer)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "pass");
    }

    #[tokio::test]
    async fn test_valid_token_returns_claims() {
        // Arrange
        let (issuer, _) = fixture();
        let issued = issuer.issue(&device()).unwrap();

        // Act
        let (status, body) = call(router(issuer), Some(&format!("Bearer {}", issued.token))).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sub"], "dev-1");
        assert_eq!(body["jti"], issued.claims.jti.to_string());
        assert_eq!(body["scope"][0], "ssh");
    }

    #[tokio::test]
    async fn test_missing_header_is_unauthorized() {
        let (issuer, _) = fixture();
        let (status, body) = call(router(issuer), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing authorization header");
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_unauthorized() {
        let (issuer, _) = fixture();
        let (status, _) = call(router(issuer), Some("Basic ZGV2LTE6cHc=")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthorized() {
        // Arrange
        let (issuer, clock) = fixture();
        let issued = issuer.issue(&device()).unwrap();
        clock.advance(Duration::from_secs(121));

        // Act
        let (status, body) = call(router(issuer), Some(&format!("Bearer {}", issued.token))).await;

        // Assert
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "token expired");
    }

    #[tokio::test]
    async fn test_tampered_token_is_unauthorized() {
        // Arrange
        let (issuer, _) = fixture();
        let mut token = issuer.issue(&device()).unwrap().token;
        let last = token.pop().unwrap();
        token.push(if last == 'A' { 'B' } else { 'A' });

        // Act
        let (status, _) = call(router(issuer), Some(&format!("Bearer {token}"))).await;

        // Assert
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_garbage_token_is_reported_as_malformed() {
        let (issuer, _) = fixture();
        let (status, body) = call(router(issuer), Some("Bearer not-a-token")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "malformed token");
    }
}
