//! Bearer authentication middleware.
//!
//! Compares the presented token against the configured API secrets in
//! constant time and inserts an [`AuthContext`] into request extensions
//! for handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use secrecy::ExposeSecret;
use subtle::ConstantTimeEq;

use crate::config::ApiSecret;
use crate::error::ServerError;
use crate::state::AppState;

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Id of the API secret that authenticated the request.
    pub principal: String,
}

fn extract_bearer(request: &Request) -> Result<String, ServerError> {
    let header = request
        .headers()
        .get("authorization")
        .ok_or_else(|| ServerError::Unauthorized("missing Authorization header".to_string()))?;
    let value = header
        .to_str()
        .map_err(|_| ServerError::Unauthorized("invalid Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| ServerError::Unauthorized("expected Bearer token".to_string()))
}

/// Constant-time match of a presented token against the secret list.
pub fn match_api_secret(token: &str, secrets: &[ApiSecret]) -> Option<String> {
    let token_bytes = token.as_bytes();
    let mut matched = None;
    for entry in secrets {
        let secret_bytes = entry.secret.expose_secret().as_bytes();
        if secret_bytes.len() == token_bytes.len()
            && bool::from(secret_bytes.ct_eq(token_bytes))
        {
            matched = Some(entry.id.clone());
        }
    }
    matched
}

/// Middleware validating the bearer token on every request.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let token = extract_bearer(&request)?;

    match match_api_secret(&token, &state.config.api_secrets) {
        Some(principal) => {
            tracing::debug!(%principal, path = %request.uri().path(), "authenticated");
            request.extensions_mut().insert(AuthContext { principal });
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "bearer token mismatch");
            Err(ServerError::Unauthorized("invalid access token".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn secrets() -> Vec<ApiSecret> {
        vec![
            ApiSecret { id: "mobile".to_string(), secret: SecretString::from("alpha-secret") },
            ApiSecret { id: "web".to_string(), secret: SecretString::from("beta-secret") },
        ]
    }

    #[test]
    fn matches_the_right_secret() {
        assert_eq!(match_api_secret("alpha-secret", &secrets()).as_deref(), Some("mobile"));
        assert_eq!(match_api_secret("beta-secret", &secrets()).as_deref(), Some("web"));
    }

    #[test]
    fn rejects_wrong_or_prefix_tokens() {
        assert!(match_api_secret("alpha-secret-extra", &secrets()).is_none());
        assert!(match_api_secret("alpha", &secrets()).is_none());
        assert!(match_api_secret("", &secrets()).is_none());
    }
}
