//! Server configuration.

use std::net::SocketAddr;

use secrecy::SecretString;

use crate::error::{Result, ServerError};

/// Default realtime model when the client does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Default voice for the tutor.
pub const DEFAULT_VOICE: &str = "shimmer";

/// A configured API secret: a stable id for logs plus the secret value.
#[derive(Clone)]
pub struct ApiSecret {
    /// Identifier used in logs and rate-limit keys. Never the secret.
    pub id: String,
    /// The bearer secret itself.
    pub secret: SecretString,
}

/// Configuration for the token server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Provider REST base, e.g. `https://api.openai.com/v1`.
    pub provider_base: String,
    /// Long-lived provider key. Held only here; never returned to
    /// clients.
    pub provider_api_key: SecretString,
    /// Model minted into credentials when the request omits one.
    pub default_model: String,
    /// Voice minted into credentials when the request omits one.
    pub default_voice: String,
    /// Accepted app bearer secrets.
    pub api_secrets: Vec<ApiSecret>,
    /// Per-user token mints allowed per minute. Deliberately permissive:
    /// cutting this endpoint off mid-conversation kills live sessions.
    pub token_requests_per_minute: u32,
}

impl ServerConfig {
    /// Load configuration from the environment.
    ///
    /// Recognized variables: `SORI_BIND_ADDR`, `OPENAI_API_BASE`,
    /// `OPENAI_API_KEY` (required), `SORI_REALTIME_MODEL`,
    /// `SORI_REALTIME_VOICE`, `SORI_API_SECRETS`
    /// (comma-separated `id:secret` pairs, required),
    /// `SORI_TOKEN_RPM`.
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("SORI_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8787".to_string())
            .parse()
            .map_err(|e| ServerError::Config(format!("SORI_BIND_ADDR: {e}")))?;

        let provider_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ServerError::Config("OPENAI_API_KEY is required".to_string()))?;

        let api_secrets = std::env::var("SORI_API_SECRETS")
            .map_err(|_| ServerError::Config("SORI_API_SECRETS is required".to_string()))?
            .split(',')
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| match pair.split_once(':') {
                Some((id, secret)) => Ok(ApiSecret {
                    id: id.trim().to_string(),
                    secret: SecretString::from(secret.trim().to_string()),
                }),
                None => Err(ServerError::Config(format!(
                    "SORI_API_SECRETS entry without id: prefix: {pair}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        if api_secrets.is_empty() {
            return Err(ServerError::Config("SORI_API_SECRETS is empty".to_string()));
        }

        let token_requests_per_minute = std::env::var("SORI_TOKEN_RPM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            bind_addr,
            provider_base: std::env::var("OPENAI_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            provider_api_key: SecretString::from(provider_api_key),
            default_model: std::env::var("SORI_REALTIME_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            default_voice: std::env::var("SORI_REALTIME_VOICE")
                .unwrap_or_else(|_| DEFAULT_VOICE.to_string()),
            api_secrets,
            token_requests_per_minute,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_pairs_parse() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            provider_base: "https://api.openai.com/v1".to_string(),
            provider_api_key: SecretString::from("sk-test"),
            default_model: DEFAULT_MODEL.to_string(),
            default_voice: DEFAULT_VOICE.to_string(),
            api_secrets: vec![ApiSecret {
                id: "mobile".to_string(),
                secret: SecretString::from("s3cret"),
            }],
            token_requests_per_minute: 30,
        };
        assert_eq!(config.api_secrets[0].id, "mobile");
    }
}
