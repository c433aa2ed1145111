//! Token broker client: fetches short-lived realtime credentials from
//! the app backend.
//!
//! The backend holds the long-lived provider secret; this client only
//! ever sees the ephemeral key scoped to one session. Rate-limit
//! responses are retried with exponential backoff, honoring a
//! server-supplied `retryAfter` when present.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ProficiencyLevel, TokenRetryConfig};
use crate::error::{Result, VoiceError};

/// Request context for credential minting. Scenario and lesson details
/// are opaque to this subsystem; the backend uses them to build
/// instructions server-side.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest {
    /// Scenario identifier.
    pub scenario_id: String,
    /// Learner proficiency level.
    pub level: ProficiencyLevel,
    /// Opaque identity handle forwarded to the backend.
    pub user: Option<Value>,
    /// Opaque lesson context.
    pub lesson_details: Option<String>,
    /// Whether this session is lesson-based.
    pub is_lesson_based: bool,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<TokenData>,
    /// Legacy response shape.
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    #[serde(rename = "ephemeralKey")]
    ephemeral_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(rename = "retryAfter")]
    retry_after: Option<u64>,
}

/// Client for the backend token endpoint.
pub struct TokenBroker {
    http: reqwest::Client,
    api_base: String,
    model: String,
    voice: String,
    access_token: SecretString,
    retry: TokenRetryConfig,
    in_flight: tokio::sync::Mutex<()>,
}

impl TokenBroker {
    /// Create a broker for the given backend.
    pub fn new(
        api_base: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
        access_token: SecretString,
        retry: TokenRetryConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            model: model.into(),
            voice: voice.into(),
            access_token,
            retry,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Fetch an ephemeral credential for a new session.
    ///
    /// Concurrent calls are deduplicated: a caller that finds a request
    /// already in flight waits for it, and if `connection_established`
    /// reports that the parallel call already connected, aborts with a
    /// connection error instead of minting a second credential.
    pub async fn get_ephemeral_token<F>(
        &self,
        request: &TokenRequest,
        connection_established: F,
    ) -> Result<SecretString>
    where
        F: Fn() -> bool,
    {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("token request already in flight, waiting");
                let guard = self.in_flight.lock().await;
                if connection_established() {
                    return Err(VoiceError::connection(
                        "connection already established by a parallel session start",
                    ));
                }
                guard
            }
        };

        self.fetch(request).await
    }

    async fn fetch(&self, request: &TokenRequest) -> Result<SecretString> {
        let url = format!("{}/openai/realtime/token", self.api_base);
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "scenarioId": request.scenario_id,
            "isScenarioBased": !request.scenario_id.is_empty(),
            "isLessonBased": request.is_lesson_based,
            "lessonDetails": request.lesson_details,
            "level": request.level,
            "user": request.user,
        });

        let max_attempts = self.retry.max_retries.max(1);
        for attempt in 0..max_attempts {
            let response = self
                .http
                .post(&url)
                .bearer_auth(self.access_token.expose_secret())
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if attempt + 1 >= max_attempts {
                        return Err(VoiceError::token(format!(
                            "token request failed after {max_attempts} attempts: {err}"
                        )));
                    }
                    let backoff = self.backoff_for(attempt, None);
                    tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64,
                        error = %err, "token request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                if attempt + 1 >= max_attempts {
                    return Err(VoiceError::token(format!(
                        "token endpoint rate limited; gave up after {max_attempts} attempts"
                    )));
                }
                let retry_after = response
                    .json::<RateLimitBody>()
                    .await
                    .ok()
                    .and_then(|b| b.retry_after);
                let backoff = self.backoff_for(attempt, retry_after);
                tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64,
                    "token endpoint rate limited, backing off");
                tokio::time::sleep(backoff).await;
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(VoiceError::token(format!(
                    "token endpoint returned {status}: {text}"
                )));
            }

            let envelope: TokenEnvelope = response
                .json()
                .await
                .map_err(|e| VoiceError::token(format!("invalid token response: {e}")))?;
            return Self::extract_key(envelope);
        }

        Err(VoiceError::token("token retries exhausted"))
    }

    /// Backoff for the attempt: server `retryAfter` (capped) when given,
    /// otherwise `base * 2^attempt` capped per wait.
    fn backoff_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(secs) => Duration::from_secs(secs).min(self.retry.retry_after_cap),
            None => {
                let exp = self.retry.base_backoff.saturating_mul(1u32 << attempt.min(16));
                exp.min(self.retry.backoff_cap)
            }
        }
    }

    fn extract_key(envelope: TokenEnvelope) -> Result<SecretString> {
        if let Some(data) = envelope.data {
            if let Some(key) = data.ephemeral_key {
                if envelope.success == Some(false) {
                    return Err(VoiceError::token("token endpoint reported failure"));
                }
                return Ok(SecretString::from(key));
            }
        }
        if let Some(token) = envelope.token {
            return Ok(SecretString::from(token));
        }
        Err(VoiceError::token("token response carried no ephemeralKey or token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(api_base: &str) -> TokenBroker {
        TokenBroker::new(
            api_base,
            "gpt-test",
            "shimmer",
            SecretString::from("access-token"),
            TokenRetryConfig {
                max_retries: 3,
                base_backoff: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(8),
                retry_after_cap: Duration::from_millis(10),
            },
        )
    }

    fn request() -> TokenRequest {
        TokenRequest {
            scenario_id: "s2".to_string(),
            level: ProficiencyLevel::Beginner,
            user: Some(serde_json::json!({"id": "u1"})),
            lesson_details: None,
            is_lesson_based: false,
        }
    }

    #[tokio::test]
    async fn parses_canonical_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .and(bearer_token("access-token"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-test",
                "scenarioId": "s2",
                "isScenarioBased": true,
                "level": "beginner",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": { "ephemeralKey": "ek_123" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let key = broker(&server.uri()).get_ephemeral_token(&request(), || false).await.unwrap();
        assert_eq!(key.expose_secret(), "ek_123");
    }

    #[tokio::test]
    async fn accepts_legacy_token_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "token": "legacy_456" })),
            )
            .mount(&server)
            .await;

        let key = broker(&server.uri()).get_ephemeral_token(&request(), || false).await.unwrap();
        assert_eq!(key.expose_secret(), "legacy_456");
    }

    #[tokio::test]
    async fn retries_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({})))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": { "ephemeralKey": "ek_after_retry" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let key = broker(&server.uri()).get_ephemeral_token(&request(), || false).await.unwrap();
        assert_eq!(key.expose_secret(), "ek_after_retry");
    }

    #[tokio::test]
    async fn three_rate_limited_attempts_produce_token_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({ "retryAfter": 0 })),
            )
            .expect(3)
            .mount(&server)
            .await;

        let err =
            broker(&server.uri()).get_ephemeral_token(&request(), || false).await.unwrap_err();
        assert_eq!(err.kind(), "token");
    }

    #[tokio::test]
    async fn non_retryable_status_is_fatal_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err =
            broker(&server.uri()).get_ephemeral_token(&request(), || false).await.unwrap_err();
        assert_eq!(err.kind(), "token");
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn waiting_caller_aborts_when_connection_already_established() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/realtime/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "success": true,
                        "data": { "ephemeralKey": "ek_slow" }
                    }))
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let broker = std::sync::Arc::new(broker(&server.uri()));
        let first = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move {
                broker.get_ephemeral_token(&request(), || false).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Second caller waits for the in-flight request, then observes
        // the connection as already established.
        let second = broker.get_ephemeral_token(&request(), || true).await;
        let err = second.unwrap_err();
        assert_eq!(err.kind(), "connection");
        assert!(err.to_string().contains("already established"));

        first.await.unwrap().unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let broker = TokenBroker::new(
            "http://localhost",
            "m",
            "v",
            SecretString::from("t"),
            TokenRetryConfig {
                max_retries: 3,
                base_backoff: Duration::from_millis(1000),
                backoff_cap: Duration::from_secs(30),
                retry_after_cap: Duration::from_secs(300),
            },
        );
        assert_eq!(broker.backoff_for(0, None), Duration::from_millis(1000));
        assert_eq!(broker.backoff_for(1, None), Duration::from_millis(2000));
        assert_eq!(broker.backoff_for(2, None), Duration::from_millis(4000));
        assert_eq!(broker.backoff_for(6, None), Duration::from_secs(30), "per-wait cap");
        assert_eq!(broker.backoff_for(0, Some(12)), Duration::from_secs(12));
        assert_eq!(broker.backoff_for(0, Some(600)), Duration::from_secs(300), "retryAfter cap");
    }
}
