//! Ephemeral credential minting against the realtime provider.
//!
//! The long-lived provider key lives only in this process. Instructions
//! are injected here, at mint time, so the client never carries or
//! overrides them.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{Result, ServerError};

/// Context the instruction template is built from. Scenario and lesson
/// content are opaque strings supplied by the catalog service.
#[derive(Debug, Clone)]
pub struct MintContext {
    pub scenario_id: Option<String>,
    pub level: String,
    pub is_scenario_based: bool,
    pub is_lesson_based: bool,
    pub lesson_details: Option<String>,
}

/// Builds the tutoring instructions minted into a credential.
pub trait InstructionProvider: Send + Sync {
    fn instructions(&self, context: &MintContext) -> String;
}

/// Default instruction templates for the Korean tutor.
#[derive(Debug, Clone, Default)]
pub struct TutorInstructions;

impl InstructionProvider for TutorInstructions {
    fn instructions(&self, context: &MintContext) -> String {
        let mut text = format!(
            "You are a friendly Korean language tutor speaking with a {} learner. \
             Speak mostly in Korean, switching to English to explain mistakes. \
             Keep turns short and encourage the learner to speak.",
            context.level
        );
        if context.is_lesson_based {
            if let Some(details) = &context.lesson_details {
                text.push_str(&format!(" This conversation practices the lesson: {details}."));
            }
        } else if context.is_scenario_based {
            if let Some(scenario) = &context.scenario_id {
                text.push_str(&format!(" Role-play the scenario \"{scenario}\" with the learner."));
            }
        }
        text
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
}

/// Client for the provider's session endpoint.
pub struct CredentialMinter {
    http: reqwest::Client,
    base: String,
    api_key: SecretString,
    instructions: Box<dyn InstructionProvider>,
}

impl CredentialMinter {
    pub fn new(base: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            api_key,
            instructions: Box::new(TutorInstructions),
        }
    }

    /// Swap the instruction templates.
    pub fn with_instructions(mut self, provider: Box<dyn InstructionProvider>) -> Self {
        self.instructions = provider;
        self
    }

    /// Mint a short-lived credential for one session.
    pub async fn mint(&self, model: &str, voice: &str, context: &MintContext) -> Result<String> {
        let url = format!("{}/realtime/sessions", self.base);
        let response = self
            .http
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&serde_json::json!({
                "model": model,
                "voice": voice,
                "instructions": self.instructions.instructions(context),
            }))
            .send()
            .await
            .map_err(|e| ServerError::Provider(format!("session request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServerError::Provider(format!(
                "session endpoint returned {status}: {body}"
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| ServerError::Provider(format!("invalid session response: {e}")))?;
        Ok(session.client_secret.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_instructions_mention_scenario_and_level() {
        let context = MintContext {
            scenario_id: Some("cafe-ordering".to_string()),
            level: "beginner".to_string(),
            is_scenario_based: true,
            is_lesson_based: false,
            lesson_details: None,
        };
        let text = TutorInstructions.instructions(&context);
        assert!(text.contains("beginner"));
        assert!(text.contains("cafe-ordering"));
    }

    #[test]
    fn lesson_instructions_take_precedence() {
        let context = MintContext {
            scenario_id: Some("cafe-ordering".to_string()),
            level: "advanced".to_string(),
            is_scenario_based: true,
            is_lesson_based: true,
            lesson_details: Some("honorific verb endings".to_string()),
        };
        let text = TutorInstructions.instructions(&context);
        assert!(text.contains("honorific verb endings"));
        assert!(!text.contains("Role-play"));
    }
}
