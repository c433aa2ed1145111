//! # sori-server
//!
//! Backend token endpoint for the Sori realtime voice subsystem.
//!
//! Mints short-lived realtime credentials from a long-lived provider key
//! that never leaves this process:
//!
//! - `POST /openai/realtime/token` — bearer-authenticated, per-user rate
//!   limited, returns `{ success: true, data: { ephemeralKey } }`.
//! - `GET /health` — liveness probe.
//!
//! Tutoring instructions are injected at mint time from the scenario,
//! level, and lesson context, so clients cannot override them.

pub mod auth;
pub mod config;
pub mod error;
pub mod minter;
pub mod ratelimit;
pub mod routes;
pub mod state;

pub use auth::AuthContext;
pub use config::{ApiSecret, ServerConfig};
pub use error::{Result, ServerError};
pub use minter::{CredentialMinter, InstructionProvider, MintContext, TutorInstructions};
pub use ratelimit::UserRateLimiter;
pub use routes::create_app;
pub use state::AppState;
