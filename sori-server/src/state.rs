//! Shared application state.

use crate::config::ServerConfig;
use crate::minter::CredentialMinter;
use crate::ratelimit::UserRateLimiter;

/// State shared by all handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub minter: CredentialMinter,
    pub limiter: UserRateLimiter,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let minter = CredentialMinter::new(
            config.provider_base.clone(),
            config.provider_api_key.clone(),
        );
        let limiter = UserRateLimiter::new(config.token_requests_per_minute);
        Self { config, minter, limiter }
    }
}
