//! Per-user rate limiting for the token endpoint.
//!
//! Quotas here are deliberately permissive: a user whose conversation
//! drops needs a fresh credential immediately, and refusing it kills
//! the session. The limiter exists to stop abuse, not to meter normal
//! use.

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::error::ServerError;

/// Keyed limiter over user identities.
pub struct UserRateLimiter {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
    clock: DefaultClock,
}

impl UserRateLimiter {
    /// Allow `per_minute` mints per user per minute.
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN));
        Self { limiter: RateLimiter::keyed(quota), clock: DefaultClock::default() }
    }

    /// Check and consume one permit for `user`. On exhaustion, returns
    /// the rate-limit error carrying the seconds until the next permit.
    pub fn check(&self, user: &str) -> Result<(), ServerError> {
        self.limiter.check_key(&user.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            ServerError::RateLimited { retry_after_secs: wait.as_secs().max(1) }
        })
    }
}
