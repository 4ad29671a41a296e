//! Initial dialing of bootstrap peers.
//!
//! Bootstrap peers are dialed at startup and retried with exponential
//! backoff until the first connection succeeds. Reconnecting after that is
//! the orchestrator's job.

use presence_core::{PeerIdentity, Substrate};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Retry behavior for bootstrap dials.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Delay to wait after failed attempt number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_secs = config.initial_delay.as_secs_f64() * config.backoff_factor.powi(exponent);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Dial `peer` until it connects once or attempts run out.
///
/// Returns whether a connection was made.
pub async fn dial_until_connected(
    substrate: Arc<dyn Substrate>,
    peer: PeerIdentity,
    config: BackoffConfig,
) -> bool {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match substrate.dial(&peer).await {
            Ok(()) => {
                info!("Connected to bootstrap peer {}", peer);
                return true;
            }
            Err(e) => {
                if config.max_attempts.is_some_and(|max| attempts >= max) {
                    warn!(
                        "Giving up on bootstrap peer {} after {} attempts: {}",
                        peer, attempts, e
                    );
                    return false;
                }
                let delay = calculate_backoff(attempts, &config);
                warn!(
                    "Bootstrap dial to {} failed ({}), retrying in {:?}",
                    peer, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
