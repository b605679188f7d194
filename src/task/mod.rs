//! Background maintenance tasks.
//!
//! A single worker sweeps expired flow tokens, nonces and dead sessions,
//! and caps the event table. Sweeps are cheap deletes; a failed round is
//! logged and retried on the next tick.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::event;
use crate::nonce;
use crate::session::Scope;
use crate::settings::Settings;
use crate::token::{self, TokenKind};

const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const EVENT_KEEP_ROWS: i64 = 10_000;

/// Sweep worker configuration.
#[derive(Clone, Debug)]
pub struct TaskConfig {
    sweep_interval_seconds: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

impl TaskConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval_seconds = seconds;
        self
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Spawn the background sweeper.
pub fn spawn_sweeper(pool: PgPool, settings: Arc<Settings>, config: TaskConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = sweep_round(&pool, &settings).await {
                warn!("maintenance sweep failed: {err}");
            }
        }
    });
}

async fn sweep_round(pool: &PgPool, settings: &Settings) -> anyhow::Result<()> {
    let mut removed = 0;

    removed += token::sweep(pool, TokenKind::SsoState, settings.sso_state_ttl()).await?;
    removed += token::sweep(pool, TokenKind::KeybaseChallenge, settings.keybase_ttl()).await?;
    removed +=
        token::sweep(pool, TokenKind::KeybaseAssociation, settings.keybase_ttl()).await?;
    removed += token::sweep(pool, TokenKind::Secondary, settings.secondary_ttl()).await?;
    removed += nonce::sweep(pool, settings.nonce_ttl()).await?;

    // Sessions only need sweeping when some scope bounds idle time.
    let max_idle = [Scope::Admin, Scope::User, Scope::Proxy]
        .into_iter()
        .map(|scope| settings.session_expire(scope).num_minutes())
        .max()
        .unwrap_or(0);
    if max_idle > 0 {
        removed += crate::session::storage::sweep(pool, max_idle).await?;
    }

    removed += event::trim(pool, EVENT_KEEP_ROWS).await?;

    if removed > 0 {
        debug!("maintenance sweep removed {removed} rows");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::TaskConfig;
    use std::time::Duration;

    #[test]
    fn config_defaults_and_override() {
        let config = TaskConfig::new();
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));

        let config = config.with_sweep_interval_seconds(5);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
    }
}
