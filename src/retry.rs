//! Exponential backoff with jitter.

use std::{fmt, future::Future, time::Duration};

use rand::Rng as _;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Un-jittered delay before retry number `attempt` (0 based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }

    /// Delay before retry number `attempt`, with equal jitter: half fixed, half random.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let half = base / 2;
        if half.is_zero() {
            return base;
        }

        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=half);
        half + jitter
    }
}

/// Runs `op` until it succeeds, fails with an error `is_transient` rejects, or `max_attempts`
/// are used up.
pub async fn retry<T, E, F, Fut>(
    backoff: &Backoff,
    max_attempts: u32,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),

            Err(err) if is_transient(&err) && attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                log::warn!("{what} failed (attempt {}): {err}; retrying in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }

            Err(err) => return Err(err),
        }
    }
}
