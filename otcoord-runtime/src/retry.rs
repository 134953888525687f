use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::time::sleep;

use crate::channel::{Command, SimChannel};
use crate::error::RuntimeError;

/// Bounded retry for a whole run attempt.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            cooldown_secs: 5,
        }
    }
}

impl RetryPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Run `attempt` up to `policy.max_attempts` times. Only transient failures
/// are retried, after the cooldown; everything else propagates immediately.
/// The last error propagates when the budget is exhausted.
pub async fn retry_run<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let mut tries = 1u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tries < policy.max_attempts => {
                warn!(
                    "run attempt {}/{} failed: {}; restarting in {}s",
                    tries, policy.max_attempts, e, policy.cooldown_secs
                );
                sleep(policy.cooldown()).await;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Preparation loop: ping the simulator until it answers. Unbounded on
/// purpose, the simulator's startup time is externally variable; the process
/// being terminated is the only way out.
pub async fn await_simulator<C: SimChannel + ?Sized>(channel: &C, cooldown: Duration) {
    let mut tries = 1u64;
    loop {
        match channel.send(&Command::Ping).await {
            Ok(()) => {
                info!("simulator responsive after {} attempt(s)", tries);
                return;
            }
            Err(e) => {
                debug!("simulator not ready (attempt {}): {}", tries, e);
                sleep(cooldown).await;
                tries += 1;
            }
        }
    }
}
