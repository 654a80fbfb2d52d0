//! Bounded retries for reads that may lag behind writes.
//!
//! The server's read path can trail its write path (a freshly created group is
//! not always found by path right away). [`RetryHandler`] polls a lookup until
//! it yields a value, sleeping between attempts through an injected
//! [`Sleeper`] so tests control time and hosts can cancel waits.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{ReconcileError, Result};
use crate::policy::Category;

/// A wait was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Source of delays between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration) -> std::result::Result<(), Interrupted>;
}

/// Real-time sleeper, optionally cancelled through a watch channel.
pub struct TokioSleeper {
    cancel: Option<watch::Receiver<bool>>,
}

impl TokioSleeper {
    pub fn new(cancel: watch::Receiver<bool>) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    pub fn uncancellable() -> Self {
        Self { cancel: None }
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) -> std::result::Result<(), Interrupted> {
        let deadline = Instant::now() + delay;
        let Some(cancel) = &self.cancel else {
            tokio::time::sleep_until(deadline).await;
            return Ok(());
        };
        if *cancel.borrow() {
            return Err(Interrupted);
        }

        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Ok(()),
            cancelled = async { cancel.wait_for(|cancelled| *cancelled).await.is_ok() } => {
                if cancelled {
                    Err(Interrupted)
                } else {
                    // Sender gone: nobody can cancel any more.
                    tokio::time::sleep_until(deadline).await;
                    Ok(())
                }
            }
        }
    }
}

/// Sleeper that returns immediately and records requested delays.
#[derive(Default)]
pub struct ManualSleeper {
    slept: Mutex<Vec<Duration>>,
    interrupt_after: Option<usize>,
}

impl ManualSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an interruption once `sleeps` waits have completed.
    pub fn interrupting_after(sleeps: usize) -> Self {
        Self {
            slept: Mutex::new(Vec::new()),
            interrupt_after: Some(sleeps),
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for ManualSleeper {
    async fn sleep(&self, delay: Duration) -> std::result::Result<(), Interrupted> {
        let mut slept = self.slept.lock().map_err(|_| Interrupted)?;
        if self.interrupt_after.is_some_and(|limit| slept.len() >= limit) {
            return Err(Interrupted);
        }
        slept.push(delay);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
        }
    }
}

/// Polls a lookup until it succeeds or the attempt budget is spent.
#[derive(Clone)]
pub struct RetryHandler {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `lookup` until it returns `Some`. Errors from `lookup` end the loop.
    pub async fn with_retry<T, F, Fut>(
        &self,
        realm: &str,
        category: Category,
        entity: &str,
        mut lookup: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(found) = lookup().await? {
                return Ok(found);
            }
            if attempt < attempts {
                debug!(
                    "{} in realm {} not visible yet (attempt {}/{}), waiting {:?}",
                    entity, realm, attempt, attempts, self.policy.delay
                );
                self.sleeper
                    .sleep(self.policy.delay)
                    .await
                    .map_err(|Interrupted| ReconcileError::Interrupted {
                        realm: realm.to_string(),
                        category,
                        entity: entity.to_string(),
                    })?;
            }
        }

        Err(ReconcileError::ConsistencyTimeout {
            realm: realm.to_string(),
            category,
            entity: entity.to_string(),
            attempts,
        })
    }
}
