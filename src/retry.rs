use crate::error::{ErrorKind, FeedError};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Total time budget across all attempts and waits.
    pub deadline: Option<Duration>,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            deadline: None,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the `attempt`-th failure (1-based):
    /// `min(initial_interval * multiplier^(attempt - 1), max_interval)`.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_interval.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_interval.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }

    /// Interval sequence over `max_attempts` attempts.
    pub fn intervals(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|n| self.interval_for(n)).collect()
    }
}

pub type RecoveryAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), FeedError>> + Send + Sync>;
type FailurePredicate = Arc<dyn Fn(&FeedError) -> bool + Send + Sync>;

/// A failure predicate paired with the recovery action to run before retrying.
#[derive(Clone)]
pub struct RetryRule {
    name: String,
    predicate: FailurePredicate,
    recovery: Option<RecoveryAction>,
}

impl RetryRule {
    pub fn new<P, R, Fut>(name: impl Into<String>, predicate: P, recovery: R) -> Self
    where
        P: Fn(&FeedError) -> bool + Send + Sync + 'static,
        R: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FeedError>> + Send + 'static,
    {
        let recovery: RecoveryAction = Arc::new(move || recovery().boxed());
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            recovery: Some(recovery),
        }
    }

    /// A rule whose only recovery is waiting out the backoff.
    pub fn backoff_only<P>(name: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&FeedError) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            recovery: None,
        }
    }

    /// Backoff-only rule for transient network failures.
    pub fn transient() -> Self {
        Self::backoff_only("transient-network", |err| {
            err.kind() == ErrorKind::TransientNetwork
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, err: &FeedError) -> bool {
        (self.predicate)(err)
    }
}

impl fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRule")
            .field("name", &self.name)
            .field("has_recovery", &self.recovery.is_some())
            .finish()
    }
}

/// Runs fallible operations with bounded exponential backoff, consulting an
/// ordered list of [`RetryRule`]s after each failure.
///
/// The executor keeps no per-call state, so a single instance can be shared by
/// concurrent operations.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    rules: Arc<Vec<RetryRule>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, rules: Vec<RetryRule>) -> Self {
        Self {
            config,
            rules: Arc::new(rules),
        }
    }

    pub fn with_rule(mut self, rule: RetryRule) -> Self {
        Arc::make_mut(&mut self.rules).push(rule);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn rules(&self) -> &[RetryRule] {
        &self.rules
    }

    /// Executes `operation` until it succeeds, a failure matches no rule, or the
    /// attempt/deadline budget runs out.
    ///
    /// Failures matching no rule are returned unchanged, without further
    /// attempts. Exhaustion wraps the last failure in
    /// [`FeedError::RetryExhausted`].
    pub async fn execute<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, FeedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempts", name, attempt);
                    }
                    return Ok(result);
                }
                Err(err) => err,
            };

            let Some(rule) = self.rules.iter().find(|rule| rule.matches(&err)) else {
                debug!("{} failed with an unrecoverable error: {}", name, err);
                return Err(err);
            };

            let elapsed = started.elapsed();
            if attempt >= self.config.max_attempts {
                warn!("{} failed after {} attempts: {}", name, attempt, err);
                return Err(exhausted(name, attempt, elapsed, err));
            }

            let interval = self.backoff(attempt);
            if let Some(deadline) = self.config.deadline {
                if elapsed.saturating_add(interval) > deadline {
                    warn!(
                        "{} would exceed its {:?} deadline, giving up after {} attempts: {}",
                        name, deadline, attempt, err
                    );
                    return Err(exhausted(name, attempt, elapsed, err));
                }
            }

            if let Some(recovery) = &rule.recovery {
                info!("Running recovery '{}' for {}", rule.name, name);
                recovery().await?;
            }

            warn!(
                "Attempt {} of {} failed: {}. Retrying in {:?}...",
                attempt, name, err, interval
            );
            sleep(interval).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let interval = self.config.interval_for(attempt);
        if self.config.jitter {
            // Never exceeds the computed interval
            interval.mul_f64(0.5 + rand::random::<f64>() * 0.5)
        } else {
            interval
        }
    }
}

fn exhausted(name: &str, attempts: u32, elapsed: Duration, err: FeedError) -> FeedError {
    FeedError::RetryExhausted {
        operation: name.to_string(),
        attempts,
        elapsed,
        source: Box::new(err),
    }
}
