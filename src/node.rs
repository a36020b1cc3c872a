use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NEVER_FAILED: i64 = i64::MIN;

/// A backend endpoint and its liveness state.
///
/// Health flags are flipped with compare-and-set so that concurrent callers
/// observing the same failure agree on who performed the transition.
#[derive(Debug)]
pub struct Node {
    base_url: String,
    healthy: AtomicBool,
    last_failure_ms: AtomicI64,
    failures: AtomicU64,
}

impl Node {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            healthy: AtomicBool::new(true),
            last_failure_ms: AtomicI64::new(NEVER_FAILED),
            failures: AtomicU64::new(0),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path` on this node.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        match self.last_failure_ms.load(Ordering::Acquire) {
            NEVER_FAILED => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    /// Records a failure. Returns `true` if this call moved the node from
    /// healthy to unhealthy.
    pub fn mark_unhealthy(&self) -> bool {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.healthy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` if this call moved the node from unhealthy to healthy.
    pub fn mark_healthy(&self) -> bool {
        self.healthy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Healthy nodes are always eligible; unhealthy ones become eligible again
    /// once `cooldown` has passed since their last failure.
    pub fn is_eligible(&self, cooldown: Duration) -> bool {
        if self.is_healthy() {
            return true;
        }
        match self.last_failure() {
            Some(failed_at) => {
                let since = Utc::now().signed_duration_since(failed_at);
                since.to_std().map(|since| since >= cooldown).unwrap_or(false)
            }
            None => true,
        }
    }
}

/// The fixed set of nodes a load-balanced client spreads its calls over.
#[derive(Debug, Clone)]
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    cooldown: Duration,
}

impl NodePool {
    pub fn new<I, S>(addresses: I, cooldown: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: addresses
                .into_iter()
                .map(|address| Arc::new(Node::new(address)))
                .collect(),
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Node>> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn position(&self, base_url: &str) -> Option<usize> {
        let base_url = base_url.trim_end_matches('/');
        self.nodes.iter().position(|node| node.base_url() == base_url)
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_healthy()).count()
    }

    /// Indices of nodes that may serve a call, skipping `exclude`.
    pub fn eligible_indices(&self, exclude: &[usize]) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(index, node)| !exclude.contains(index) && node.is_eligible(self.cooldown))
            .map(|(index, _)| index)
            .collect()
    }

    /// Node outside `exclude` whose last failure is the oldest. Lets a call
    /// reach the pool while every node is cooling down.
    pub fn least_recently_failed(&self, exclude: &[usize]) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(index, _)| !exclude.contains(index))
            .min_by_key(|(_, node)| node.last_failure_ms.load(Ordering::Acquire))
            .map(|(index, _)| index)
    }
}
