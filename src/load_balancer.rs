use crate::config::NodePoolConfig;
use crate::error::FeedError;
use crate::node::{Node, NodePool};
use crate::rotation::{strategy_for, LoadBalancingMode, RotationStrategy};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a client picks a node across consecutive calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Ask the strategy for a node before every call.
    PerCall,
    /// Keep the same node until it fails or `rotate()` is called.
    Sticky,
}

#[derive(Debug, Default)]
struct StickyState {
    current: Option<usize>,
    rotated_from: Option<usize>,
}

/// Routes logical calls to the nodes of a [`NodePool`], failing over to the
/// remaining nodes when the selected one cannot serve the call.
#[derive(Debug)]
pub struct LoadBalancedClient {
    pool: NodePool,
    strategy: Arc<dyn RotationStrategy>,
    affinity: Affinity,
    sticky: Mutex<StickyState>,
}

impl LoadBalancedClient {
    pub fn new(pool: NodePool, strategy: Arc<dyn RotationStrategy>, affinity: Affinity) -> Self {
        Self {
            pool,
            strategy,
            affinity,
            sticky: Mutex::new(StickyState::default()),
        }
    }

    /// Client for stateless calls. Pools configured as `sticky` keep their
    /// node between calls, the others rotate on every call.
    pub fn per_call(config: &NodePoolConfig) -> Self {
        let affinity = match config.policy {
            LoadBalancingMode::Sticky => Affinity::Sticky,
            LoadBalancingMode::Random | LoadBalancingMode::RoundRobin => Affinity::PerCall,
        };
        Self::from_config(config, affinity)
    }

    /// Client for the long-poll datafeed, which needs session affinity.
    pub fn sticky(config: &NodePoolConfig) -> Self {
        Self::from_config(config, Affinity::Sticky)
    }

    fn from_config(config: &NodePoolConfig, affinity: Affinity) -> Self {
        let pool = NodePool::new(
            config.nodes.iter().cloned(),
            Duration::from_secs(config.unhealthy_cooldown_seconds),
        );
        Self::new(pool, strategy_for(config.policy, config.seed), affinity)
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Node the next sticky call goes to, if one is pinned.
    pub fn current_node(&self) -> Option<Arc<Node>> {
        let state = self.sticky_state();
        state.current.and_then(|index| self.pool.get(index).cloned())
    }

    /// Executes `operation` against the selected node.
    ///
    /// Node failures mark the node unhealthy and move the call to another
    /// node; each node is tried at most once per logical call. Nodes in
    /// cooldown are only tried once no other node is left. Any other failure
    /// is returned as-is.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, FeedError>
    where
        F: FnMut(Arc<Node>) -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        let mut tried: Vec<usize> = Vec::with_capacity(self.pool.len());

        loop {
            let Some(index) = self.select(&tried) else {
                warn!(
                    "No node left to serve the call, {} tried out of {}",
                    tried.len(),
                    self.pool.len()
                );
                return Err(FeedError::NodePoolExhausted { tried: tried.len() });
            };
            tried.push(index);

            let Some(node) = self.pool.get(index).cloned() else {
                continue;
            };

            match operation(node.clone()).await {
                Ok(result) => {
                    if node.mark_healthy() {
                        info!("Node {} is healthy again", node.base_url());
                    }
                    return Ok(result);
                }
                Err(err) if err.is_node_failure() => {
                    if node.mark_unhealthy() {
                        warn!("Marking node {} unhealthy: {}", node.base_url(), err);
                    }
                    self.unpin(index);
                    debug!("Failing over from node {}", node.base_url());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Forces the next sticky call onto a different node when one is available.
    /// Per-call clients already rotate on every call, so this is a no-op for them.
    pub fn rotate(&self) {
        if self.affinity == Affinity::PerCall {
            debug!("rotate() ignored by a per-call client");
            return;
        }
        let mut state = self.sticky_state();
        if let Some(current) = state.current.take() {
            if let Some(node) = self.pool.get(current) {
                info!("Rotating away from node {}", node.base_url());
            }
            state.rotated_from = Some(current);
        }
    }

    /// Drops any pinned node without steering the next selection.
    pub fn release_affinity(&self) {
        let mut state = self.sticky_state();
        state.current = None;
        state.rotated_from = None;
    }

    fn select(&self, tried: &[usize]) -> Option<usize> {
        match self.affinity {
            Affinity::PerCall => {
                let candidates = self.pool.eligible_indices(tried);
                if candidates.is_empty() {
                    self.fallback(tried)
                } else {
                    Some(self.strategy.select(&candidates))
                }
            }
            Affinity::Sticky => {
                let mut state = self.sticky_state();
                if let Some(current) = state.current {
                    let usable = self
                        .pool
                        .get(current)
                        .map(|node| node.is_eligible(self.pool.cooldown()))
                        .unwrap_or(false);
                    if usable && !tried.contains(&current) {
                        return Some(current);
                    }
                }

                let mut candidates = self.pool.eligible_indices(tried);
                if let Some(previous) = state.rotated_from.take() {
                    if candidates.len() > 1 {
                        candidates.retain(|&index| index != previous);
                    }
                }
                let selected = if candidates.is_empty() {
                    match self.fallback(tried) {
                        Some(index) => index,
                        None => {
                            state.current = None;
                            return None;
                        }
                    }
                } else {
                    self.strategy.select(&candidates)
                };
                state.current = Some(selected);
                if let Some(node) = self.pool.get(selected) {
                    info!(
                        "Pinned node {} ({} strategy)",
                        node.base_url(),
                        self.strategy.name()
                    );
                }
                Some(selected)
            }
        }
    }

    /// Every untried node is cooling down: try the one that failed longest ago.
    fn fallback(&self, tried: &[usize]) -> Option<usize> {
        let index = self.pool.least_recently_failed(tried)?;
        if let Some(node) = self.pool.get(index) {
            debug!(
                "No node out of cooldown, trying {} ahead of schedule",
                node.base_url()
            );
        }
        Some(index)
    }

    fn unpin(&self, index: usize) {
        if self.affinity == Affinity::Sticky {
            let mut state = self.sticky_state();
            if state.current == Some(index) {
                state.current = None;
            }
        }
    }

    fn sticky_state(&self) -> MutexGuard<'_, StickyState> {
        self.sticky.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
