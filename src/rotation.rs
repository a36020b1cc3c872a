use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Load-balancing mode as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMode {
    Random,
    #[default]
    RoundRobin,
    /// Reuse one node until it fails or is explicitly rotated away from.
    Sticky,
}

/// Chooses which node serves the next call.
pub trait RotationStrategy: Send + Sync + fmt::Debug {
    /// Picks one of `candidates`, a non-empty list of pool indices in pool order.
    fn select(&self, candidates: &[usize]) -> usize;

    fn name(&self) -> &'static str;
}

/// Uniform random choice on every selection. Seedable for reproducible runs.
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RandomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomStrategy").finish_non_exhaustive()
    }
}

impl RotationStrategy for RandomStrategy {
    fn select(&self, candidates: &[usize]) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        candidates[rng.random_range(0..candidates.len())]
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Walks the pool in order, wrapping around, skipping indices that are not
/// candidates.
#[derive(Debug)]
pub struct RoundRobinStrategy {
    last: AtomicUsize,
}

const NONE_SELECTED: usize = usize::MAX;

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            last: AtomicUsize::new(NONE_SELECTED),
        }
    }

    fn next_after(candidates: &[usize], last: usize) -> usize {
        if last == NONE_SELECTED {
            return candidates[0];
        }
        candidates
            .iter()
            .copied()
            .find(|&index| index > last)
            .unwrap_or(candidates[0])
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[usize]) -> usize {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(Self::next_after(candidates, last))
            })
            .unwrap_or_else(|last| last);
        Self::next_after(candidates, previous)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Builds the strategy used to pick nodes for `mode`. Sticky pools still need a
/// strategy for the moments they rotate; they walk the pool in order.
pub fn strategy_for(mode: LoadBalancingMode, seed: Option<u64>) -> Arc<dyn RotationStrategy> {
    match mode {
        LoadBalancingMode::Random => match seed {
            Some(seed) => Arc::new(RandomStrategy::with_seed(seed)),
            None => Arc::new(RandomStrategy::new()),
        },
        LoadBalancingMode::RoundRobin | LoadBalancingMode::Sticky => {
            Arc::new(RoundRobinStrategy::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let strategy = RoundRobinStrategy::new();
        let all = [0, 1, 2];
        let picks: Vec<usize> = (0..5).map(|_| strategy.select(&all)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_round_robin_skips_missing_candidates() {
        let strategy = RoundRobinStrategy::new();
        assert_eq!(strategy.select(&[0, 1, 2]), 0);
        assert_eq!(strategy.select(&[0, 2]), 2);
        assert_eq!(strategy.select(&[0, 2]), 0);
    }

    #[test]
    fn test_single_candidate() {
        let strategy = RoundRobinStrategy::new();
        assert_eq!(strategy.select(&[1]), 1);
        assert_eq!(strategy.select(&[1]), 1);
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let first = RandomStrategy::with_seed(7);
        let second = RandomStrategy::with_seed(7);
        let all = [0, 1, 2];

        let a: Vec<usize> = (0..20).map(|_| first.select(&all)).collect();
        let b: Vec<usize> = (0..20).map(|_| second.select(&all)).collect();

        assert_eq!(a, b);
        assert!(a.iter().all(|index| all.contains(index)));
    }

    #[test]
    fn test_random_stays_within_candidates() {
        let strategy = RandomStrategy::new();
        for _ in 0..50 {
            let picked = strategy.select(&[3, 5]);
            assert!(picked == 3 || picked == 5);
        }
    }

    #[test]
    fn test_strategy_for_mode() {
        assert_eq!(strategy_for(LoadBalancingMode::Random, Some(1)).name(), "random");
        assert_eq!(
            strategy_for(LoadBalancingMode::RoundRobin, None).name(),
            "round_robin"
        );
        assert_eq!(strategy_for(LoadBalancingMode::Sticky, None).name(), "round_robin");
    }
}
