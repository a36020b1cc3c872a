use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

/// Lifecycle of a datafeed loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Created,
    /// Poll loop running.
    Subscribed,
    Stopping,
    Stopped,
    /// Stopped by an unrecoverable error.
    Failed(String),
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed(_))
    }
}

#[derive(Clone)]
pub struct LoopStateManager {
    state: Arc<RwLock<LoopState>>,
    subscribed_at: Arc<RwLock<Option<Instant>>>,
    cycles: Arc<RwLock<u64>>,
}

impl LoopStateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LoopState::Created)),
            subscribed_at: Arc::new(RwLock::new(None)),
            cycles: Arc::new(RwLock::new(0)),
        }
    }

    pub async fn get_state(&self) -> LoopState {
        self.state.read().await.clone()
    }

    pub async fn set_state(&self, new_state: LoopState) {
        let mut state = self.state.write().await;

        if new_state == LoopState::Subscribed {
            *self.subscribed_at.write().await = Some(Instant::now());
            *self.cycles.write().await = 0;
        }

        if *state != new_state {
            info!("Datafeed loop state: {:?} -> {:?}", *state, new_state);
        }
        *state = new_state;
    }

    /// Records a completed poll cycle.
    pub async fn record_cycle(&self) {
        *self.cycles.write().await += 1;
    }

    pub async fn get_cycles(&self) -> u64 {
        *self.cycles.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.read().await, LoopState::Subscribed)
    }

    pub async fn subscribed_duration(&self) -> Option<std::time::Duration> {
        self.subscribed_at
            .read()
            .await
            .map(|instant| instant.elapsed())
    }
}

impl Default for LoopStateManager {
    fn default() -> Self {
        Self::new()
    }
}
