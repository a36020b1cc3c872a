use std::time::Duration;
use thiserror::Error;

/// Classification of a failure, used by retry rules, the load balancer and the
/// datafeed loop to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retryable with plain backoff.
    TransientNetwork,
    /// Retryable once the session has been refreshed.
    Unauthorized,
    /// The node could not serve the call; retryable on another node.
    NodeUnavailable,
    /// Every node of the pool failed within one logical call.
    NodePoolExhausted,
    /// Raised by an event handler to have the event delivered again later.
    RetryEvent,
    /// The datafeed no longer exists server-side and must be recreated.
    StaleFeed,
    /// Nothing can be done about it; the caller has to give up.
    NonRecoverable,
}

/// Errors raised by network calls and by the datafeed loop.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("node {node} unavailable: {reason}")]
    NodeUnavailable { node: String, reason: String },

    #[error("node pool exhausted after trying {tried} node(s)")]
    NodePoolExhausted { tried: usize },

    #[error("datafeed {0} is stale")]
    StaleFeed(String),

    #[error("non-recoverable failure: {0}")]
    NonRecoverable(String),

    #[error("{operation} failed after {attempts} attempt(s) in {elapsed:?}: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<FeedError>,
    },
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            FeedError::Unauthorized(_) => ErrorKind::Unauthorized,
            FeedError::NodeUnavailable { .. } => ErrorKind::NodeUnavailable,
            FeedError::NodePoolExhausted { .. } => ErrorKind::NodePoolExhausted,
            FeedError::StaleFeed(_) => ErrorKind::StaleFeed,
            FeedError::NonRecoverable(_) | FeedError::RetryExhausted { .. } => {
                ErrorKind::NonRecoverable
            }
        }
    }

    /// Failures that the load balancer treats as a fault of the selected node.
    pub fn is_node_failure(&self) -> bool {
        matches!(self, FeedError::NodeUnavailable { .. })
    }

    /// Failures that count towards rotating away from a sticky node.
    pub fn is_node_level(&self) -> bool {
        matches!(
            self,
            FeedError::NodeUnavailable { .. } | FeedError::TransientNetwork(_)
        )
    }

    pub fn node_unavailable(node: impl Into<String>, reason: impl Into<String>) -> Self {
        FeedError::NodeUnavailable {
            node: node.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a listener or activity failing on one event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event must not be considered processed; the datafeed loop will
    /// deliver it again according to its acknowledgement policy.
    #[error("event must be re-queued: {0}")]
    Requeue(String),

    /// Any other failure. Logged, the event counts as processed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl EventError {
    pub fn requeue(reason: impl Into<String>) -> Self {
        EventError::Requeue(reason.into())
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, EventError::Requeue(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EventError::Requeue(_) => ErrorKind::RetryEvent,
            EventError::Failed(_) => ErrorKind::NonRecoverable,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("activity '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid command name '{0}'")]
    InvalidName(String),
}
