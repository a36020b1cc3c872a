//! Acknowledgement policies for the datafeed loop.
//!
//! The loop reads a batch, hands every event to its listeners and then asks
//! the policy what to do with the events a listener asked to re-queue. The two
//! datafeed versions differ only here:
//!
//! * [`ResendWindowPolicy`] (v1) stops at the first re-queued event and keeps
//!   the cursor where it was, so the next read returns the whole window again,
//!   including the events that were already handled.
//! * [`SelectiveAckPolicy`] (v2) dispatches the entire batch, acknowledges it,
//!   and hands the re-queued events back to the loop for reinjection ahead of
//!   the next batch. Only the failed events are seen twice.

use crate::event::FeedEvent;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatafeedVersion {
    V1,
    V2,
}

impl DatafeedVersion {
    /// Parses a version string. Anything other than `v2` means v1.
    pub fn of(version: &str) -> Self {
        if version.trim().eq_ignore_ascii_case("v2") {
            DatafeedVersion::V2
        } else {
            DatafeedVersion::V1
        }
    }

    pub fn ack_policy(&self) -> Box<dyn FeedAckPolicy> {
        match self {
            DatafeedVersion::V1 => Box::new(ResendWindowPolicy),
            DatafeedVersion::V2 => Box::new(SelectiveAckPolicy),
        }
    }
}

impl fmt::Display for DatafeedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatafeedVersion::V1 => f.write_str("v1"),
            DatafeedVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Opaque server-issued position in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last acknowledged position of one datafeed. Only ever replaced by a newer
/// token issued for a later read; never rewound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedCursor {
    ack: Option<AckToken>,
    advances: u64,
}

impl FeedCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack(&self) -> Option<&AckToken> {
        self.ack.as_ref()
    }

    pub fn advances(&self) -> u64 {
        self.advances
    }

    /// Moves the cursor to `next`. A read that returned no token leaves the
    /// cursor where it is.
    pub fn advance(&mut self, next: Option<AckToken>) {
        if let Some(next) = next {
            if self.ack.as_ref() != Some(&next) {
                self.ack = Some(next);
                self.advances += 1;
            }
        }
    }
}

/// What the loop does after the first re-queued event of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueAction {
    /// Skip the rest of the batch.
    AbortBatch,
    /// Keep dispatching the remaining events.
    Continue,
}

/// Verdict for a dispatched batch.
#[derive(Debug, Default)]
pub struct Settlement {
    pub advance_cursor: bool,
    /// Events to deliver again, ahead of the next batch.
    pub reinject: Vec<FeedEvent>,
}

pub trait FeedAckPolicy: Send + Sync + fmt::Debug {
    fn version(&self) -> DatafeedVersion;

    fn on_requeue(&self) -> RequeueAction;

    /// Decides how the cursor moves given the events re-queued during dispatch.
    fn settle(&self, requeued: Vec<FeedEvent>) -> Settlement;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResendWindowPolicy;

impl FeedAckPolicy for ResendWindowPolicy {
    fn version(&self) -> DatafeedVersion {
        DatafeedVersion::V1
    }

    fn on_requeue(&self) -> RequeueAction {
        RequeueAction::AbortBatch
    }

    fn settle(&self, requeued: Vec<FeedEvent>) -> Settlement {
        Settlement {
            advance_cursor: requeued.is_empty(),
            reinject: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectiveAckPolicy;

impl FeedAckPolicy for SelectiveAckPolicy {
    fn version(&self) -> DatafeedVersion {
        DatafeedVersion::V2
    }

    fn on_requeue(&self) -> RequeueAction {
        RequeueAction::Continue
    }

    fn settle(&self, requeued: Vec<FeedEvent>) -> Settlement {
        Settlement {
            advance_cursor: true,
            reinject: requeued,
        }
    }
}
