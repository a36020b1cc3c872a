use crate::ack_policy::{DatafeedVersion, FeedAckPolicy, FeedCursor, RequeueAction};
use crate::api_client::{DatafeedApi, FeedBatch};
use crate::auth::AuthSession;
use crate::config::Config;
use crate::error::{EventError, FeedError};
use crate::event::FeedEvent;
use crate::load_balancer::LoadBalancedClient;
use crate::loop_state::{LoopState, LoopStateManager};
use crate::retry::{RetryConfig, RetryExecutor, RetryRule};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every event the datafeed delivers, in order, on the loop's task.
///
/// Returning [`EventError::Requeue`] asks the loop to deliver the event again
/// later; any other error is logged and the event counts as processed.
pub trait FeedListener: Send + Sync {
    fn on_event(&self, event: &FeedEvent) -> Result<(), EventError>;
}

impl<F> FeedListener for F
where
    F: Fn(&FeedEvent) -> Result<(), EventError> + Send + Sync,
{
    fn on_event(&self, event: &FeedEvent) -> Result<(), EventError> {
        self(event)
    }
}

#[derive(Debug, Clone)]
pub struct DatafeedSettings {
    pub version: DatafeedVersion,
    pub retry: RetryConfig,
    /// Consecutive node-level read failures after which the loop moves to
    /// another node.
    pub rotate_after_failures: u32,
}

impl DatafeedSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            version: config.datafeed.version(),
            retry: config.retry.to_retry_config(),
            rotate_after_failures: config.datafeed.rotate_after_failures,
        }
    }
}

impl Default for DatafeedSettings {
    fn default() -> Self {
        Self {
            version: DatafeedVersion::V2,
            retry: RetryConfig::default(),
            rotate_after_failures: 3,
        }
    }
}

type TerminationCallback = Arc<dyn Fn(Option<&FeedError>) + Send + Sync>;

struct Shared {
    api: Arc<dyn DatafeedApi>,
    client: Arc<LoadBalancedClient>,
    auth: Arc<AuthSession>,
    policy: Box<dyn FeedAckPolicy>,
    settings: DatafeedSettings,
    listeners: RwLock<Vec<Arc<dyn FeedListener>>>,
    state: LoopStateManager,
    on_termination: RwLock<Option<TerminationCallback>>,
}

impl Shared {
    fn listeners(&self) -> Vec<Arc<dyn FeedListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_termination(&self, err: Option<&FeedError>) {
        let callback = self
            .on_termination
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

/// Long-polls a datafeed and pushes every event to the subscribed listeners.
///
/// The loop owns the feed cursor. After each batch it consults the version's
/// [`FeedAckPolicy`] to decide whether the cursor may move and which events
/// must be delivered again.
pub struct DatafeedLoop {
    shared: Arc<Shared>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Result<(), FeedError>>>,
}

impl DatafeedLoop {
    pub fn new(
        api: Arc<dyn DatafeedApi>,
        client: Arc<LoadBalancedClient>,
        auth: Arc<AuthSession>,
        settings: DatafeedSettings,
    ) -> Self {
        let policy = settings.version.ack_policy();
        Self::with_policy(api, client, auth, settings, policy)
    }

    pub fn with_policy(
        api: Arc<dyn DatafeedApi>,
        client: Arc<LoadBalancedClient>,
        auth: Arc<AuthSession>,
        settings: DatafeedSettings,
        policy: Box<dyn FeedAckPolicy>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                client,
                auth,
                policy,
                settings,
                listeners: RwLock::new(Vec::new()),
                state: LoopStateManager::new(),
                on_termination: RwLock::new(None),
            }),
            stop_tx: None,
            task: None,
        }
    }

    pub fn version(&self) -> DatafeedVersion {
        self.shared.policy.version()
    }

    pub fn subscribe(&self, listener: Arc<dyn FeedListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes a listener previously passed to [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, listener: &Arc<dyn FeedListener>) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        let target = Arc::as_ptr(listener) as *const ();
        listeners.retain(|existing| Arc::as_ptr(existing) as *const () != target);
        listeners.len() != before
    }

    /// Called once when the loop ends: with the error that killed it, or
    /// `None` after a requested stop.
    pub fn on_termination<F>(&self, callback: F)
    where
        F: Fn(Option<&FeedError>) + Send + Sync + 'static,
    {
        let callback: TerminationCallback = Arc::new(callback);
        *self
            .shared
            .on_termination
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub async fn state(&self) -> LoopState {
        self.shared.state.get_state().await
    }

    pub fn state_manager(&self) -> LoopStateManager {
        self.shared.state.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.is_running().await
    }

    /// Creates the datafeed and starts polling in a background task. Returns
    /// once the feed exists, or with the error that prevented creating it.
    pub async fn start(&mut self) -> Result<(), FeedError> {
        if self.task.is_some() || self.shared.state.get_state().await != LoopState::Created {
            return Err(FeedError::NonRecoverable(
                "datafeed loop can only be started once".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let runner = LoopRunner::new(self.shared.clone());
        self.task = Some(tokio::spawn(runner.run(stop_rx, ready_tx)));

        if ready_rx.await.is_ok() {
            info!("Datafeed loop started ({})", self.version());
            return Ok(());
        }

        // The runner dropped the ready signal: it already ended
        match self.task.take() {
            Some(handle) => flatten(handle.await),
            None => Ok(()),
        }
    }

    /// Signals the loop to stop, interrupting an in-flight read, and waits for
    /// it to finish. Returns the error that ended the loop, if any.
    pub async fn stop(&mut self) -> Result<(), FeedError> {
        if let Some(stop_tx) = &self.stop_tx {
            let _ = stop_tx.send(true);
        }

        match self.task.take() {
            Some(handle) => flatten(handle.await),
            None => Ok(()),
        }
    }

    /// Waits for the loop to end on its own.
    pub async fn join(&mut self) -> Result<(), FeedError> {
        match self.task.take() {
            Some(handle) => flatten(handle.await),
            None => Ok(()),
        }
    }
}

impl Drop for DatafeedLoop {
    fn drop(&mut self) {
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

fn flatten(joined: Result<Result<(), FeedError>, tokio::task::JoinError>) -> Result<(), FeedError> {
    joined.unwrap_or_else(|err| {
        Err(FeedError::NonRecoverable(format!(
            "datafeed loop task failed: {}",
            err
        )))
    })
}

/// State private to the polling task. The cursor lives here and nowhere else.
struct LoopRunner {
    shared: Arc<Shared>,
    executor: RetryExecutor,
    feed_id: Option<String>,
    cursor: FeedCursor,
    reinject: Vec<FeedEvent>,
    node_failures: Arc<AtomicU32>,
    exhausted_cycles: u32,
}

impl LoopRunner {
    fn new(shared: Arc<Shared>) -> Self {
        let node_failures = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(
            shared.settings.retry.clone(),
            vec![
                shared.auth.refresh_rule(),
                rotation_rule(
                    shared.client.clone(),
                    node_failures.clone(),
                    shared.settings.rotate_after_failures,
                ),
            ],
        );

        Self {
            shared,
            executor,
            feed_id: None,
            cursor: FeedCursor::new(),
            reinject: Vec::new(),
            node_failures,
            exhausted_cycles: 0,
        }
    }

    async fn run(
        mut self,
        mut stop_rx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), FeedError> {
        if let Err(err) = self.create_feed().await {
            return self.fail(err).await;
        }
        self.shared.state.set_state(LoopState::Subscribed).await;
        let _ = ready.send(());

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                read = self.read_batch() => read,
            };

            match read {
                Ok(batch) => {
                    self.node_failures.store(0, Ordering::SeqCst);
                    self.exhausted_cycles = 0;
                    self.deliver(batch);
                    self.shared.state.record_cycle().await;
                }
                Err(FeedError::StaleFeed(feed_id)) => {
                    warn!("Datafeed {} is stale, recreating it on another node", feed_id);
                    self.shared.client.rotate();
                    if let Err(err) = self.create_feed().await {
                        return self.fail(err).await;
                    }
                }
                Err(err @ FeedError::NodePoolExhausted { .. }) => {
                    self.exhausted_cycles += 1;
                    if self.exhausted_cycles >= self.shared.settings.retry.max_attempts {
                        return self.fail(err).await;
                    }
                    let wait = self.shared.settings.retry.interval_for(self.exhausted_cycles);
                    warn!(
                        "Datafeed read failed ({}), waiting {:?} before polling again",
                        err, wait
                    );
                    self.shared.client.rotate();
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        _ = sleep(wait) => {}
                    }
                }
                Err(err) => return self.fail(err).await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn create_feed(&mut self) -> Result<(), FeedError> {
        let shared = &self.shared;
        let feed_id = self
            .executor
            .execute("create-datafeed", || async move {
                let session = shared.auth.token().await?;
                shared
                    .client
                    .call(|node| {
                        let session = session.clone();
                        async move { shared.api.create_datafeed(&node, &session).await }
                    })
                    .await
            })
            .await?;

        info!("Datafeed {} created ({})", feed_id, shared.policy.version());
        self.feed_id = Some(feed_id);
        self.cursor = FeedCursor::new();
        Ok(())
    }

    async fn read_batch(&self) -> Result<FeedBatch, FeedError> {
        let feed_id = self
            .feed_id
            .clone()
            .ok_or_else(|| FeedError::NonRecoverable("no datafeed to read from".to_string()))?;
        let ack = self.cursor.ack().cloned();
        let shared = &self.shared;
        let (feed_id, ack) = (&feed_id, &ack);

        self.executor
            .execute("read-datafeed", || async move {
                let session = shared.auth.token().await?;
                shared
                    .client
                    .call(|node| {
                        let session = session.clone();
                        async move {
                            shared
                                .api
                                .read_datafeed(&node, &session, feed_id, ack.as_ref())
                                .await
                        }
                    })
                    .await
            })
            .await
    }

    fn deliver(&mut self, batch: FeedBatch) {
        let FeedBatch { events, ack } = batch;
        let mut pending = std::mem::take(&mut self.reinject);
        if !pending.is_empty() {
            info!("Redelivering {} re-queued event(s)", pending.len());
        }
        pending.extend(events);
        if pending.is_empty() {
            self.cursor.advance(ack);
            return;
        }
        debug!("Delivering {} event(s)", pending.len());

        let listeners = self.shared.listeners();
        let mut requeued = Vec::new();

        for event in pending {
            if offer(&listeners, &event) {
                requeued.push(event);
                if self.shared.policy.on_requeue() == RequeueAction::AbortBatch {
                    break;
                }
            }
        }

        let settlement = self.shared.policy.settle(requeued);
        if settlement.advance_cursor {
            self.cursor.advance(ack);
        } else {
            info!("Cursor held, the batch will be delivered again");
        }
        self.reinject = settlement.reinject;
    }

    async fn shutdown(&mut self) {
        self.shared.state.set_state(LoopState::Stopping).await;
        self.drain_reinject();
        self.delete_feed().await;
        self.shared.client.release_affinity();
        self.shared.state.set_state(LoopState::Stopped).await;
        info!("Datafeed loop stopped");
        self.shared.notify_termination(None);
    }

    async fn fail(&mut self, err: FeedError) -> Result<(), FeedError> {
        error!("Datafeed loop terminated: {}", err);
        self.shared.state.set_state(LoopState::Stopping).await;
        self.drain_reinject();
        self.shared.client.release_affinity();
        self.shared
            .state
            .set_state(LoopState::Failed(err.to_string()))
            .await;
        self.shared.notify_termination(Some(&err));
        Err(err)
    }

    /// Gives re-queued events still waiting for the next batch a last
    /// delivery before the loop exits. The cursor is already past them.
    fn drain_reinject(&mut self) {
        let held = std::mem::take(&mut self.reinject);
        if held.is_empty() {
            return;
        }
        info!("Redelivering {} re-queued event(s) before exiting", held.len());

        let listeners = self.shared.listeners();
        let discarded: Vec<String> = held
            .into_iter()
            .filter(|event| offer(&listeners, event))
            .map(|event| event.id)
            .collect();
        if !discarded.is_empty() {
            warn!(
                "Discarding re-queued event(s) on exit: {}",
                discarded.join(", ")
            );
        }
    }

    async fn delete_feed(&mut self) {
        let Some(feed_id) = self.feed_id.take() else {
            return;
        };
        match timeout(DELETE_TIMEOUT, delete_remote(&self.shared, &feed_id)).await {
            Ok(Ok(())) => info!("Datafeed {} deleted", feed_id),
            Ok(Err(err)) => warn!("Failed to delete datafeed {}: {}", feed_id, err),
            Err(_) => warn!("Timed out deleting datafeed {}", feed_id),
        }
    }
}

/// Hands `event` to each listener in turn. Returns `true` when one of them
/// re-queued it; the remaining listeners are skipped.
fn offer(listeners: &[Arc<dyn FeedListener>], event: &FeedEvent) -> bool {
    for listener in listeners {
        match listener.on_event(event) {
            Ok(()) => {}
            Err(EventError::Requeue(reason)) => {
                info!("Event {} re-queued: {}", event.id, reason);
                return true;
            }
            Err(err) => warn!("Listener failed on event {}: {}", event.id, err),
        }
    }
    false
}

async fn delete_remote(shared: &Shared, feed_id: &str) -> Result<(), FeedError> {
    let session = shared.auth.token().await?;
    shared
        .client
        .call(|node| {
            let session = session.clone();
            async move { shared.api.delete_datafeed(&node, &session, feed_id).await }
        })
        .await
}

/// Counts consecutive node-level failures and rotates the sticky client once
/// `threshold` is reached.
fn rotation_rule(
    client: Arc<LoadBalancedClient>,
    failures: Arc<AtomicU32>,
    threshold: u32,
) -> RetryRule {
    RetryRule::new("rotate-node", FeedError::is_node_level, move || {
        let client = client.clone();
        let failures = failures.clone();
        async move {
            let count = failures.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= threshold.max(1) {
                warn!("{} consecutive node-level failures, rotating node", count);
                client.rotate();
                failures.store(0, Ordering::SeqCst);
            }
            Ok(())
        }
    })
}
