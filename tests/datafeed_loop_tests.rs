use async_trait::async_trait;
use datafeed_rs::ack_policy::{AckToken, DatafeedVersion};
use datafeed_rs::api_client::{BotInfo, DatafeedApi, FeedBatch, SessionApi};
use datafeed_rs::auth::{AuthSession, Authenticator, SessionToken};
use datafeed_rs::config::Config;
use datafeed_rs::datafeed_loop::{DatafeedLoop, DatafeedSettings, FeedListener};
use datafeed_rs::error::{EventError, FeedError};
use datafeed_rs::event::FeedEvent;
use datafeed_rs::load_balancer::{Affinity, LoadBalancedClient};
use datafeed_rs::loop_state::LoopState;
use datafeed_rs::node::{Node, NodePool};
use datafeed_rs::retry::RetryConfig;
use datafeed_rs::rotation::RoundRobinStrategy;
use datafeed_rs::runtime::FeedRuntime;
use datafeed_rs::slash_command::SlashCommand;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const BOT_ID: i64 = 1;

enum Step {
    Batch(Vec<FeedEvent>, Option<&'static str>),
    Fail(FeedError),
    Hang,
}

#[derive(Debug, Clone)]
struct ReadCall {
    node: String,
    feed_id: String,
    ack: Option<String>,
    session: String,
}

/// In-memory datafeed server. Reads consume the script in order; once it is
/// empty they behave like a quiet long poll.
#[derive(Default)]
struct FakeApi {
    script: Mutex<VecDeque<Step>>,
    reads: Mutex<Vec<ReadCall>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    down: Mutex<HashSet<String>>,
}

impl FakeApi {
    fn with_script(steps: Vec<Step>) -> Arc<Self> {
        let api = Self::default();
        *api.script.lock().unwrap() = steps.into();
        Arc::new(api)
    }

    fn take_down(&self, node: &str) {
        self.down.lock().unwrap().insert(node.to_string());
    }

    fn reads(&self) -> Vec<ReadCall> {
        self.reads.lock().unwrap().clone()
    }

    fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn check_node(&self, node: &Node) -> Result<(), FeedError> {
        if self.down.lock().unwrap().contains(node.base_url()) {
            return Err(FeedError::node_unavailable(node.base_url(), "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl DatafeedApi for FakeApi {
    async fn create_datafeed(
        &self,
        node: &Node,
        _session: &SessionToken,
    ) -> Result<String, FeedError> {
        self.check_node(node)?;
        let mut created = self.created.lock().unwrap();
        created.push(node.base_url().to_string());
        Ok(format!("feed-{}", created.len()))
    }

    async fn read_datafeed(
        &self,
        node: &Node,
        session: &SessionToken,
        feed_id: &str,
        ack: Option<&AckToken>,
    ) -> Result<FeedBatch, FeedError> {
        self.reads.lock().unwrap().push(ReadCall {
            node: node.base_url().to_string(),
            feed_id: feed_id.to_string(),
            ack: ack.map(|ack| ack.as_str().to_string()),
            session: session.session_token.clone(),
        });
        self.check_node(node)?;

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Batch(events, ack)) => Ok(FeedBatch {
                events,
                ack: ack.map(AckToken::new),
            }),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => std::future::pending().await,
            None => {
                sleep(Duration::from_millis(10)).await;
                Ok(FeedBatch::default())
            }
        }
    }

    async fn delete_datafeed(
        &self,
        node: &Node,
        _session: &SessionToken,
        feed_id: &str,
    ) -> Result<(), FeedError> {
        self.check_node(node)?;
        self.deleted.lock().unwrap().push(feed_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn session_info(&self, node: &Node, _session: &SessionToken) -> Result<BotInfo, FeedError> {
        self.check_node(node)?;
        Ok(BotInfo {
            id: BOT_ID,
            display_name: "helper".to_string(),
            username: Some("helper-bot".to_string()),
        })
    }
}

/// Issues `token-1`, `token-2`, ...
#[derive(Default)]
struct CountingAuthenticator {
    issued: AtomicUsize,
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn authenticate(&self) -> Result<SessionToken, FeedError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionToken::new(format!("token-{}", n)))
    }
}

/// Records event ids; re-queues each id in `requeue_once` the first time.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    requeue_once: Mutex<HashSet<String>>,
}

impl Recorder {
    fn requeueing(ids: &[&str]) -> Arc<Self> {
        let recorder = Self::default();
        recorder
            .requeue_once
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
        Arc::new(recorder)
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl FeedListener for Recorder {
    fn on_event(&self, event: &FeedEvent) -> Result<(), EventError> {
        self.seen.lock().unwrap().push(event.id.clone());
        if self.requeue_once.lock().unwrap().remove(&event.id) {
            return Err(EventError::requeue("not ready yet"));
        }
        Ok(())
    }
}

fn message(id: &str, user_id: i64, text: &str) -> FeedEvent {
    serde_json::from_value(json!({
        "id": id,
        "type": "MESSAGESENT",
        "initiator": {"user": {"userId": user_id}},
        "payload": {"messageSent": {"message": {
            "messageId": format!("msg-{}", id),
            "message": format!("<div data-format=\"PresentationML\">{}</div>", text),
            "stream": {"streamId": "stream-1"}
        }}}
    }))
    .unwrap()
}

fn joined_room(id: &str, user_id: i64) -> FeedEvent {
    serde_json::from_value(json!({
        "id": id,
        "type": "USERJOINEDROOM",
        "initiator": {"user": {"userId": user_id}},
        "payload": {"userJoinedRoom": {
            "stream": {"streamId": "stream-1"},
            "affectedUser": {"userId": user_id}
        }}
    }))
    .unwrap()
}

fn batch(ids: &[&str]) -> Vec<FeedEvent> {
    ids.iter().map(|id| message(id, 42, "hello")).collect()
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_interval: Duration::from_millis(1),
        multiplier: 2.0,
        max_interval: Duration::from_millis(10),
        deadline: None,
        jitter: false,
    }
}

struct Harness {
    feed: DatafeedLoop,
    client: Arc<LoadBalancedClient>,
    auth: Arc<AuthSession>,
}

fn harness(api: &Arc<FakeApi>, nodes: &[&str], version: DatafeedVersion) -> Harness {
    harness_with(api, nodes, version, fast_retry(5), 3)
}

fn harness_with(
    api: &Arc<FakeApi>,
    nodes: &[&str],
    version: DatafeedVersion,
    retry: RetryConfig,
    rotate_after_failures: u32,
) -> Harness {
    let pool = NodePool::new(nodes.iter().copied(), Duration::from_secs(60));
    let client = Arc::new(LoadBalancedClient::new(
        pool,
        Arc::new(RoundRobinStrategy::new()),
        Affinity::Sticky,
    ));
    let auth = Arc::new(AuthSession::new(Arc::new(CountingAuthenticator::default())));
    let settings = DatafeedSettings {
        version,
        retry,
        rotate_after_failures,
    };
    let feed = DatafeedLoop::new(api.clone(), client.clone(), auth.clone(), settings);
    Harness { feed, client, auth }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_v1_redelivers_window_from_held_cursor() {
    let api = FakeApi::with_script(vec![
        Step::Batch(batch(&["e1", "e2", "e3"]), Some("ack-1")),
        // Nothing was acknowledged, so the server resends the window
        Step::Batch(batch(&["e1", "e2", "e3"]), Some("ack-1")),
    ]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V1);
    let recorder = Recorder::requeueing(&["e2"]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| api.reads().len() >= 3).await;
    h.feed.stop().await.unwrap();

    assert_eq!(recorder.seen(), vec!["e1", "e2", "e1", "e2", "e3"]);
    let reads = api.reads();
    assert_eq!(reads[0].ack, None);
    assert_eq!(reads[1].ack, None);
    assert_eq!(reads[2].ack.as_deref(), Some("ack-1"));
}

#[tokio::test]
async fn test_v2_reinjects_only_failed_events() {
    let api = FakeApi::with_script(vec![Step::Batch(batch(&["e1", "e2", "e3"]), Some("ack-1"))]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&["e2"]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| recorder.seen().len() >= 4).await;
    h.feed.stop().await.unwrap();

    assert_eq!(recorder.seen(), vec!["e1", "e2", "e3", "e2"]);
    assert_eq!(api.reads()[1].ack.as_deref(), Some("ack-1"));
}

#[tokio::test]
async fn test_v2_requeued_event_delivered_before_stop() {
    let api = FakeApi::with_script(vec![
        Step::Batch(batch(&["e1", "e2", "e3"]), Some("ack-1")),
        Step::Hang,
    ]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&["e2"]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| api.reads().len() == 2).await;
    assert_eq!(recorder.seen(), vec!["e1", "e2", "e3"]);

    h.feed.stop().await.unwrap();
    assert_eq!(recorder.seen(), vec!["e1", "e2", "e3", "e2"]);
}

#[tokio::test]
async fn test_v2_requeued_event_delivered_when_loop_fails() {
    let api = FakeApi::with_script(vec![
        Step::Batch(batch(&["e1", "e2"]), Some("ack-1")),
        Step::Fail(FeedError::NonRecoverable("forbidden".to_string())),
    ]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&["e1"]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    assert!(h.feed.join().await.is_err());

    assert_eq!(recorder.seen(), vec!["e1", "e2", "e1"]);
}

#[tokio::test]
async fn test_listener_failure_does_not_requeue() {
    let api = FakeApi::with_script(vec![Step::Batch(batch(&["e1", "e2"]), Some("ack-1"))]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.feed.subscribe(Arc::new(move |event: &FeedEvent| -> Result<(), EventError> {
        sink.lock().unwrap().push(event.id.clone());
        Err(EventError::from(anyhow::anyhow!("handler bug")))
    }));

    h.feed.start().await.unwrap();
    wait_until(|| api.reads().len() >= 2).await;
    h.feed.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["e1", "e2"]);
    assert_eq!(api.reads()[1].ack.as_deref(), Some("ack-1"));
}

#[tokio::test]
async fn test_unsubscribe() {
    let api = FakeApi::with_script(vec![]);
    let h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let listener: Arc<dyn FeedListener> = Recorder::requeueing(&[]);

    h.feed.subscribe(listener.clone());
    assert!(h.feed.unsubscribe(&listener));
    assert!(!h.feed.unsubscribe(&listener));
}

#[tokio::test]
async fn test_failover_to_healthy_node() {
    let api = FakeApi::with_script(vec![Step::Batch(batch(&["e1"]), Some("ack-1"))]);
    api.take_down("http://node-a");
    let mut h = harness(&api, &["http://node-a", "http://node-b"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&[]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| recorder.seen().len() == 1).await;

    assert_eq!(api.created(), vec!["http://node-b"]);
    let current = h.client.current_node().unwrap();
    assert_eq!(current.base_url(), "http://node-b");
    assert!(api.reads().iter().all(|read| read.node == "http://node-b"));

    h.feed.stop().await.unwrap();
    assert!(h.client.current_node().is_none());
}

#[tokio::test]
async fn test_loop_survives_single_node_blip() {
    let api = FakeApi::with_script(vec![
        Step::Fail(FeedError::node_unavailable("http://node-a", "connection refused")),
        Step::Batch(batch(&["e1"]), Some("ack-1")),
    ]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&[]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| recorder.seen().len() == 1).await;

    // The node is still inside its 60s cooldown but serves the loop again
    assert!(h.feed.is_running().await);
    assert!(h.client.pool().nodes()[0].is_healthy());
    assert!(api.reads().iter().all(|read| read.node == "http://node-a"));

    h.feed.stop().await.unwrap();
    assert_eq!(h.feed.state().await, LoopState::Stopped);
}

#[tokio::test]
async fn test_rotates_after_consecutive_failures() {
    let api = FakeApi::with_script(vec![
        Step::Fail(FeedError::TransientNetwork("reset".to_string())),
        Step::Fail(FeedError::TransientNetwork("reset".to_string())),
        Step::Batch(batch(&["e1"]), Some("ack-1")),
    ]);
    let mut h = harness_with(
        &api,
        &["http://node-a", "http://node-b"],
        DatafeedVersion::V2,
        fast_retry(5),
        2,
    );
    let recorder = Recorder::requeueing(&[]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| recorder.seen().len() == 1).await;
    h.feed.stop().await.unwrap();

    let reads = api.reads();
    assert_eq!(reads[0].node, reads[1].node);
    assert_ne!(reads[1].node, reads[2].node);
    // Transient failures do not mark nodes unhealthy
    assert_eq!(h.client.pool().healthy_count(), 2);
}

#[tokio::test]
async fn test_unauthorized_refreshes_session() {
    let api = FakeApi::with_script(vec![
        Step::Fail(FeedError::Unauthorized("expired".to_string())),
        Step::Batch(batch(&["e1"]), Some("ack-1")),
    ]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&[]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| recorder.seen().len() == 1).await;
    h.feed.stop().await.unwrap();

    // One refresh to establish the session, one after the rejection
    assert_eq!(h.auth.refresh_count(), 2);
    let reads = api.reads();
    assert_eq!(reads[0].session, "token-1");
    assert_eq!(reads[1].session, "token-2");
}

#[tokio::test]
async fn test_stale_feed_is_recreated() {
    let api = FakeApi::with_script(vec![
        Step::Batch(batch(&["e1"]), Some("ack-1")),
        Step::Fail(FeedError::StaleFeed("feed-1".to_string())),
        Step::Batch(batch(&["e2"]), Some("ack-9")),
    ]);
    let mut h = harness(&api, &["http://node-a", "http://node-b"], DatafeedVersion::V2);
    let recorder = Recorder::requeueing(&[]);
    h.feed.subscribe(recorder.clone());

    h.feed.start().await.unwrap();
    wait_until(|| recorder.seen().len() == 2).await;
    h.feed.stop().await.unwrap();

    assert_eq!(api.created().len(), 2);
    let reads = api.reads();
    assert_eq!(reads[1].feed_id, "feed-1");
    assert_eq!(reads[1].ack.as_deref(), Some("ack-1"));
    // The new feed starts from scratch
    assert_eq!(reads[2].feed_id, "feed-2");
    assert_eq!(reads[2].ack, None);
}

#[tokio::test]
async fn test_stop_deletes_datafeed() {
    let api = FakeApi::with_script(vec![]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);

    h.feed.start().await.unwrap();
    wait_until(|| !api.reads().is_empty()).await;
    assert!(api.deleted().is_empty());

    h.feed.stop().await.unwrap();
    assert_eq!(api.deleted(), vec!["feed-1"]);
}

#[tokio::test]
async fn test_fatal_error_is_observable() {
    let api = FakeApi::with_script(vec![Step::Fail(FeedError::NonRecoverable(
        "forbidden".to_string(),
    ))]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let reported = Arc::new(Mutex::new(None));
    let sink = reported.clone();
    h.feed
        .on_termination(move |err| *sink.lock().unwrap() = err.map(|err| err.to_string()));

    h.feed.start().await.unwrap();
    let err = h.feed.join().await.unwrap_err();

    assert!(matches!(err, FeedError::NonRecoverable(_)));
    assert!(matches!(h.feed.state().await, LoopState::Failed(_)));
    assert!(reported.lock().unwrap().as_deref().unwrap().contains("forbidden"));
}

#[tokio::test]
async fn test_retry_exhaustion_stops_loop() {
    let api = FakeApi::with_script(
        (0..3)
            .map(|_| Step::Fail(FeedError::TransientNetwork("reset".to_string())))
            .collect(),
    );
    let mut h = harness_with(&api, &["http://node-a"], DatafeedVersion::V2, fast_retry(3), 10);

    h.feed.start().await.unwrap();
    let err = h.feed.join().await.unwrap_err();

    match err {
        FeedError::RetryExhausted { attempts, source, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, FeedError::TransientNetwork(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_exhausted_pool_stops_loop() {
    let api = FakeApi::with_script(vec![]);
    let mut h = harness_with(&api, &["http://node-a"], DatafeedVersion::V2, fast_retry(3), 10);

    h.feed.start().await.unwrap();
    api.take_down("http://node-a");
    let err = h.feed.join().await.unwrap_err();

    assert!(matches!(err, FeedError::NodePoolExhausted { .. }));
    assert!(!h.client.pool().nodes()[0].is_healthy());
}

#[tokio::test]
async fn test_start_fails_when_feed_cannot_be_created() {
    let api = FakeApi::with_script(vec![]);
    api.take_down("http://node-a");
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);

    let err = h.feed.start().await.unwrap_err();
    assert!(matches!(err, FeedError::NodePoolExhausted { .. }));
    assert!(h.feed.state().await.is_terminal());
}

#[tokio::test]
async fn test_stop_interrupts_long_poll() {
    let api = FakeApi::with_script(vec![Step::Hang]);
    let mut h = harness(&api, &["http://node-a"], DatafeedVersion::V2);
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = stopped.clone();
    h.feed.on_termination(move |err| {
        assert!(err.is_none());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.feed.start().await.unwrap();
    assert!(h.feed.is_running().await);
    wait_until(|| api.reads().len() == 1).await;

    timeout(Duration::from_secs(1), h.feed.stop())
        .await
        .expect("stop did not interrupt the read")
        .unwrap();

    assert_eq!(h.feed.state().await, LoopState::Stopped);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert!(h.feed.start().await.is_err());
}

const RUNTIME_CONFIG: &str = r#"
[agent]
nodes = ["http://agent-a", "http://agent-b"]
policy = "sticky"

[pod]
nodes = ["http://pod-a"]

[datafeed]
version = "v2"

[retry]
max_attempts = 3
initial_interval_ms = 1
max_interval_ms = 10
"#;

#[tokio::test]
async fn test_runtime_dispatches_ping_command() {
    let api = FakeApi::with_script(vec![Step::Batch(
        vec![
            message("e1", 42, "/ping"),
            joined_room("e2", 42),
            message("e3", BOT_ID, "/ping"),
            message("e4", 43, "/pong"),
        ],
        Some("ack-1"),
    )]);
    let config = Config::from_toml_str(RUNTIME_CONFIG).unwrap();
    let mut runtime = FeedRuntime::with_api(
        config,
        Arc::new(CountingAuthenticator::default()),
        api.clone(),
    )
    .await
    .unwrap();
    assert_eq!(runtime.bot_info().id, BOT_ID);

    let pings = Arc::new(Mutex::new(Vec::new()));
    let sink = pings.clone();
    runtime
        .activities()
        .register(
            SlashCommand::new("/ping", false, move |ctx| {
                sink.lock().unwrap().push(ctx.initiator_id());
                Ok(())
            })
            .unwrap(),
        )
        .unwrap();

    runtime.start().await.unwrap();
    wait_until(|| api.reads().len() >= 2).await;
    runtime.stop().await.unwrap();

    assert_eq!(*pings.lock().unwrap(), vec![42]);
    assert_eq!(runtime.session_info().await.unwrap().display_name, "helper");
}
