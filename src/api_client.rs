use crate::ack_policy::AckToken;
use crate::auth::SessionToken;
use crate::error::FeedError;
use crate::event::FeedEvent;
use crate::node::Node;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const DATAFEEDS_PATH: &str = "/agent/v5/datafeeds";
const SESSION_INFO_PATH: &str = "/pod/v2/sessioninfo";
const READ_GRACE: Duration = Duration::from_secs(5);

/// Events returned by one datafeed read, with the token acknowledging them.
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    pub events: Vec<FeedEvent>,
    pub ack: Option<AckToken>,
}

/// Identity of the authenticated bot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInfo {
    pub id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Datafeed endpoints. The node is chosen by the caller's load balancer.
#[async_trait]
pub trait DatafeedApi: Send + Sync {
    async fn create_datafeed(&self, node: &Node, session: &SessionToken)
        -> Result<String, FeedError>;

    /// Long-polls for events after `ack`. May block server-side until events
    /// arrive or the poll timeout elapses.
    async fn read_datafeed(
        &self,
        node: &Node,
        session: &SessionToken,
        feed_id: &str,
        ack: Option<&AckToken>,
    ) -> Result<FeedBatch, FeedError>;

    async fn delete_datafeed(
        &self,
        node: &Node,
        session: &SessionToken,
        feed_id: &str,
    ) -> Result<(), FeedError>;
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn session_info(&self, node: &Node, session: &SessionToken) -> Result<BotInfo, FeedError>;
}

#[derive(Deserialize)]
struct CreatedDatafeed {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest<'a> {
    ack_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadResponse {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    ack_id: Option<String>,
}

/// reqwest-backed implementation of the datafeed and session endpoints.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    client: Client,
    poll_timeout: Duration,
}

impl HttpApiClient {
    pub fn new(poll_timeout: Duration) -> Self {
        Self::with_client(Client::new(), poll_timeout)
    }

    pub fn with_client(client: Client, poll_timeout: Duration) -> Self {
        Self {
            client,
            poll_timeout,
        }
    }

    /// Sends a request stamped with the session headers and decodes the JSON
    /// body. `None` means the server answered 204.
    async fn send<U>(
        &self,
        node: &Node,
        session: &SessionToken,
        request: RequestBuilder,
        feed_id: Option<&str>,
    ) -> Result<Option<U>, FeedError>
    where
        U: DeserializeOwned,
    {
        let mut request = request.header("sessionToken", &session.session_token);
        if let Some(km_token) = &session.key_manager_token {
            request = request.header("keyManagerToken", km_token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| classify_transport_error(node, err))?;

        let status = response.status();
        debug!("Response status from {}: {}", node.base_url(), status);

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let response_text = response
            .text()
            .await
            .map_err(|err| classify_transport_error(node, err))?;

        if !status.is_success() {
            return Err(classify_status(node, status, &response_text, feed_id));
        }
        if response_text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&response_text).map(Some).map_err(|err| {
            FeedError::NonRecoverable(format!(
                "invalid response from {}: {}",
                node.base_url(),
                err
            ))
        })
    }
}

#[async_trait]
impl DatafeedApi for HttpApiClient {
    async fn create_datafeed(
        &self,
        node: &Node,
        session: &SessionToken,
    ) -> Result<String, FeedError> {
        let request = self.client.post(node.url(DATAFEEDS_PATH)).json(&serde_json::json!({}));
        let created: Option<CreatedDatafeed> = self.send(node, session, request, None).await?;
        created
            .map(|created| created.id)
            .ok_or_else(|| FeedError::NonRecoverable("datafeed creation returned no id".into()))
    }

    async fn read_datafeed(
        &self,
        node: &Node,
        session: &SessionToken,
        feed_id: &str,
        ack: Option<&AckToken>,
    ) -> Result<FeedBatch, FeedError> {
        let url = node.url(&format!("{}/{}/read", DATAFEEDS_PATH, feed_id));
        let body = ReadRequest {
            ack_id: ack.map(AckToken::as_str).unwrap_or(""),
        };
        let request = self
            .client
            .post(url)
            .timeout(self.poll_timeout + READ_GRACE)
            .json(&body);

        let Some(response) = self
            .send::<ReadResponse>(node, session, request, Some(feed_id))
            .await?
        else {
            return Ok(FeedBatch::default());
        };

        let mut events = Vec::with_capacity(response.events.len());
        for raw in response.events {
            match serde_json::from_value::<FeedEvent>(raw) {
                Ok(event) => events.push(event),
                Err(err) => warn!("Skipping undecodable event on datafeed {}: {}", feed_id, err),
            }
        }

        Ok(FeedBatch {
            events,
            ack: response
                .ack_id
                .filter(|ack| !ack.is_empty())
                .map(AckToken::new),
        })
    }

    async fn delete_datafeed(
        &self,
        node: &Node,
        session: &SessionToken,
        feed_id: &str,
    ) -> Result<(), FeedError> {
        let url = node.url(&format!("{}/{}", DATAFEEDS_PATH, feed_id));
        self.send::<Value>(node, session, self.client.delete(url), Some(feed_id))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl SessionApi for HttpApiClient {
    async fn session_info(&self, node: &Node, session: &SessionToken) -> Result<BotInfo, FeedError> {
        let request = self.client.get(node.url(SESSION_INFO_PATH));
        self.send(node, session, request, None)
            .await?
            .ok_or_else(|| FeedError::NonRecoverable("empty session info".into()))
    }
}

fn classify_transport_error(node: &Node, err: reqwest::Error) -> FeedError {
    if err.is_timeout() {
        FeedError::TransientNetwork(format!("request to {} timed out", node.base_url()))
    } else if err.is_connect() {
        FeedError::node_unavailable(node.base_url(), err.to_string())
    } else if err.is_builder() || err.is_decode() {
        FeedError::NonRecoverable(err.to_string())
    } else {
        FeedError::TransientNetwork(err.to_string())
    }
}

fn classify_status(node: &Node, status: StatusCode, body: &str, feed_id: Option<&str>) -> FeedError {
    match status {
        StatusCode::UNAUTHORIZED => {
            FeedError::Unauthorized(format!("{} rejected the session", node.base_url()))
        }
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND if feed_id.is_some() => {
            FeedError::StaleFeed(feed_id.unwrap_or_default().to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => {
            FeedError::TransientNetwork(format!("{} is throttling requests", node.base_url()))
        }
        status if status.is_server_error() => {
            FeedError::node_unavailable(node.base_url(), format!("status {}", status))
        }
        status => FeedError::NonRecoverable(format!(
            "request to {} failed with status {}: {}",
            node.base_url(),
            status,
            body
        )),
    }
}
