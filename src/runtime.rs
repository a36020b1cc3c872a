use crate::api_client::{BotInfo, DatafeedApi, HttpApiClient, SessionApi};
use crate::auth::{AuthSession, Authenticator};
use crate::config::Config;
use crate::datafeed_loop::{DatafeedLoop, DatafeedSettings};
use crate::dispatcher::ActivityDispatcher;
use crate::error::{ErrorKind, FeedError};
use crate::load_balancer::LoadBalancedClient;
use crate::retry::{RetryExecutor, RetryRule};
use std::sync::Arc;
use tracing::info;

/// Wires a bot together: session, load-balanced clients, datafeed loop and
/// activity dispatcher.
///
/// Construction authenticates and resolves the bot's identity, so a runtime
/// that exists is ready to [`start`](Self::start).
pub struct FeedRuntime {
    config: Config,
    auth: Arc<AuthSession>,
    pod_client: Arc<LoadBalancedClient>,
    session_api: Arc<dyn SessionApi>,
    executor: RetryExecutor,
    bot: BotInfo,
    dispatcher: Arc<ActivityDispatcher>,
    datafeed: DatafeedLoop,
}

impl FeedRuntime {
    pub async fn new(config: Config, authenticator: Arc<dyn Authenticator>) -> Result<Self, FeedError> {
        let api = Arc::new(HttpApiClient::new(config.datafeed.poll_timeout()));
        Self::with_api(config, authenticator, api).await
    }

    /// Builds a runtime over any implementation of the endpoints.
    pub async fn with_api<A>(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        api: Arc<A>,
    ) -> Result<Self, FeedError>
    where
        A: DatafeedApi + SessionApi + 'static,
    {
        let auth = Arc::new(AuthSession::new(authenticator));
        auth.refresh().await?;

        let pod_client = Arc::new(LoadBalancedClient::per_call(&config.pod));
        let session_api: Arc<dyn SessionApi> = api.clone();
        let executor = RetryExecutor::new(
            config.retry.to_retry_config(),
            vec![
                auth.refresh_rule(),
                RetryRule::transient(),
                RetryRule::backoff_only("node-pool-exhausted", |err| {
                    err.kind() == ErrorKind::NodePoolExhausted
                }),
            ],
        );

        let bot = fetch_session_info(&executor, &auth, &pod_client, session_api.as_ref()).await?;
        info!("Running as {} (id {})", bot.display_name, bot.id);

        let dispatcher = Arc::new(ActivityDispatcher::with_bot(bot.clone()));
        let agent_client = Arc::new(LoadBalancedClient::sticky(&config.agent));
        let datafeed_api: Arc<dyn DatafeedApi> = api;
        let datafeed = DatafeedLoop::new(
            datafeed_api,
            agent_client,
            auth.clone(),
            DatafeedSettings::from_config(&config),
        );
        datafeed.subscribe(dispatcher.clone());

        Ok(Self {
            config,
            auth,
            pod_client,
            session_api,
            executor,
            bot,
            dispatcher,
            datafeed,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn activities(&self) -> &ActivityDispatcher {
        &self.dispatcher
    }

    pub fn datafeed(&self) -> &DatafeedLoop {
        &self.datafeed
    }

    pub fn datafeed_mut(&mut self) -> &mut DatafeedLoop {
        &mut self.datafeed
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    /// Identity resolved when the runtime was built.
    pub fn bot_info(&self) -> &BotInfo {
        &self.bot
    }

    /// Asks the pod for the current session identity.
    pub async fn session_info(&self) -> Result<BotInfo, FeedError> {
        fetch_session_info(
            &self.executor,
            &self.auth,
            &self.pod_client,
            self.session_api.as_ref(),
        )
        .await
    }

    pub async fn start(&mut self) -> Result<(), FeedError> {
        self.datafeed.start().await
    }

    pub async fn stop(&mut self) -> Result<(), FeedError> {
        self.datafeed.stop().await
    }
}

async fn fetch_session_info(
    executor: &RetryExecutor,
    auth: &AuthSession,
    client: &LoadBalancedClient,
    api: &dyn SessionApi,
) -> Result<BotInfo, FeedError> {
    executor
        .execute("session-info", || async move {
            let session = auth.token().await?;
            client
                .call(|node| {
                    let session = session.clone();
                    async move { api.session_info(&node, &session).await }
                })
                .await
        })
        .await
}
