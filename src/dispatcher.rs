use crate::activity::{Activity, ActivityDescriptor, ActivityInfo, DispatchContext};
use crate::api_client::BotInfo;
use crate::datafeed_loop::FeedListener;
use crate::error::{EventError, RegistryError};
use crate::event::FeedEvent;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Routes datafeed events to registered activities.
///
/// Activities are tried in registration order and the first one whose
/// matcher accepts the event handles it. Events initiated by the bot itself
/// are ignored. Failures of an activity never reach the datafeed loop,
/// except re-queue requests.
#[derive(Default)]
pub struct ActivityDispatcher {
    activities: RwLock<Vec<Arc<dyn Activity>>>,
    bot: Option<BotInfo>,
}

impl ActivityDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher for `bot`: its own events are skipped and its display name
    /// is available to matchers.
    pub fn with_bot(bot: BotInfo) -> Self {
        Self {
            activities: RwLock::new(Vec::new()),
            bot: Some(bot),
        }
    }

    pub fn bot(&self) -> Option<&BotInfo> {
        self.bot.as_ref()
    }

    pub fn register<A>(&self, activity: A) -> Result<(), RegistryError>
    where
        A: Activity + 'static,
    {
        self.register_arc(Arc::new(activity))
    }

    pub fn register_arc(&self, activity: Arc<dyn Activity>) -> Result<(), RegistryError> {
        let mut activities = self
            .activities
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let identity = activity.identity();
        if activities.iter().any(|existing| existing.identity() == identity) {
            warn!("Activity {} is already registered", identity);
            return Err(RegistryError::Duplicate(identity));
        }

        debug!("Registered activity {}", identity);
        activities.push(activity);
        Ok(())
    }

    /// Shorthand for registering an [`ActivityDescriptor`].
    pub fn register_fn<M, H>(
        &self,
        name: impl Into<String>,
        matcher: M,
        handler: H,
    ) -> Result<(), RegistryError>
    where
        M: Fn(&DispatchContext<'_>) -> bool + Send + Sync + 'static,
        H: Fn(&mut DispatchContext<'_>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register(ActivityDescriptor::new(name, matcher, handler))
    }

    pub fn activity_infos(&self) -> Vec<ActivityInfo> {
        self.snapshot().iter().map(|activity| activity.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.activities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `event` to the activities. Returns whether one handled it.
    ///
    /// The only error returned is [`EventError::Requeue`].
    pub fn dispatch(&self, event: &FeedEvent) -> Result<bool, EventError> {
        if let Some(bot) = &self.bot {
            if event.initiator_id() == bot.id {
                debug!("Skipping event {} initiated by the bot", event.id);
                return Ok(false);
            }
        }

        for activity in self.snapshot() {
            let mut ctx = DispatchContext::new(event, self.bot.as_ref());
            let name = activity.info().name;

            if let Err(err) = activity.before_matcher(&mut ctx) {
                swallow(&name, "hook", err)?;
            }

            let matched = match activity.matches(&ctx) {
                Ok(matched) => matched,
                Err(err) => {
                    swallow(&name, "matcher", err)?;
                    false
                }
            };
            if !matched {
                continue;
            }

            debug!("Activity {} handles {} event {}", name, event.kind(), event.id);
            if let Err(err) = activity.on_activity(&mut ctx) {
                swallow(&name, "handler", err)?;
            }
            return Ok(true);
        }

        Ok(false)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Activity>> {
        self.activities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Logs an activity failure, passing re-queue requests through.
fn swallow(activity: &str, stage: &str, err: EventError) -> Result<(), EventError> {
    if err.is_requeue() {
        return Err(err);
    }
    warn!("Activity {} {} failed: {}", activity, stage, err);
    Ok(())
}

impl FeedListener for ActivityDispatcher {
    fn on_event(&self, event: &FeedEvent) -> Result<(), EventError> {
        self.dispatch(event).map(|_| ())
    }
}
