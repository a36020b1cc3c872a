use crate::api_client::BotInfo;
use crate::error::EventError;
use crate::event::{EventKind, EventPayload, FeedEvent, Initiator, Message};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Command,
    Form,
    Custom,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityKind::Command => f.write_str("command"),
            ActivityKind::Form => f.write_str("form"),
            ActivityKind::Custom => f.write_str("custom"),
        }
    }
}

/// Descriptive metadata of a registered activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivityInfo {
    pub kind: ActivityKind,
    pub name: String,
    pub description: String,
}

impl ActivityInfo {
    pub fn new(kind: ActivityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Per-dispatch view of one event. A fresh context is built for every
/// activity, so attributes set by one activity's hook are never seen by
/// another.
pub struct DispatchContext<'a> {
    event: &'a FeedEvent,
    bot: Option<&'a BotInfo>,
    text: Option<String>,
    attributes: HashMap<String, Value>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(event: &'a FeedEvent, bot: Option<&'a BotInfo>) -> Self {
        Self {
            event,
            bot,
            text: event.payload.message().map(Message::text),
            attributes: HashMap::new(),
        }
    }

    pub fn event(&self) -> &'a FeedEvent {
        self.event
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn payload(&self) -> &'a EventPayload {
        &self.event.payload
    }

    pub fn initiator(&self) -> &'a Initiator {
        &self.event.initiator
    }

    pub fn initiator_id(&self) -> i64 {
        self.event.initiator_id()
    }

    pub fn message(&self) -> Option<&'a Message> {
        self.event.payload.message()
    }

    /// Plain text of the carried message, markup stripped.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn stream_id(&self) -> Option<&'a str> {
        self.event
            .payload
            .stream()
            .map(|stream| stream.stream_id.as_str())
    }

    pub fn bot(&self) -> Option<&'a BotInfo> {
        self.bot
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// A reaction to datafeed events, driven by the [`ActivityDispatcher`].
///
/// For each event the dispatcher calls `before_matcher`, then `matches`, and
/// `on_activity` when it matched. Returning [`EventError::Requeue`] from any
/// of them asks the datafeed loop to redeliver the event; other errors are
/// logged and swallowed.
///
/// [`ActivityDispatcher`]: crate::dispatcher::ActivityDispatcher
pub trait Activity: Send + Sync {
    fn info(&self) -> ActivityInfo;

    /// Registration identity. Two activities with the same identity cannot be
    /// registered together.
    fn identity(&self) -> String {
        let info = self.info();
        format!("{}:{}", info.kind, info.name)
    }

    /// Enriches the context before matching. A failure here is logged and the
    /// activity is still matched.
    fn before_matcher(&self, _ctx: &mut DispatchContext<'_>) -> Result<(), EventError> {
        Ok(())
    }

    /// Must not have side effects.
    fn matches(&self, ctx: &DispatchContext<'_>) -> Result<bool, EventError>;

    fn on_activity(&self, ctx: &mut DispatchContext<'_>) -> Result<(), EventError>;
}

type Matcher = Box<dyn Fn(&DispatchContext<'_>) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&mut DispatchContext<'_>) -> Result<(), EventError> + Send + Sync>;

/// Activity assembled from a matcher closure and a handler closure.
pub struct ActivityDescriptor {
    info: ActivityInfo,
    matcher: Matcher,
    handler: Handler,
}

impl ActivityDescriptor {
    pub fn new<M, H>(name: impl Into<String>, matcher: M, handler: H) -> Self
    where
        M: Fn(&DispatchContext<'_>) -> bool + Send + Sync + 'static,
        H: Fn(&mut DispatchContext<'_>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        Self {
            info: ActivityInfo::new(ActivityKind::Custom, name),
            matcher: Box::new(matcher),
            handler: Box::new(handler),
        }
    }

    pub fn with_kind(mut self, kind: ActivityKind) -> Self {
        self.info.kind = kind;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.info.description = description.into();
        self
    }
}

impl Activity for ActivityDescriptor {
    fn info(&self) -> ActivityInfo {
        self.info.clone()
    }

    fn matches(&self, ctx: &DispatchContext<'_>) -> Result<bool, EventError> {
        Ok((self.matcher)(ctx))
    }

    fn on_activity(&self, ctx: &mut DispatchContext<'_>) -> Result<(), EventError> {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for ActivityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityDescriptor")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageSent, Stream, User};

    fn message_event(text: &str) -> FeedEvent {
        FeedEvent {
            id: "evt-1".to_string(),
            timestamp: Some(1),
            initiator: Initiator {
                user: User {
                    user_id: 42,
                    ..Default::default()
                },
            },
            payload: EventPayload::MessageSent(MessageSent {
                message: Message {
                    message_id: "msg-1".to_string(),
                    message: format!("<div data-format=\"PresentationML\">{}</div>", text),
                    stream: Stream {
                        stream_id: "stream-1".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            }),
        }
    }

    #[test]
    fn test_context_exposes_event() {
        let event = message_event("hello");
        let ctx = DispatchContext::new(&event, None);

        assert_eq!(ctx.kind(), EventKind::MessageSent);
        assert_eq!(ctx.initiator_id(), 42);
        assert_eq!(ctx.text(), Some("hello"));
        assert_eq!(ctx.stream_id(), Some("stream-1"));
        assert!(ctx.bot().is_none());
    }

    #[test]
    fn test_context_attributes() {
        let event = message_event("hello");
        let mut ctx = DispatchContext::new(&event, None);

        ctx.set_attribute("lang", "en");
        assert_eq!(ctx.attribute("lang"), Some(&Value::from("en")));
        assert!(ctx.attribute("missing").is_none());
    }

    #[test]
    fn test_descriptor_identity() {
        let activity = ActivityDescriptor::new("echo", |_| true, |_| Ok(()))
            .with_kind(ActivityKind::Form)
            .with_description("echoes");

        assert_eq!(activity.info().kind, ActivityKind::Form);
        assert_eq!(activity.info().description, "echoes");
        assert_eq!(activity.identity(), "form:echo");
    }
}
