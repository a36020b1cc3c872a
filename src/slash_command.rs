use crate::activity::{Activity, ActivityInfo, ActivityKind, DispatchContext};
use crate::error::{EventError, RegistryError};
use crate::event::EventKind;
use std::fmt;

type Callback = Box<dyn Fn(&mut DispatchContext<'_>) -> Result<(), EventError> + Send + Sync>;

/// Command activity triggered by a message reading `/name`, or
/// `@<bot> /name` when a mention is required.
pub struct SlashCommand {
    name: String,
    requires_mention: bool,
    description: String,
    callback: Callback,
}

impl SlashCommand {
    /// `name` may be given with or without its leading slash.
    pub fn new<F>(name: &str, requires_mention: bool, callback: F) -> Result<Self, RegistryError>
    where
        F: Fn(&mut DispatchContext<'_>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let trimmed = name.trim().trim_start_matches('/');
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        Ok(Self {
            name: format!("/{}", trimmed),
            requires_mention,
            description: String::new(),
            callback: Box::new(callback),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requires_mention(&self) -> bool {
        self.requires_mention
    }

    fn expected_text(&self, ctx: &DispatchContext<'_>) -> Option<String> {
        if !self.requires_mention {
            return Some(self.name.clone());
        }
        ctx.bot()
            .map(|bot| format!("@{} {}", bot.display_name, self.name))
    }
}

impl Activity for SlashCommand {
    fn info(&self) -> ActivityInfo {
        let mention = if self.requires_mention {
            " (mention required)"
        } else {
            ""
        };
        ActivityInfo::new(ActivityKind::Command, self.name.clone())
            .with_description(format!("{}{}", self.description, mention).trim())
    }

    fn identity(&self) -> String {
        format!("{}:{}:{}", ActivityKind::Command, self.name, self.requires_mention)
    }

    fn matches(&self, ctx: &DispatchContext<'_>) -> Result<bool, EventError> {
        if ctx.kind() != EventKind::MessageSent {
            return Ok(false);
        }
        let (Some(text), Some(expected)) = (ctx.text(), self.expected_text(ctx)) else {
            return Ok(false);
        };
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(text == expected)
    }

    fn on_activity(&self, ctx: &mut DispatchContext<'_>) -> Result<(), EventError> {
        (self.callback)(ctx)
    }
}

impl fmt::Debug for SlashCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlashCommand")
            .field("name", &self.name)
            .field("requires_mention", &self.requires_mention)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::BotInfo;
    use crate::event::{
        EventPayload, FeedEvent, Initiator, Message, MessageSent, SharedPost, Stream,
    };

    fn message(text: &str) -> Message {
        Message {
            message_id: "m".to_string(),
            message: format!("<div data-format=\"PresentationML\">{}</div>", text),
            stream: Stream {
                stream_id: "s".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sent(text: &str) -> FeedEvent {
        FeedEvent {
            id: "e".to_string(),
            timestamp: None,
            initiator: Initiator::default(),
            payload: EventPayload::MessageSent(MessageSent {
                message: message(text),
            }),
        }
    }

    fn bot() -> BotInfo {
        BotInfo {
            id: 1,
            display_name: "helper".to_string(),
            username: None,
        }
    }

    #[test]
    fn test_name_validation() {
        assert!(SlashCommand::new("", false, |_| Ok(())).is_err());
        assert!(SlashCommand::new("/", false, |_| Ok(())).is_err());
        assert!(SlashCommand::new("two words", false, |_| Ok(())).is_err());
        assert_eq!(SlashCommand::new("ping", false, |_| Ok(())).unwrap().name(), "/ping");
        assert_eq!(SlashCommand::new("/ping", false, |_| Ok(())).unwrap().name(), "/ping");
    }

    #[test]
    fn test_matches_without_mention() {
        let command = SlashCommand::new("/ping", false, |_| Ok(())).unwrap();

        let event = sent("/ping");
        assert!(command.matches(&DispatchContext::new(&event, None)).unwrap());

        let event = sent("  /ping  ");
        assert!(command.matches(&DispatchContext::new(&event, None)).unwrap());

        let event = sent("/pingpong");
        assert!(!command.matches(&DispatchContext::new(&event, None)).unwrap());
    }

    #[test]
    fn test_matches_with_mention() {
        let command = SlashCommand::new("/ping", true, |_| Ok(())).unwrap();
        let bot = bot();

        let event = sent("@helper /ping");
        assert!(command.matches(&DispatchContext::new(&event, Some(&bot))).unwrap());
        // Without bot identity a mention cannot be checked
        assert!(!command.matches(&DispatchContext::new(&event, None)).unwrap());

        let event = sent("/ping");
        assert!(!command.matches(&DispatchContext::new(&event, Some(&bot))).unwrap());
    }

    #[test]
    fn test_other_kinds_ignored() {
        let command = SlashCommand::new("/ping", false, |_| Ok(())).unwrap();
        let event = FeedEvent {
            payload: EventPayload::SharedPost(SharedPost {
                message: message("/ping"),
            }),
            ..sent("/ping")
        };
        assert!(!command.matches(&DispatchContext::new(&event, None)).unwrap());
    }

    #[test]
    fn test_identity_includes_mention() {
        let plain = SlashCommand::new("/ping", false, |_| Ok(())).unwrap();
        let mentioned = SlashCommand::new("/ping", true, |_| Ok(())).unwrap();
        assert_ne!(plain.identity(), mentioned.identity());
        assert_eq!(mentioned.info().description, "(mention required)");
        assert_eq!(plain.with_description("pong").info().description, "pong");
    }
}
