//! # datafeed-rs
//!
//! Client runtime for long-poll datafeeds served by a pool of interchangeable
//! nodes: retries with backoff, node failover and rotation, at-least-once
//! event delivery, and routing of events to bot activities.
//!
//! ## Quick Start
//!
//! ```no_run
//! use datafeed_rs::{Config, FeedRuntime, SlashCommand, StaticAuthenticator};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! // Load configuration from config.toml
//! let config = Config::new()?;
//! let auth = config
//!     .auth
//!     .as_ref()
//!     .map(StaticAuthenticator::from_config)
//!     .ok_or_else(|| anyhow::anyhow!("no [auth] section"))?;
//!
//! // Authenticate and resolve the bot identity
//! let mut runtime = FeedRuntime::new(config, Arc::new(auth)).await?;
//!
//! // React to "/ping" messages
//! runtime.activities().register(SlashCommand::new("/ping", false, |ctx| {
//!     println!("ping from {}", ctx.initiator_id());
//!     Ok(())
//! })?)?;
//!
//! runtime.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Retry Executor**: Rule-based retries with exponential backoff, recovery actions and deadlines
//! - **Load Balancing**: Random, round-robin or sticky node selection with failover and health cooldown
//! - **Datafeed Loop**: Long-poll reads with v1 (resend window) or v2 (selective ack) redelivery
//! - **Activities**: First-match dispatch of events to commands, forms and custom activities
//!
//! ## Configuration
//!
//! Create a `config.toml` file:
//!
//! ```toml
//! [agent]
//! nodes = ["https://agent-1.example.com", "https://agent-2.example.com"]
//! policy = "round_robin"
//!
//! [pod]
//! nodes = ["https://pod.example.com"]
//!
//! [datafeed]
//! version = "v2"
//! poll_timeout_seconds = 30
//!
//! [retry]
//! max_attempts = 5
//! initial_interval_ms = 500
//!
//! [auth]
//! session_token = "your_session_token"
//! ```

pub mod ack_policy;
pub mod activity;
pub mod api_client;
pub mod auth;
pub mod config;
pub mod datafeed_loop;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod load_balancer;
pub mod loop_state;
pub mod node;
pub mod retry;
pub mod rotation;
pub mod runtime;
pub mod slash_command;

// Re-export commonly used types at the crate root
pub use ack_policy::{DatafeedVersion, FeedAckPolicy, FeedCursor};
pub use activity::{Activity, ActivityDescriptor, ActivityInfo, ActivityKind, DispatchContext};
pub use api_client::{BotInfo, DatafeedApi, HttpApiClient, SessionApi};
pub use auth::{AuthSession, Authenticator, SessionToken, StaticAuthenticator};
pub use config::Config;
pub use datafeed_loop::{DatafeedLoop, DatafeedSettings, FeedListener};
pub use dispatcher::ActivityDispatcher;
pub use error::{ErrorKind, EventError, FeedError, RegistryError};
pub use event::{EventKind, EventPayload, FeedEvent};
pub use load_balancer::{Affinity, LoadBalancedClient};
pub use loop_state::{LoopState, LoopStateManager};
pub use node::{Node, NodePool};
pub use retry::{RetryConfig, RetryExecutor, RetryRule};
pub use rotation::{LoadBalancingMode, RotationStrategy};
pub use runtime::FeedRuntime;
pub use slash_command::SlashCommand;
