use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use datafeed_rs::{
    Config, EventKind, FeedRuntime, SessionToken, SlashCommand, StaticAuthenticator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Parser)]
#[command(name = "datafeed")]
#[command(about = "Long-poll datafeed bot runner", long_about = None)]
struct Cli {
    /// Path to the config file (falls back to $DATAFEED_CONFIG, then config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file and print the resolved settings
    Check,
    /// Authenticate, start the datafeed and answer /ping until Ctrl-C
    Run {
        /// Only answer "@<bot> /ping"
        #[arg(long)]
        mention: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("DATAFEED_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::from_file(&config_path)?;

    match cli.command {
        Commands::Check => check(&config),
        Commands::Run { mention } => run(config, mention).await,
    }
}

fn check(config: &Config) -> Result<()> {
    println!("agent nodes: {:?} ({:?})", config.agent.nodes, config.agent.policy);
    println!("pod nodes:   {:?} ({:?})", config.pod.nodes, config.pod.policy);
    println!(
        "datafeed:    {} (poll timeout {:?})",
        config.datafeed.version(),
        config.datafeed.poll_timeout()
    );
    let retry = config.retry.to_retry_config();
    println!(
        "retry:       {} attempts, backoff {:?}",
        retry.max_attempts,
        retry.intervals()
    );
    println!("auth:        {}", if config.auth.is_some() { "configured" } else { "missing" });
    Ok(())
}

async fn run(config: Config, mention: bool) -> Result<()> {
    let token = match std::env::var("DATAFEED_SESSION_TOKEN") {
        Ok(token) => SessionToken::new(token),
        Err(_) => match &config.auth {
            Some(auth) => {
                let mut token = SessionToken::new(auth.session_token.clone());
                token.key_manager_token = auth.key_manager_token.clone();
                token
            }
            None => bail!("no session token: set DATAFEED_SESSION_TOKEN or add an [auth] section"),
        },
    };

    let authenticator = Arc::new(StaticAuthenticator::new(token));
    let mut runtime = FeedRuntime::new(config, authenticator)
        .await
        .context("failed to initialise the runtime")?;

    runtime.activities().register(SlashCommand::new("/ping", mention, |ctx| {
        info!(
            "/ping from user {} in stream {}",
            ctx.initiator_id(),
            ctx.stream_id().unwrap_or("?")
        );
        Ok(())
    })?)?;
    runtime.activities().register_fn(
        "log-membership",
        |ctx| matches!(ctx.kind(), EventKind::UserJoinedRoom | EventKind::UserLeftRoom),
        |ctx| {
            info!("{} in stream {}", ctx.kind(), ctx.stream_id().unwrap_or("?"));
            Ok(())
        },
    )?;

    runtime.datafeed().on_termination(|err| match err {
        Some(err) => warn!("Datafeed terminated: {}", err),
        None => info!("Datafeed stopped"),
    });

    runtime.start().await?;
    info!(
        "Listening as {}, press Ctrl-C to stop",
        runtime.bot_info().display_name
    );

    let state = runtime.datafeed().state_manager();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
        _ = wait_for_termination(state) => {}
    }

    runtime.stop().await?;
    Ok(())
}

async fn wait_for_termination(state: datafeed_rs::LoopStateManager) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;
        if state.get_state().await.is_terminal() {
            return;
        }
    }
}
