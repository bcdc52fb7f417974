use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sigbridge::backend::{ChannelBackend, InlineBackend, PoolBackend, TaskQueueBackend, WorkerBackend};
use sigbridge::config::{BackendMode, Config};
use sigbridge::context::{ContextPipeline, WindowContext};
use sigbridge::dispatch::{DispatchEngine, EngineCore};
use sigbridge::error::SignalResult;
use sigbridge::gateway::Gateway;
use sigbridge::pubsub::{LocalPubSub, PubSubLayer, RedisPubSub};
use sigbridge::registry::{
    AccessPolicy, Coercer, JsonMap, Param, SignalConnection, SignalRegistry,
};
use sigbridge::store::{MemoryTopicCache, RedisTopicCache, SubscriptionStore, TopicCache};
use sigbridge::worker::QueueWorker;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Signal dispatch and websocket notification engine")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "SIGBRIDGE_CONFIG",
        default_value = "sigbridge.toml"
    )]
    config: PathBuf,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "SIGBRIDGE_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the websocket gateway with the configured dispatch backend.
    Run,
    /// Consume one or more redis-backed queues in this process.
    Worker(WorkerArgs),
    /// Print every queue the registered signals may address.
    Queues(QueuesArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct WorkerArgs {
    /// Queue to consume; repeatable. Defaults to the configured default queue.
    #[arg(long)]
    queue: Vec<String>,
}

#[derive(Debug, Clone, Args, Default)]
struct QueuesArgs {
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config = Config::load(&cli.config)?;
    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::Run => run_gateway(config).await,
        CliCommand::Worker(args) => run_worker(config, args).await,
        CliCommand::Queues(args) => run_queues(config, args).await,
    }
}

/// Signals every deployment carries. Applications embedding this crate add
/// their own connections in the same registration pass.
fn builtin_signals(registry: &SignalRegistry) -> SignalResult<()> {
    registry.register_signal(
        SignalConnection::new(
            "sigbridge.echo",
            &[
                Param::Context,
                Param::required_as("message", Coercer::Str),
            ],
            |ctx: &WindowContext, kwargs: &JsonMap| {
                let message = kwargs.get("message").and_then(Value::as_str).unwrap_or_default();
                info!("echo from window {:?}: {message}", ctx.window_key);
                Ok(())
            },
        )?
        .with_policy(AccessPolicy::Everyone),
    )
}

async fn run_gateway(config: Config) -> Result<()> {
    let (pubsub, cache): (Arc<dyn PubSubLayer>, Arc<dyn TopicCache>) = match config.dispatch.backend
    {
        // single-process modes keep everything in memory
        BackendMode::Inline | BackendMode::Pool => (
            Arc::new(LocalPubSub::new()),
            Arc::new(MemoryTopicCache::new()),
        ),
        BackendMode::Channel | BackendMode::TaskQueue => (
            Arc::new(RedisPubSub::connect(&config.redis.url, &config.dispatch.key_prefix).await?),
            Arc::new(RedisTopicCache::connect(&config.redis.url).await?),
        ),
    };
    let core = Arc::new(EngineCore::new(
        Arc::new(SignalRegistry::new()),
        Arc::new(ContextPipeline::default()),
        pubsub.clone(),
        config.dispatch.clone(),
        Box::new(builtin_signals),
    ));
    core.ensure_populated().await?;
    info!("registry populated with {} signals", core.registry().signal_count());
    let backend: Arc<dyn WorkerBackend> = match config.dispatch.backend {
        BackendMode::Inline => Arc::new(InlineBackend::new(core.clone())),
        BackendMode::Pool => Arc::new(PoolBackend::new(core.clone(), config.dispatch.clone())),
        BackendMode::Channel => {
            Arc::new(ChannelBackend::connect(&config.redis.url, config.dispatch.clone()).await?)
        }
        BackendMode::TaskQueue => {
            Arc::new(TaskQueueBackend::connect(&config.redis.url, config.dispatch.clone()).await?)
        }
    };
    let engine = Arc::new(DispatchEngine::new(core, backend));
    let store = Arc::new(SubscriptionStore::new(cache, config.dispatch.clone()));
    let gateway = Gateway::new(config.gateway.clone(), engine, store, pubsub);
    gateway.run_until(shutdown_signal()).await
}

async fn run_worker(config: Config, args: WorkerArgs) -> Result<()> {
    if !matches!(
        config.dispatch.backend,
        BackendMode::Channel | BackendMode::TaskQueue
    ) {
        bail!("the worker command requires a redis-backed dispatch backend (channel or task_queue)");
    }
    let pubsub =
        Arc::new(RedisPubSub::connect(&config.redis.url, &config.dispatch.key_prefix).await?);
    let core = Arc::new(EngineCore::new(
        Arc::new(SignalRegistry::new()),
        Arc::new(ContextPipeline::default()),
        pubsub,
        config.dispatch.clone(),
        Box::new(builtin_signals),
    ));
    core.ensure_populated().await?;
    info!("registry populated with {} signals", core.registry().signal_count());

    let queues = if args.queue.is_empty() {
        vec![config.dispatch.default_queue.clone()]
    } else {
        args.queue
    };
    let mut workers = tokio::task::JoinSet::new();
    for queue in queues {
        let worker = QueueWorker::connect(
            &config.redis.url,
            config.dispatch.clone(),
            core.clone(),
            &queue,
        )
        .await?;
        workers.spawn(worker.run());
    }
    tokio::select! {
        joined = workers.join_next() => {
            match joined {
                Some(result) => result?,
                None => Ok(()),
            }
        }
        _ = shutdown_signal() => Ok(()),
    }
}

async fn run_queues(config: Config, args: QueuesArgs) -> Result<()> {
    let registry = SignalRegistry::new();
    registry.ensure_populated(builtin_signals).await?;
    let queues = registry.expected_queues(&config.dispatch.default_queue);
    if args.json {
        let payload = json!({
            "count": queues.len(),
            "queues": queues.iter().collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
        );
    } else {
        println!("expected queues: {}", queues.len());
        for queue in queues {
            println!("{queue}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

fn init_logging(filter: &str) {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
}
