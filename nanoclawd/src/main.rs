mod bus;
mod channels;
mod ipc_watcher;
mod message_loop;
mod process_group;
mod queue;
mod sandbox;
mod scheduler;
mod scheduler_wiring;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nanoclaw_core::ipc::IpcPaths;
use nanoclaw_core::store::Store;
use nanoclaw_core::{NanoclawConfig, load_config};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use bus::ChatBus;
use channels::{DiscordChannel, TelegramChannel, Transport, WhatsAppChannel};

/// Time the shutdown barrier waits for sandboxes to drain before killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "nanoclawd", version, about = "nanoclaw agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator daemon.
    Serve(ServeArgs),
    /// Print the effective configuration as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/nanoclaw.toml"),
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let store = Store::open(&config.storage.db_path)
        .with_context(|| format!("failed to open store at {}", config.storage.db_path))?;
    info!(db = config.storage.db_path.as_str(), "store opened");

    let paths = IpcPaths::new(&config.storage.data_dir);
    std::fs::create_dir_all(paths.errors_dir()).ok();

    // Registered groups: loaded once, kept in sync by the IPC watcher.
    let groups = store
        .get_registered_groups()
        .context("failed to load registered groups")?;
    for group in groups.values() {
        paths.ensure_folder(&group.folder).ok();
    }
    info!(count = groups.len(), "registered groups loaded");
    let groups = Arc::new(RwLock::new(groups));

    let queue = Arc::new(queue::GroupQueue::new(config.queue.clone(), paths.clone()));
    let bus = Arc::new(ChatBus::new());

    // Transports.
    let mut transports = Vec::new();
    if config.channels.telegram.enabled {
        transports.push(Transport::Telegram(TelegramChannel::new(
            config.channels.telegram.clone(),
        )));
    }
    if config.channels.discord.enabled {
        transports.push(Transport::Discord(DiscordChannel::new(
            config.channels.discord.clone(),
        )));
    }
    if config.channels.whatsapp.enabled {
        transports.push(Transport::WhatsApp(WhatsAppChannel::new(
            config.channels.whatsapp.clone(),
        )));
    }
    let transports = Arc::new(transports);
    for transport in transports.iter() {
        if !transport.is_configured() {
            warn!(
                channel = transport.kind(),
                "transport enabled but missing credentials"
            );
        }
    }
    channels::register_outbound_router(&bus, transports.clone()).await;

    register_persistence_handler(&bus, store.clone(), groups.clone()).await;

    // Sandbox runtime hygiene.
    if let Err(e) = sandbox::runner::ensure_runtime_available().await {
        warn!(err = %e, "container runtime unavailable; sandbox runs will fail");
    }
    sandbox::runner::cleanup_orphans().await;

    let allowlist_path = config
        .sandbox
        .mount_allowlist_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(sandbox::security::default_allowlist_path);
    let allowlist = sandbox::security::load_allowlist(&allowlist_path);

    let project_root =
        std::env::current_dir().context("failed to resolve current working directory")?;
    let run_config = sandbox::runner::RunConfig {
        project_root,
        groups_dir: PathBuf::from(&config.storage.groups_dir),
        ipc: paths.clone(),
        sandbox: config.sandbox.clone(),
        timezone: config.scheduler.timezone.clone(),
        allowlist,
    };

    // Queue → sandbox wiring.
    let process_ctx = process_group::ProcessContext {
        store: store.clone(),
        queue: queue.clone(),
        groups: groups.clone(),
        bus: bus.clone(),
        assistant_name: config.orchestrator.assistant_name.clone(),
        main_folder: config.orchestrator.main_folder.clone(),
        max_context_messages: config.orchestrator.max_context_messages,
        run_config: run_config.clone(),
    };
    queue
        .set_process_messages_fn(process_group::build_process_messages_fn(process_ctx))
        .await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // IPC watcher.
    let watcher = ipc_watcher::IpcWatcher::new(
        ipc_watcher::IpcWatcherConfig {
            poll_interval: Duration::from_millis(config.ipc.poll_interval_ms),
            main_folder: config.orchestrator.main_folder.clone(),
            timezone: config.scheduler.timezone.clone(),
        },
        paths.clone(),
        store.clone(),
        bus.clone(),
        groups.clone(),
    );
    let watcher_shutdown = shutdown_rx.clone();
    let watcher_handle = tokio::spawn(async move {
        watcher.run(watcher_shutdown).await;
    });

    // Message loop.
    let ml_config = message_loop::MessageLoopConfig {
        poll_interval_ms: config.orchestrator.poll_interval_ms,
        assistant_name: config.orchestrator.assistant_name.clone(),
        main_folder: config.orchestrator.main_folder.clone(),
        max_context_messages: config.orchestrator.max_context_messages,
    };
    let ml_store = store.clone();
    let ml_queue = queue.clone();
    let ml_groups = groups.clone();
    let ml_shutdown = shutdown_rx.clone();
    let message_loop_handle = tokio::spawn(async move {
        message_loop::run_message_loop(ml_config, ml_store, ml_queue, ml_groups, ml_shutdown)
            .await;
    });

    // Scheduler.
    let task_callback = scheduler_wiring::build_task_callback(scheduler_wiring::TaskContext {
        store: store.clone(),
        queue: queue.clone(),
        groups: groups.clone(),
        bus: bus.clone(),
        assistant_name: config.orchestrator.assistant_name.clone(),
        run_config,
        timezone: config.scheduler.timezone.clone(),
    });
    let sched_config = scheduler::SchedulerConfig {
        poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
        timezone: config.scheduler.timezone.clone(),
    };
    let sched_store = store.clone();
    let sched_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler::run_scheduler_loop(sched_config, sched_store, task_callback, sched_shutdown)
            .await;
    });

    // Channel ingress last, once every consumer is wired.
    for transport in transports.iter() {
        transport.start(bus.clone(), shutdown_rx.clone()).await;
        info!(channel = transport.kind(), "transport started");
    }

    info!("nanoclawd running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    // Ordered teardown: close ingress, stop the loops, drain the queue.
    for transport in transports.iter() {
        transport.stop();
    }
    let _ = shutdown_tx.send(true);
    queue.shutdown(SHUTDOWN_TIMEOUT).await;

    let _ = watcher_handle.await;
    let _ = message_loop_handle.await;
    let _ = scheduler_handle.await;

    info!("nanoclawd stopped");
    Ok(())
}

/// Persist every inbound event: chat metadata always, the message itself
/// only for registered groups. Storage failures here are fatal.
async fn register_persistence_handler(
    bus: &ChatBus,
    store: Store,
    groups: message_loop::Groups,
) {
    bus.on_inbound(Arc::new(move |event| {
        let store = store.clone();
        let groups = groups.clone();
        Box::pin(async move {
            let msg = &event.message;
            let registered = groups.read().await.contains_key(&msg.chat_id);

            let persisted = store
                .upsert_chat_metadata(&msg.chat_id, &event.chat_name, &msg.channel, &msg.timestamp)
                .and_then(|()| {
                    if registered {
                        store.store_message(msg)
                    } else {
                        Ok(())
                    }
                });

            if let Err(e) = persisted {
                error!(err = %e, "storage failure on inbound persist, aborting");
                std::process::exit(1);
            }
            Ok(())
        })
    }))
    .await;
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg: NanoclawConfig = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}
