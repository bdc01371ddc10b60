use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use taskq_core::domain::{Priority, ProvisionerId, Resolution, TaskId, TaskRef, WorkerType};
use taskq_core::impls::InMemoryQueueClient;
use taskq_core::ports::{Clock, FixedClock};
use taskq_core::{AppBuilder, Config, QueueBackend, QueueService};

#[derive(Parser)]
#[command(name = "taskq", about = "Task queue layer: pending shards, expiration queues and GC")]
struct Cli {
    /// RUST_LOG がないときのログレベル
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// in-memory backend で一連の流れを動かす
    Demo,
    /// GC を 1 回だけ実行する
    Sweep,
    /// バックグラウンドループを起動して Ctrl-C を待つ
    Serve,
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

fn build_service(config: &Config) -> Result<QueueService> {
    let settings = config.queue_settings().context("invalid configuration")?;
    AppBuilder::new(settings)
        .build()
        .context("failed to build queue service")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = Config::init_from_env().context("failed to read configuration from environment")?;

    match cli.command {
        Command::Demo => demo(&config).await,
        Command::Sweep => sweep(&config).await,
        Command::Serve => serve(&config).await,
    }
}

async fn sweep(config: &Config) -> Result<()> {
    let service = build_service(config)?;
    let deleted = service
        .pending()
        .delete_unused_worker_queues(Utc::now())
        .await
        .context("gc sweep failed")?;
    println!("{}", serde_json::json!({ "deleted": deleted }));
    service.shutdown().await;
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let mut service = build_service(config)?;
    info!(
        backend = ?service.settings().backend,
        prefix = %service.settings().prefix,
        "queue service starting"
    );
    service.spawn_background();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    service.shutdown().await;
    Ok(())
}

async fn demo(config: &Config) -> Result<()> {
    let mut settings = config.queue_settings().context("invalid configuration")?;
    settings.backend = QueueBackend::Memory;

    // 時間を進められるように FixedClock を使う
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let client = InMemoryQueueClient::new(clock.clone());
    let service = AppBuilder::new(settings)
        .with_client(Arc::new(client.clone()))
        .with_clock(clock.clone())
        .build()
        .context("failed to build queue service")?;
    let pending = service.pending();
    let expiration = service.expiration();

    let provisioner = ProvisionerId::new("demo-provisioner")?;
    let worker_type = WorkerType::new("demo-worker")?;

    // (A) 優先度の違うタスクを投入
    for (task_id, priority) in [
        ("task-low", Priority::Low),
        ("task-highest", Priority::Highest),
        ("task-medium", Priority::Medium),
        ("task-medium-2", Priority::Medium),
    ] {
        let task = TaskRef::new(
            TaskId::new(task_id),
            provisioner.clone(),
            worker_type.clone(),
            clock.now() + Duration::hours(1),
            priority,
        );
        pending.put_pending_message(&task, 0).await?;
        println!("enqueued {task_id} ({priority})");
    }
    println!(
        "pending count: {}",
        pending.count_pending_messages(&provisioner, &worker_type).await?
    );

    // (B) 優先度の高い順に poll。最初の 1 件は claim 失敗として release する
    let pollers = pending.pending_queues(&provisioner, &worker_type).await?;
    let mut released = false;
    for poller in &pollers {
        for hint in poller.poll(32).await? {
            println!(
                "polled {} run={} priority={} from {}",
                hint.task_id,
                hint.run_id,
                hint.priority,
                poller.queue_name()
            );
            if released {
                hint.remove().await?;
            } else {
                released = true;
                hint.release().await?;
                println!("  released (claim failed)");
            }
        }
    }
    for poller in &pollers {
        for hint in poller.poll(32).await? {
            println!("redelivered {} from {}", hint.task_id, poller.queue_name());
            hint.remove().await?;
        }
    }

    // (C) claim 期限: taken_until を過ぎるまで見えない
    let taken_until = clock.now() + Duration::minutes(20);
    expiration
        .put_claim_message(&TaskId::new("task-highest"), 0, taken_until)
        .await?;
    println!(
        "claim messages before expiry: {}",
        expiration.poll_claim_queue().await?.len()
    );
    clock.advance(Duration::minutes(21));
    for message in expiration.poll_claim_queue().await? {
        println!("claim expired: {}", serde_json::to_string(&message.payload)?);
        message.remove().await?;
    }

    // (D) resolved はすぐに届く
    expiration
        .put_resolved_message(
            &TaskId::new("task-low"),
            "demo-group",
            "demo-scheduler",
            Resolution::Completed,
        )
        .await?;
    for message in expiration.poll_resolved_queue().await? {
        println!("resolved: {}", serde_json::to_string(&message.payload)?);
        message.remove().await?;
    }

    // (E) 11 日後: 空になった pending キューは GC される
    clock.advance(Duration::days(11));
    let deleted = pending.delete_unused_worker_queues(clock.now()).await?;
    println!("gc deleted {deleted} queues; remaining: {:?}", client.queue_names().await);

    service.shutdown().await;
    Ok(())
}
