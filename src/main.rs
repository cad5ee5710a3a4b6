mod api;
mod config;
mod flows;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::flows::events::{EVENT_CHANNEL_CAPACITY, RunEvent};
use crate::flows::process::ProcessRunner;
use crate::flows::repository::FlowRepository;
use crate::flows::runner::FlowRunner;
use crate::flows::scheduler::FlowScheduler;
use crate::flows::sqlite_repository::SqliteFlowRepository;

const INTERRUPTED_MESSAGE: &str = "interrupted: server restarted before the run finished";

#[derive(Parser)]
#[command(name = "flowd", about = "Cron-driven runner for external flow executables")]
enum Cli {
    /// Start the HTTP server and scheduler (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Serve the API without starting the scheduler timer
        #[arg(long)]
        start_disabled: bool,
    },
    /// Run one scheduler pass, wait for the runs it started, then exit
    Tick,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow --help
    // and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve {
            start_disabled: false,
        }
    } else {
        Cli::parse()
    };

    let config = Config::from_env();
    let _guard = init_telemetry(&config);

    match cli {
        Cli::Serve { start_disabled } => run_server(config, start_disabled).await,
        Cli::Tick => run_tick(config).await,
    }
}

fn init_telemetry(config: &Config) -> sentry::ClientInitGuard {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowd=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ))
}

/// Store, runner and scheduler wired against one database.
struct Engine {
    store: Arc<dyn FlowRepository>,
    runner: FlowRunner,
    scheduler: Arc<FlowScheduler>,
    events_tx: broadcast::Sender<RunEvent>,
}

fn build_engine(config: &Config) -> Result<Engine> {
    let db_path = config.database_path();
    let store: Arc<dyn FlowRepository> = Arc::new(
        SqliteFlowRepository::open(&db_path)
            .with_context(|| format!("failed to open run store at {}", db_path.display()))?,
    );

    std::fs::create_dir_all(&config.scratch_dir).with_context(|| {
        format!(
            "failed to create scratch dir {}",
            config.scratch_dir.display()
        )
    })?;

    let (events_tx, _) = broadcast::channel::<RunEvent>(EVENT_CHANNEL_CAPACITY);
    let runner = FlowRunner::new(
        store.clone(),
        Arc::new(ProcessRunner::new(config.run_timeout)),
        config.scratch_dir.clone(),
    )
    .with_events(events_tx.clone());
    let scheduler = Arc::new(FlowScheduler::new(
        store.clone(),
        runner.clone(),
        config.scheduler_interval,
    ));

    Ok(Engine {
        store,
        runner,
        scheduler,
        events_tx,
    })
}

async fn run_server(config: Config, start_disabled: bool) -> Result<(), Box<dyn Error>> {
    let engine = build_engine(&config)?;

    // Any run still marked RUNNING lost its process with the previous server.
    engine
        .store
        .recover_interrupted(Utc::now(), INTERRUPTED_MESSAGE)
        .await
        .context("failed to recover interrupted runs")?;

    if start_disabled {
        tracing::info!("Starting with the scheduler disabled (--start-disabled)");
    } else {
        engine.scheduler.start().await;
    }

    let app_state = api::AppState {
        store: engine.store.clone(),
        runner: engine.runner.clone(),
        scheduler: engine.scheduler.clone(),
        events_tx: engine.events_tx.clone(),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = config.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.scheduler.stop().await;
    Ok(())
}

async fn run_tick(config: Config) -> Result<(), Box<dyn Error>> {
    let engine = build_engine(&config)?;

    let report = engine.scheduler.tick().await;
    engine.runner.wait_idle().await;

    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
