//! # CMS Agent
//!
//! Keeps a local copy of a CMS Provider Data dataset fresh.
//!
//! `cms-agent serve` (the default) runs the background scheduler and the
//! HTTP surface until interrupted. The remaining subcommands perform a single
//! operation against the configured storage and exit:
//!
//! - `check`: probe the provider and report freshness
//! - `update [--force]`: run the pipeline once
//! - `status`: print the status projection from the persisted checkpoint
//! - `validate`: re-validate the published dataset file

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use cms_agent_config::{AgentConfig, ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use cms_agent_core::{Agent, OutcomeStatus, ShutdownReport, scheduler};
use cms_agent_server::{
    AppState, create_app,
    infra::{shutdown::drain_server, startup::build_agent},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "cms-agent")]
#[command(about = "Keeps a local CMS Provider Data dataset fresh and validated")]
struct Cli {
    /// Path to a TOML configuration file (falls back to CMS_AGENT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long, env = "CMS_AGENT_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "CMS_AGENT_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and HTTP server (default)
    Serve(ServeArgs),
    /// Probe the provider once and report whether the local copy is stale
    Check,
    /// Run the update pipeline once
    Update {
        /// Skip the freshness check and always fetch
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print the current status projection
    Status,
    /// Re-validate the published dataset file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    })?;

    match cli.command {
        None => run_server(config, cli.serve).await,
        Some(Command::Serve(args)) => run_server(config, args).await,
        Some(Command::Check) => run_check(&config).await,
        Some(Command::Update { force }) => run_update(&config, force).await,
        Some(Command::Status) => run_status(&config).await,
        Some(Command::Validate) => run_validate(&config).await,
    }
}

fn load_config(options: ConfigLoaderOptions) -> anyhow::Result<AgentConfig> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(options)
        .load()
        .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cms_agent=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "configuration file loaded");
    }
    info!(profile = %config.profile, dataset_id = %config.provider.dataset_id, "configuration ready");

    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    Ok(config)
}

async fn open_agent(config: &AgentConfig) -> anyhow::Result<Arc<Agent>> {
    build_agent(config)
        .await
        .context("failed to initialise agent")
}

async fn run_server(
    mut config: AgentConfig,
    args: ServeArgs,
) -> anyhow::Result<ExitCode> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let agent = open_agent(&config).await?;
    let handle = scheduler::spawn(Arc::clone(&agent));
    let router = create_app(AppState::new(Arc::clone(&agent), config.cors.clone()));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        address = %addr,
        poll_interval = %humantime::format_duration(config.schedule.poll_interval),
        auto_update = config.schedule.auto_update,
        "CMS agent listening"
    );

    let stop_serving = CancellationToken::new();
    let serve = axum::serve(listener, router).with_graceful_shutdown({
        let stop_serving = stop_serving.clone();
        async move { stop_serving.cancelled().await }
    });
    let mut server = tokio::spawn(serve.into_future());
    let grace = config.schedule.shutdown_grace;

    tokio::select! {
        joined = &mut server => {
            error!("http server stopped unexpectedly");
            handle.shutdown(grace).await;
            joined
                .context("http server task failed")?
                .context("http server failed")?;
            return Ok(ExitCode::FAILURE);
        }
        _ = shutdown_signal() => {}
    }

    info!("draining http server and stopping scheduler");
    stop_serving.cancel();
    let (http, scheduler) = tokio::join!(
        drain_server(&mut server, &agent, grace),
        handle.shutdown(grace),
    );
    if http == ShutdownReport::Clean && scheduler == ShutdownReport::Clean {
        info!("shutdown complete");
        Ok(ExitCode::SUCCESS)
    } else {
        error!(?http, ?scheduler, "shutdown aborted in-flight work");
        Ok(ExitCode::FAILURE)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn run_check(config: &AgentConfig) -> anyhow::Result<ExitCode> {
    let agent = open_agent(config).await?;
    let freshness = agent.check_for_updates().await;
    print_json(&freshness)?;
    Ok(ExitCode::SUCCESS)
}

async fn run_update(
    config: &AgentConfig,
    force: bool,
) -> anyhow::Result<ExitCode> {
    let agent = open_agent(config).await?;
    let outcome = agent.run(force).await;
    for delivery in agent.flush_notifications().await {
        if let Err(err) = delivery.result {
            warn!(sink = %delivery.sink, error = %err, "notification not delivered");
        }
    }
    print_json(&outcome)?;
    Ok(match outcome.status {
        OutcomeStatus::Failed | OutcomeStatus::Invalid => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

async fn run_status(config: &AgentConfig) -> anyhow::Result<ExitCode> {
    let agent = open_agent(config).await?;
    print_json(&serde_json::json!({
        "dataset_id": agent.dataset_id(),
        "status": *agent.status(),
        "checkpoint": agent.checkpoint(),
    }))?;
    Ok(ExitCode::SUCCESS)
}

async fn run_validate(config: &AgentConfig) -> anyhow::Result<ExitCode> {
    let agent = open_agent(config).await?;
    let validation = agent
        .validate_published()
        .await
        .context("failed to read published dataset")?;
    print_json(&validation)?;
    Ok(if validation.report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
