use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use recsys_worker::{
    app::{ComponentRegistry, build_router},
    config::Config,
    observability,
    pipeline::{RunContext, StageName},
};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP control plane.
    Serve,
    /// Execute one full pipeline run.
    Run,
    /// Execute a single stage of an existing run.
    Stage {
        stage: StageArg,
        #[arg(long)]
        run_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    LoadData,
    Train,
    Generate,
}

impl From<StageArg> for StageName {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::LoadData => StageName::LoadData,
            StageArg::Train => StageName::Train,
            StageArg::Generate => StageName::Generate,
        }
    }
}

/// Routes panics through `tracing` so they land in the JSON log stream.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic payload");
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));

        error!(
            thread = thread.name().unwrap_or("unnamed"),
            location = location.as_deref().unwrap_or("unknown"),
            message,
            "panic occurred"
        );
    }));
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_panic_hook();

    let args = Args::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    let registry = ComponentRegistry::build(&config).context("failed to build component registry")?;

    let outcome = run(args.command, &config, registry).await;
    observability::tracing::shutdown();
    outcome
}

async fn run(command: Command, config: &Config, registry: ComponentRegistry) -> anyhow::Result<()> {
    match command {
        Command::Serve => {
            let bind_addr = config.http_bind();
            let router = build_router(registry);
            let listener = TcpListener::bind(bind_addr)
                .await
                .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

            info!(%bind_addr, "listening");

            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                warn!(error = %error, "server exited with error");
            }
        }
        Command::Run => {
            let orchestrator = registry.orchestrator();
            orchestrator.preflight().await?;
            let report = orchestrator.execute(&RunContext::new()).await?;
            info!(
                run_id = %report.run_id,
                users = report.summary.users_embedded,
                items = report.summary.items_embedded,
                "pipeline run finished"
            );
        }
        Command::Stage { stage, run_id } => {
            let stage = StageName::from(stage);
            let orchestrator = registry.orchestrator();
            orchestrator.preflight().await?;
            orchestrator
                .execute_stage(stage, &RunContext::with_id(run_id))
                .await?;
            info!(%run_id, %stage, "stage finished");
        }
    }

    Ok(())
}
