use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use futures::StreamExt;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use launchpad::api::{self, AppState};
use launchpad::config::Config;
use launchpad::files::projection::normalize_path;
use launchpad::files::ProjectFile;
use launchpad::generation::{GenerationChain, Progress};
use launchpad::manager::EnvironmentManager;
use launchpad::sandbox;
use launchpad::status::StatusChannel;

#[derive(Parser)]
#[command(name = "launchpad", about = "Prompt-to-preview generation service")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Generate a project from a prompt and write it to a directory
    Generate {
        #[arg(long)]
        prompt: String,
        /// Output directory (created if missing)
        #[arg(long)]
        out: PathBuf,
    },
    /// Generate a project, provision a preview and keep it up until Ctrl-C
    Preview {
        #[arg(long)]
        prompt: String,
        /// Project id to provision under; random when omitted
        #[arg(long)]
        project: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to Serve when no subcommand is given, but still allow
    // --help and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = Config::from_env()?;
    init_tracing();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Serve => run_server(config).await,
        Cli::Generate { prompt, out } => run_generate(config, &prompt, &out).await,
        Cli::Preview { prompt, project } => run_preview(config, &prompt, project).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("launchpad=info,tower_http=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
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
}

async fn build_manager(config: &Config) -> Result<Arc<EnvironmentManager>> {
    let backend = sandbox::build_backend(config.backend.clone(), config.timeouts.clone())
        .context("failed to initialize execution backend")?;
    if let Err(e) = backend.health().await {
        tracing::warn!(error = %e, backend = %backend.info().kind, "backend health check failed");
    }
    Ok(Arc::new(EnvironmentManager::new(
        backend,
        StatusChannel::new(),
        config.manager.clone(),
    )))
}

async fn run_server(config: Config) -> Result<()> {
    let manager = build_manager(&config).await?;
    let sweeper = manager.spawn_sweeper();
    let chain = Arc::new(GenerationChain::standard(config.provider_caller()));
    tracing::info!(strategies = ?chain.strategy_names(), "generation chain ready");

    let app = api::build_router(AppState::new(manager.clone(), chain))
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let destroyed = manager.shutdown().await;
    tracing::info!(destroyed, "shutdown complete");
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    Ok(())
}

async fn run_generate(config: Config, prompt: &str, out: &Path) -> Result<()> {
    let chain = GenerationChain::standard(config.provider_caller());
    let result = chain.generate(prompt, &Progress::silent()).await?;
    write_files(out, &result.files).await?;
    for failure in &result.failures {
        tracing::warn!(strategy = %failure.strategy, reason = %failure.reason, "strategy skipped");
    }
    println!(
        "Generated {} files with the {} strategy in {}",
        result.files.len(),
        result.strategy,
        out.display()
    );
    Ok(())
}

async fn run_preview(config: Config, prompt: &str, project: Option<String>) -> Result<()> {
    let project_id = project.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let manager = build_manager(&config).await?;
    let status = manager.status().clone();

    let mut events = Box::pin(status.subscribe(&project_id));
    let logger = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match &event.error {
                Some(error) => tracing::warn!(phase = %event.phase, error = %error, "{}", event.message),
                None => tracing::info!(phase = %event.phase, "{}", event.message),
            }
        }
    });

    let chain = GenerationChain::standard(config.provider_caller());
    let result = chain
        .generate(prompt, &Progress::new(status, &project_id))
        .await?;

    match manager.provision_preview(&project_id, &result.files).await {
        Ok(url) => {
            println!("Preview for {project_id}: {url}");
            println!("Press Ctrl-C to tear it down.");
            shutdown_signal().await;
        }
        Err(e) => {
            manager.shutdown().await;
            logger.abort();
            anyhow::bail!(e.user_message());
        }
    }

    manager.shutdown().await;
    logger.abort();
    Ok(())
}

async fn write_files(root: &Path, files: &[ProjectFile]) -> Result<()> {
    for file in files {
        let Some(rel) = normalize_path(&file.path) else {
            continue;
        };
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &file.content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
    }
    tracing::info!("shutdown signal received");
}
