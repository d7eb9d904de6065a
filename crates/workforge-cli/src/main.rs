mod app_config;
mod config_watcher;
mod git_store;
mod log_layer;
mod scorer;
mod structure;

use anyhow::Context as _;
use app_config::AppConfig;
use clap::{Parser, Subcommand};
use git_store::GitArtifactStore;
use log_layer::HubLogLayer;
use scorer::CommandScorer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use structure::load_structure;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workforge_core::Role;
use workforge_gateway::{AuthConfig, GatewayServer, WebhookEscalation};
use workforge_orchestrator::{
    structure_files, CompositeEscalation, EscalationSink, LogEscalation, Metric, Orchestrator,
    SubtaskId,
};

#[derive(Parser)]
#[command(name = "workforge", about = "Workforge: role-based AI worker pool for code generation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "workforge.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a project and print the run report
    Run {
        /// Project structure (.json or .toml)
        #[arg(short, long)]
        structure: PathBuf,
        /// What the project should do
        #[arg(short, long)]
        goal: String,
        /// Do not reload the config file on change
        #[arg(long)]
        no_watch: bool,
    },
    /// Start the monitoring gateway, optionally working on a project
    Serve {
        #[arg(short, long, requires = "goal")]
        structure: Option<PathBuf>,
        #[arg(short, long, requires = "structure")]
        goal: Option<String>,
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        no_watch: bool,
    },
    /// Check the config file and exit
    Validate,
    /// Print the executor subtasks a structure decomposes into
    Decompose {
        #[arg(short, long)]
        structure: PathBuf,
    },
}

fn init_tracing(json: bool, hub_layer: HubLogLayer) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(hub_layer);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // API keys referenced by `api_key_env` may live in .env.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let hub_layer = HubLogLayer::new();
    init_tracing(cli.json_logs, hub_layer.clone());

    match cli.command {
        Commands::Validate => {
            let config = AppConfig::load(&cli.config)?;
            for role in Role::ALL {
                let rc = config.orchestrator.roles.get(role);
                let chain: Vec<&str> = rc.providers.iter().map(|p| p.name.as_str()).collect();
                println!(
                    "{role}: providers [{}], metrics {:?}",
                    chain.join(", "),
                    rc.metrics_for(role)
                );
            }
            for metric in config.unscored_metrics() {
                println!("warning: no scorer for {metric}, it will always score 0");
            }
            println!("{} is valid", cli.config.display());
        }
        Commands::Decompose { structure } => {
            let value = load_structure(&structure)?;
            for path in structure_files(&value)? {
                println!("{}\t{path}", SubtaskId::for_file(Role::Executor, &path));
            }
        }
        Commands::Run {
            structure,
            goal,
            no_watch,
        } => {
            let config = AppConfig::load(&cli.config)?;
            let structure = load_structure(&structure)?;
            let orchestrator = build_orchestrator(&config, &hub_layer).await?;
            let _watcher = start_watcher(&cli.config, &config, &orchestrator, no_watch)?;

            let report = tokio::select! {
                report = orchestrator.run(&goal, &structure) => report?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping workers");
                    orchestrator.pool().stop_all().await;
                    anyhow::bail!("run interrupted");
                }
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.progress.failed > 0 {
                anyhow::bail!("{} subtasks failed: {}", report.progress.failed, report.summary);
            }
        }
        Commands::Serve {
            structure,
            goal,
            host,
            port,
            no_watch,
        } => {
            let config = AppConfig::load(&cli.config)?;
            let orchestrator = build_orchestrator(&config, &hub_layer).await?;
            let _watcher = start_watcher(&cli.config, &config, &orchestrator, no_watch)?;

            let auth = AuthConfig::new(config.server.api_keys.clone());
            if auth.is_enabled() {
                info!(keys = config.server.api_keys.len(), "API key auth enabled");
            }
            let app = GatewayServer::build_with_auth(Arc::clone(&orchestrator), auth);

            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            info!("Workforge gateway listening on {addr}");

            match (structure, goal) {
                (Some(structure), Some(goal)) => {
                    let structure = load_structure(&structure)?;
                    let ids = orchestrator.submit(&goal, &structure).await?;
                    info!(subtasks = ids.len(), "Project submitted");
                }
                _ => orchestrator.pool().start_all().await,
            }

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutting down");
                })
                .await?;
            orchestrator.pool().stop_all().await;
        }
    }

    Ok(())
}

/// Wire the config file's scorers, store and escalation sinks into a running
/// orchestrator.
async fn build_orchestrator(
    config: &AppConfig,
    hub_layer: &HubLogLayer,
) -> anyhow::Result<Arc<Orchestrator>> {
    let mut builder = Orchestrator::builder(config.orchestrator.clone());

    for (name, spec) in &config.scorers {
        let metric: Metric = name.parse()?;
        builder = builder.with_scorer(metric, Arc::new(CommandScorer::new(metric, spec.clone())));
    }

    match &config.persistence.repo_path {
        Some(path) => {
            let store = GitArtifactStore::open_or_init(path, config.persistence.author.clone())?;
            info!(repo = %store.root().display(), "Committing artifacts to git");
            builder = builder.with_store(Arc::new(store));
        }
        None => warn!("persistence.repo_path not set, artifacts are kept in memory only"),
    }

    let mut sinks: Vec<Arc<dyn EscalationSink>> = vec![Arc::new(LogEscalation)];
    if let Some(webhook) = &config.escalation.webhook {
        info!(url = %webhook.url, "Escalations go to webhook");
        sinks.push(Arc::new(WebhookEscalation::new(webhook.clone())?));
    }
    builder = builder.with_escalation(Arc::new(CompositeEscalation::new(sinks)));

    let orchestrator = Arc::new(builder.build().await?);
    hub_layer.attach(Arc::clone(orchestrator.hub()));
    Ok(orchestrator)
}

fn start_watcher(
    path: &Path,
    config: &AppConfig,
    orchestrator: &Arc<Orchestrator>,
    disabled: bool,
) -> anyhow::Result<Option<config_watcher::ConfigWatcher>> {
    if disabled {
        return Ok(None);
    }
    let watcher = config_watcher::watch_and_apply(
        path,
        config.server.reload_debounce_ms,
        Arc::clone(orchestrator),
    )?;
    Ok(Some(watcher))
}
