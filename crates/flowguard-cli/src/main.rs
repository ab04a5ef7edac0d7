use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use flowguard_core::action::{Outcome, QueuedAction};
use flowguard_core::broadcast::BroadcastHub;
use flowguard_core::config::Config;
use flowguard_core::dispatch::{ActionDispatcher, ActionExecutor};
use flowguard_core::pipeline::Pipeline;
use flowguard_core::policy::{PolicyHandle, PolicySet};
use flowguard_core::queue::ActionQueue;

#[derive(Parser)]
#[command(
    name = "flowguard",
    about = "Policy-driven network automation pipeline",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and action dispatcher
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8000", env = "FLOWGUARD_PORT")]
        port: u16,

        /// Directory for the queue database
        #[arg(long, default_value = "./data", env = "FLOWGUARD_DATA_DIR")]
        data_dir: PathBuf,

        /// Config file (defaults apply when absent)
        #[arg(long, env = "FLOWGUARD_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Inspect and scaffold configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Print the effective configuration as YAML
    Show {
        /// Config file (defaults apply when absent)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write a config file populated with defaults
    Init {
        /// Destination path
        #[arg(default_value = "flowguard.yaml")]
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve {
            port,
            data_dir,
            config,
        } => run_serve(port, &data_dir, config.as_deref()),
        Commands::Config { subcommand } => run_config(subcommand),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let config = Config::load(path)?;
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

/// Stand-in for the real automation backend: logs the action and reports
/// success after a short delay.
struct SimulatedExecutor;

impl ActionExecutor for SimulatedExecutor {
    fn execute(&self, action: QueuedAction) -> impl Future<Output = Outcome> + Send {
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tracing::info!(
                device = %action.device,
                action_type = %action.action_type,
                "simulated execution"
            );
            Outcome::Success(serde_json::json!({
                "message": format!("{} applied to {}", action.action_type, action.device),
            }))
        }
    }
}

fn run_serve(port: u16, data_dir: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    std::fs::create_dir_all(data_dir)?;
    let queue = Arc::new(ActionQueue::open(
        &data_dir.join("queue.db"),
        config.queue.clone(),
    )?);
    let hub = Arc::new(BroadcastHub::new(config.hub.buffer_capacity));
    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        PolicyHandle::new(PolicySet::default()),
        hub.clone(),
    ));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let dispatcher = ActionDispatcher::spawn(
            queue,
            hub,
            Arc::new(SimulatedExecutor),
            config.dispatcher.clone(),
        );

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        tokio::select! {
            result = flowguard_server::serve_on(pipeline, listener) => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
            }
        }

        dispatcher.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    })
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn run_config(subcommand: ConfigSubcommand) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        ConfigSubcommand::Init { path } => {
            Config::default().save(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}
