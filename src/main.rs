mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collector_lease::config::Config;
use collector_lease::error::LeaseErrorTrait;
use collector_lease::models::{Platform, PolicyUpdate, UnitStatus};

use commands::admin::RegisterParams;
use commands::CollectParams;

#[derive(Parser)]
#[command(
    name = "collector-lease",
    version,
    about = "Lease/claim coordination for chat-platform collector fleets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// TOML configuration file (environment variables are used otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the lease table
    InitSchema,

    /// Claim and hold work units until interrupted
    Collect {
        /// Platform to collect (repeatable; all platforms when omitted)
        #[arg(short, long)]
        platform: Vec<Platform>,

        /// Instance identifier to claim under
        #[arg(long)]
        instance_id: Option<String>,

        /// Also serve the read API
        #[arg(long, default_value = "false")]
        with_api: bool,
    },

    /// Serve the read API
    Serve {
        /// Address to bind to (overrides configuration)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Register an entity for monitoring
    Register {
        #[arg(short, long)]
        platform: Platform,

        /// Stable entity identifier
        #[arg(short, long)]
        entity: String,

        /// Platform channel identifier
        #[arg(long)]
        channel: String,

        /// Parent server/workspace (Discord, Slack)
        #[arg(long)]
        server: Option<String>,

        /// Lower values are claimed first
        #[arg(long, default_value = "100")]
        priority: i32,

        /// Number of shards (concurrent collectors)
        #[arg(long, default_value = "1")]
        max_containers: i32,

        /// Heartbeat interval in seconds (platform default when omitted)
        #[arg(long)]
        heartbeat_interval: Option<i32>,
    },

    /// Stop monitoring an entity
    Deregister {
        #[arg(short, long)]
        entity: String,
    },

    /// Change an entity's policy columns
    UpdatePolicy {
        #[arg(short, long)]
        entity: String,

        #[arg(long)]
        priority: Option<i32>,

        #[arg(long)]
        max_containers: Option<i32>,

        #[arg(long)]
        heartbeat_interval: Option<i32>,
    },

    /// List work units
    List {
        #[arg(short, long)]
        platform: Option<Platform>,

        /// Effective status (available, claimed, offline, error)
        #[arg(short, long)]
        status: Option<UnitStatus>,
    },

    /// Show one entity's status
    Status {
        #[arg(short, long)]
        entity: String,
    },

    /// Return an entity parked in error/offline to available
    Reset {
        #[arg(short, long)]
        entity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::InitSchema => {
            tracing::info!("Starting init-schema command");
            admin_result(commands::init_schema(&config).await)?;
        }

        Commands::Collect {
            platform,
            instance_id,
            with_api,
        } => {
            tracing::info!(
                platforms = ?platform,
                with_api = %with_api,
                "Starting collect command"
            );
            commands::collect(
                config,
                CollectParams {
                    platforms: platform,
                    instance_id,
                    with_api,
                },
            )
            .await?;
        }

        Commands::Serve { bind } => {
            tracing::info!(bind = ?bind, "Starting serve command");
            commands::serve(config, bind).await?;
        }

        Commands::Register {
            platform,
            entity,
            channel,
            server,
            priority,
            max_containers,
            heartbeat_interval,
        } => {
            tracing::info!(
                platform = %platform,
                entity = %entity,
                max_containers = %max_containers,
                "Starting register command"
            );
            let params = RegisterParams {
                platform,
                entity_id: entity,
                channel_id: channel,
                server_id: server,
                priority,
                max_containers,
                heartbeat_interval,
            };
            admin_result(commands::register(&config, params).await)?;
        }

        Commands::Deregister { entity } => {
            admin_result(commands::deregister(&config, &entity).await)?;
        }

        Commands::UpdatePolicy {
            entity,
            priority,
            max_containers,
            heartbeat_interval,
        } => {
            let update = PolicyUpdate {
                priority,
                max_containers,
                heartbeat_interval_seconds: heartbeat_interval,
            };
            admin_result(commands::update_policy(&config, &entity, update).await)?;
        }

        Commands::List { platform, status } => {
            admin_result(commands::list(&config, platform, status).await)?;
        }

        Commands::Status { entity } => {
            admin_result(commands::status(&config, &entity).await)?;
        }

        Commands::Reset { entity } => {
            admin_result(commands::reset(&config, &entity).await)?;
        }
    }

    Ok(())
}

/// Log a hint for failures that may go away on retry
fn admin_result(result: collector_lease::Result<()>) -> Result<()> {
    result.map_err(|e| {
        if e.is_recoverable() {
            tracing::warn!(
                category = e.category().description(),
                "Store unreachable, the command can be retried"
            );
        }
        anyhow::Error::new(e)
    })
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("collector_lease=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("collector_lease={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
