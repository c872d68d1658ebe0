//! thecloudd: the TheCloud daemon.
//!
//! One binary assembles the state store, the simulated backends, the stack
//! worker and the autoscaling reconciler. `standalone` keeps everything
//! running until Ctrl-C; the other subcommands are one-shot operator
//! commands against the same data directory.
//!
//! # Usage
//!
//! ```text
//! thecloudd standalone --data-dir /var/lib/thecloud
//! thecloudd apply --owner <uuid> --name web --template stack.yaml
//! thecloudd stacks --owner <uuid>
//! thecloudd destroy --owner <uuid> --stack <uuid>
//! thecloudd validate stack.yaml
//! thecloudd group put web-group.toml
//! thecloudd group list --owner <uuid>
//! thecloudd reconcile
//! ```

mod commands;
mod groups;
mod platform;
mod standalone;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use thecloud_core::CloudConfig;
use thecloud_core::config::LogConfig;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "thecloudd", about = "TheCloud daemon")]
struct Cli {
    /// Path to thecloud.toml. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state (overrides `state.data_dir`).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON (overrides `log.json`).
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the stack worker and reconciler until interrupted.
    Standalone {
        /// Reconciler tick interval, e.g. "10s" (overrides `reconciler.interval`).
        #[arg(long)]
        reconcile_interval: Option<String>,

        /// Maximum concurrent stack jobs (overrides `provisioner.max_concurrent_jobs`).
        #[arg(long)]
        max_jobs: Option<usize>,
    },
    /// Create a stack from a template file and wait for it to settle.
    Apply {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        template: PathBuf,
        /// Stack parameters as KEY=VALUE.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
        timeout_secs: u64,
    },
    /// List a tenant's stacks, newest first.
    Stacks {
        #[arg(long)]
        owner: Uuid,
        /// Show one stack with its resources instead.
        #[arg(long)]
        stack: Option<Uuid>,
    },
    /// Tear a stack down and wait for it to disappear.
    Destroy {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        stack: Uuid,
        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
        timeout_secs: u64,
    },
    /// Check a template without creating anything.
    Validate { template: PathBuf },
    /// Manage scaling groups and their policies.
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },
    /// Run a single reconciler tick and print what happened.
    Reconcile,
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Create or update a group and its policies from a TOML file.
    Put { file: PathBuf },
    /// List groups with their members and policies.
    List {
        #[arg(long)]
        owner: Option<Uuid>,
    },
    /// Delete a group, its policies and memberships.
    Delete {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        id: Uuid,
    },
}

const DEFAULT_WAIT_SECS: u64 = 120;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    init_tracing(&config.log);

    match cli.command {
        Command::Standalone {
            reconcile_interval,
            max_jobs,
        } => {
            if let Some(interval) = reconcile_interval {
                config.reconciler.interval = interval;
            }
            if let Some(max_jobs) = max_jobs {
                config.provisioner.max_concurrent_jobs = max_jobs;
            }
            config.validate()?;
            standalone::run(config).await
        }
        Command::Apply {
            owner,
            name,
            template,
            params,
            timeout_secs,
        } => {
            let timeout = Duration::from_secs(timeout_secs);
            commands::apply(&config, owner, &name, &template, &params, timeout).await
        }
        Command::Stacks { owner, stack } => commands::stacks(&config, owner, stack),
        Command::Destroy {
            owner,
            stack,
            timeout_secs,
        } => commands::destroy(&config, owner, stack, Duration::from_secs(timeout_secs)).await,
        Command::Validate { template } => commands::validate(&template),
        Command::Group { action } => match action {
            GroupCommand::Put { file } => groups::put(&config, &file),
            GroupCommand::List { owner } => groups::list(&config, owner),
            GroupCommand::Delete { owner, id } => groups::delete(&config, owner, id),
        },
        Command::Reconcile => commands::reconcile(&config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CloudConfig> {
    let mut config = match &cli.config {
        Some(path) => CloudConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CloudConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.state.data_dir = dir.clone();
    }
    if cli.json_logs {
        config.log.json = true;
    }
    Ok(config)
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Logs go to stderr so command output on stdout stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
