//! Bastion CLI - Operate the abuse-mitigation block registry
//!
//! Usage:
//!   bastion login <TOKEN>          Store admin credentials
//!   bastion blocks                 List blocks
//!   bastion block <IDENTITY>       Block an identity
//!   bastion unblock <IDENTITY>     Lift a block
//!   bastion stats                  Registry statistics
//!   bastion cleanup                Run expiry sweep and tracking GC now
//!   bastion tracking <IDENTITY>    Inspect fraud tracking for an identity

mod client;
mod commands;
mod config;

use anyhow::Result;
use bastion_common::{BlockKind, BlockReason, ListBlocksQuery};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bastion")]
#[command(author = "Bastion Team")]
#[command(version)]
#[command(about = "Operate the Bastion block registry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store admin credentials
    Login {
        /// Admin API token
        token: String,

        /// Server URL
        #[arg(long, env = "BASTION_SERVER")]
        server: Option<String>,

        /// Name recorded on blocks you create or lift
        #[arg(long)]
        user: Option<String>,
    },

    /// List blocks
    Blocks {
        /// Only active blocks
        #[arg(long, conflicts_with = "inactive")]
        active: bool,

        /// Only lifted or expired blocks
        #[arg(long)]
        inactive: bool,

        #[arg(long, value_parser = parse_kind)]
        kind: Option<BlockKind>,

        #[arg(long, value_parser = parse_reason)]
        reason: Option<BlockReason>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = bastion_common::constants::DEFAULT_PAGE_LIMIT)]
        limit: u32,
    },

    /// Block an identity
    Block {
        /// Client IP address
        identity: String,

        #[arg(long, value_parser = parse_reason)]
        reason: BlockReason,

        #[arg(long, value_parser = parse_kind, default_value = "manual")]
        kind: BlockKind,

        /// Block duration in hours (permanent when omitted)
        #[arg(long)]
        hours: Option<i64>,

        /// Shown to the blocked client
        #[arg(long)]
        description: Option<String>,
    },

    /// Lift an identity's active block
    Unblock {
        /// Client IP address
        identity: String,

        #[arg(long)]
        reason: String,
    },

    /// Show registry statistics
    Stats,

    /// Run the expiry sweep and tracking GC now
    Cleanup,

    /// Inspect fraud tracking for an identity
    Tracking {
        /// Client IP address
        identity: String,
    },
}

fn parse_kind(s: &str) -> Result<BlockKind, String> {
    s.parse().map_err(|e: bastion_common::ParseError| e.to_string())
}

fn parse_reason(s: &str) -> Result<BlockReason, String> {
    s.parse().map_err(|e: bastion_common::ParseError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},bastion_cli=info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    match cli.command {
        Commands::Login {
            token,
            server,
            user,
        } => {
            commands::login::run(token, server, user).await?;
        }

        Commands::Blocks {
            active,
            inactive,
            kind,
            reason,
            page,
            limit,
        } => {
            let query = ListBlocksQuery {
                active: match (active, inactive) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                kind,
                reason,
                page: Some(page),
                limit: Some(limit),
            };
            commands::blocks::list(query).await?;
        }

        Commands::Block {
            identity,
            reason,
            kind,
            hours,
            description,
        } => {
            commands::blocks::block(identity, kind, reason, hours, description).await?;
        }

        Commands::Unblock { identity, reason } => {
            commands::blocks::unblock(identity, reason).await?;
        }

        Commands::Stats => {
            commands::stats::stats().await?;
        }

        Commands::Cleanup => {
            commands::stats::cleanup().await?;
        }

        Commands::Tracking { identity } => {
            commands::stats::tracking(identity).await?;
        }
    }

    Ok(())
}
