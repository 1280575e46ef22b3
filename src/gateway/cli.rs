// CLI commands for the gateway

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

/// Upper bound for `issue-token --ttl-hours`
pub const MAX_TTL_HOURS: i64 = 24 * 365 * 10;

/// Gateway CLI
#[derive(Debug, Parser)]
#[command(name = "hermes-gateway")]
#[command(about = "Real-time chat gateway over STOMP/WebSocket")]
pub struct GatewayCli {
    /// Configuration file (default: config/hermes.toml, optional)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: GatewayCommand,
}

/// Gateway subcommands
#[derive(Debug, Subcommand)]
pub enum GatewayCommand {
    /// Run the gateway until Ctrl+C
    Serve {
        /// Listen address, e.g. 0.0.0.0:8080
        #[arg(short, long)]
        listen: Option<String>,

        /// Directory holding the database and uploads
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Create an account record
    AddUser {
        #[arg(short, long)]
        username: String,
    },

    /// Create a group; the creator is always a member
    CreateGroup {
        #[arg(short, long)]
        name: String,

        /// Creator's user id
        #[arg(long)]
        created_by: i64,

        /// Additional member ids
        #[arg(short, long)]
        member: Vec<i64>,
    },

    /// Print a credential for an existing user
    IssueToken {
        #[arg(short, long)]
        username: String,

        /// Validity in hours, at most ten years (default: auth.token_ttl_hours)
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_TTL_HOURS))]
        ttl_hours: Option<i64>,
    },

    /// Print conversation history
    #[command(group(ArgGroup::new("target").required(true).args(["peer", "group"])))]
    History {
        /// User whose view to print
        #[arg(long)]
        user: i64,

        /// Other participant of a direct conversation
        #[arg(long)]
        peer: Option<i64>,

        /// Group id
        #[arg(long)]
        group: Option<i64>,

        /// How far back to look
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}
