//! # Conversant CLI (`cva`)
//!
//! The `cva` binary is the primary interface for Conversant. It provides
//! commands for store initialization, user management, natural-language
//! queries, raw SQL execution, alert evaluation, and starting the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! cva --config ./config/cva.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cva init` | Create the SQLite store and run schema migrations |
//! | `cva serve api` | Start the analytics HTTP API |
//! | `cva user add <name> <email>` | Create a user |
//! | `cva user list` | List users |
//! | `cva ask "<question>"` | Run the natural-language query pipeline |
//! | `cva sql "<statement>"` | Run a guarded SQL statement |
//! | `cva alert check` | Evaluate every active alert (cron-friendly) |
//! | `cva templates` | Print the canned query templates |
//! | `cva stats` | Print application store statistics |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the store
//! cva init --config ./config/cva.toml
//!
//! # Create an admin user and start the API
//! cva user add alice alice@corp.io --password s3cret --admin
//! cva serve api
//!
//! # Ask a question from the terminal
//! cva ask "top 10 suppliers by revenue last quarter" --user alice
//!
//! # Evaluate alerts from cron
//! cva alert check
//! ```

mod alerts;
mod assistant;
mod auth;
mod cache;
mod catalog;
mod config;
mod db;
mod memory;
mod migrate;
mod models;
mod notify;
mod pipeline;
mod queries;
mod server;
mod stats;
mod warehouse;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Conversant CLI — a conversational analytics service for Snowflake
/// warehouses.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Secrets (signing key, warehouse password, assistant API key, SMTP
/// credentials, webhook URL) are read from environment variables named in
/// that file.
#[derive(Parser)]
#[command(
    name = "cva",
    about = "Conversant — a conversational analytics service for Snowflake warehouses",
    version,
    long_about = "Conversant translates natural-language questions into guarded warehouse SQL \
    via the Anthropic API, caches results, generates insights and chart recommendations, and \
    evaluates threshold alerts with email/Slack notification. It serves a JSON HTTP API for \
    the chat dashboard and this CLI for operators."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cva.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the application store.
    ///
    /// Creates the SQLite file and all required tables (users, sessions,
    /// conversation memory, query cache, saved queries, alerts, alert
    /// history). This command is idempotent — running it multiple times is
    /// safe.
    Init,

    /// Start the analytics HTTP API.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },

    /// Manage users.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Run the natural-language query pipeline and print the outcome.
    ///
    /// Translates the question to SQL, executes it against the warehouse,
    /// and prints rows, insights, a chart recommendation, and follow-up
    /// suggestions.
    Ask {
        /// The question, in plain language.
        question: String,

        /// Username the conversation is recorded under.
        #[arg(long)]
        user: String,

        /// Continue an existing conversation session.
        #[arg(long)]
        session: Option<String>,

        /// Bypass the query result cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Run one guarded SQL statement against the warehouse.
    ///
    /// The statement must be read-only (SELECT, WITH, SHOW, DESCRIBE);
    /// unbounded SELECTs get the configured row cap appended.
    Sql {
        /// The SQL statement.
        statement: String,

        /// Bypass the query result cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Manage alerts.
    Alert {
        #[command(subcommand)]
        action: AlertAction,
    },

    /// Print the canned query templates.
    Templates,

    /// Print application store statistics.
    ///
    /// Shows user counts, conversation volume, cache occupancy, and alert
    /// activity. Never touches the warehouse.
    Stats,
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the analytics HTTP API.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// full JSON API: auth, analytics, saved queries, and alerts.
    Api,
}

/// User management subcommands.
#[derive(Subcommand)]
enum UserAction {
    /// Create a user.
    Add {
        /// Username (unique).
        username: String,
        /// Email address (unique).
        email: String,
        /// Password. Prefer passing via an environment-substituted value
        /// rather than shell history in production.
        #[arg(long)]
        password: String,
        /// Optional display name.
        #[arg(long)]
        full_name: Option<String>,
        /// Grant the admin role.
        #[arg(long)]
        admin: bool,
    },
    /// List users.
    List,
}

/// Alert subcommands.
#[derive(Subcommand)]
enum AlertAction {
    /// Evaluate every active alert and send notifications for any that
    /// fire. Designed to run from cron.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conversant=info,cva=info")),
        )
        .init();

    let cli = Cli::parse();

    // Templates are static and need no config
    if let Commands::Templates = cli.command {
        catalog::run_templates();
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Store initialized successfully.");
        }
        Commands::Serve { service } => match service {
            ServeService::Api => {
                server::run_server(&cfg).await?;
            }
        },
        Commands::User { action } => match action {
            UserAction::Add {
                username,
                email,
                password,
                full_name,
                admin,
            } => {
                auth::run_user_add(&cfg, &username, &email, &password, full_name.as_deref(), admin)
                    .await?;
            }
            UserAction::List => {
                auth::run_user_list(&cfg).await?;
            }
        },
        Commands::Ask {
            question,
            user,
            session,
            no_cache,
        } => {
            pipeline::run_ask(&cfg, &question, &user, session, !no_cache).await?;
        }
        Commands::Sql {
            statement,
            no_cache,
        } => {
            pipeline::run_sql(&cfg, &statement, !no_cache).await?;
        }
        Commands::Alert { action } => match action {
            AlertAction::Check => {
                alerts::run_check(&cfg).await?;
            }
        },
        Commands::Templates => {
            // Handled above (before config loading)
            unreachable!()
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
