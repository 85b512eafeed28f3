//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use troupe_core::config::{self, Config};
use troupe_core::core::interrupt;
use troupe_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "troupe")]
#[command(version)]
#[command(about = "Multi-agent runtime with local and remote execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $TROUPE_HOME/config.toml)
    #[arg(long, global = true, value_name = "PATH", env = "TROUPE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Runs one turn with a prompt
    Run {
        /// Agent to start with (default: the configured default agent)
        #[arg(long)]
        agent: Option<String>,

        /// Continue a saved session: an ID, -N for the Nth most recent, or "last"
        #[arg(long, value_name = "REF", allow_hyphen_values = true)]
        session: Option<String>,

        /// Run against a troupe server instead of in-process
        #[arg(long, value_name = "URL")]
        remote: Option<String>,

        /// Approve every tool call without asking
        #[arg(long)]
        yolo: bool,

        /// Iteration budget for this session (0 = unlimited)
        #[arg(long, value_name = "N")]
        max_iterations: Option<u32>,

        /// The prompt to send
        #[arg(required = true, value_name = "PROMPT")]
        prompt: Vec<String>,
    },

    /// Serves sessions over HTTP
    Serve {
        /// Address to listen on (default: [server].listen from config)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        command: Option<SessionCommands>,
    },

    /// Sets an agent's model for a saved session
    Model {
        /// Session to update
        #[arg(long, value_name = "REF", allow_hyphen_values = true)]
        session: String,

        /// Agent whose model changes
        #[arg(value_name = "AGENT")]
        agent: String,

        /// Model name from config or provider/model; empty restores the default
        #[arg(value_name = "MODEL")]
        model: String,
    },

    /// Summarizes a saved session and compacts its history
    Compact {
        /// Session to compact
        #[arg(long, value_name = "REF", allow_hyphen_values = true)]
        session: String,

        /// Extra instructions for the summary
        #[arg(value_name = "INSTRUCTIONS")]
        instructions: Vec<String>,
    },
}

#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Lists saved sessions, newest first
    List,
    /// Shows a saved session
    Show {
        #[arg(value_name = "REF", allow_hyphen_values = true)]
        reference: String,
    },
    /// Deletes a saved session
    Delete {
        #[arg(value_name = "REF", allow_hyphen_values = true)]
        reference: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("load config")?;
    let _log_guard = logging::init(&config.logging)?;

    interrupt::init()?;

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli.command, config).await })
}

async fn dispatch(command: Commands, config: Config) -> Result<()> {
    tracing::debug!(home = %config::paths::troupe_home().display(), "starting");

    match command {
        Commands::Run {
            agent,
            session,
            remote,
            yolo,
            max_iterations,
            prompt,
        } => {
            commands::run::run(commands::run::RunOptions {
                config: &config,
                agent: agent.as_deref(),
                session: session.as_deref(),
                remote: remote.as_deref(),
                yolo,
                max_iterations,
                prompt: &prompt.join(" "),
            })
            .await
        }
        Commands::Serve { listen } => commands::serve::run(&config, listen.as_deref()).await,
        Commands::Sessions { command } => match command.unwrap_or(SessionCommands::List) {
            SessionCommands::List => commands::sessions::list().await,
            SessionCommands::Show { reference } => commands::sessions::show(&reference).await,
            SessionCommands::Delete { reference } => commands::sessions::delete(&reference).await,
        },
        Commands::Model {
            session,
            agent,
            model,
        } => commands::model::run(&config, &session, &agent, &model).await,
        Commands::Compact {
            session,
            instructions,
        } => {
            let instructions = Some(instructions.join(" ")).filter(|i| !i.trim().is_empty());
            commands::compact::run(&config, &session, instructions).await
        }
    }
}
