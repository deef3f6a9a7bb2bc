use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod doctor;
mod run;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Autonomous engineering task executor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute all open work items carrying a run label.
    Run {
        /// Run label identifying this batch of work items.
        #[arg(long)]
        label: String,

        /// Maximum number of parallel slots (overrides config).
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Path to a foreman.toml (defaults to ./foreman.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Check that required tools and engines are available.
    Doctor {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Sweep workspaces, branches and processes stranded by dead runs.
    Reap,
}

#[tokio::main]
async fn main() {
    foreman_core::init_tracing();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run {
            label,
            max_parallel,
            config,
        } => run::execute(&label, max_parallel, config.as_deref()).await,
        Command::Doctor { json } => doctor::execute(json).await,
        Command::Reap => run::execute_reap().await,
    };

    let code = match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            run::EXIT_PREFLIGHT
        }
    };
    std::process::exit(code);
}
