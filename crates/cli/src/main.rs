mod commands;
mod server;

use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};
use std::io;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "live-origin")]
#[command(version, about = "Origin server for live segmented media", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Accept uploads and serve them while they are still being written
    Serve(commands::serve::ServeArgs),

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "live-origin", &mut io::stdout());
            Ok(())
        }
    }
}
