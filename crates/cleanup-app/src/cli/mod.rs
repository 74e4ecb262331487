use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Default, Parser)]
#[command(
    name = "cleanup",
    version,
    about = "Dataset cleanup panel backend"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the panel HTTP server.
    Serve(ServeArgs),
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Override `server.listen_addr` from the configuration.
    #[arg(long, value_name = "ADDR", env = "CLEANUP_LISTEN")]
    pub listen: Option<String>,
}
