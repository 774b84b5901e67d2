use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    #[arg(short, long, default_value = "config.json")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API and the worker pool
    Serve {
        /// Overrides `listen_addr` from the config
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Download one file into the library, showing progress
    Get {
        url: String,
        /// Library-relative destination
        destination: String,
    },
}
