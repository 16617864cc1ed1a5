use clap::{Parser, Subcommand};

/// Chat-completion relay gateway
#[derive(Parser)]
#[command(name = "relayd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Port to bind (overrides RELAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Maintenance jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
}

#[derive(Subcommand)]
pub enum JobsCommands {
    /// Run one maintenance job now and print its summary
    Run { name: String },
    /// List the job names
    List,
}
