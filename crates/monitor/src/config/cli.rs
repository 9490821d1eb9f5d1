use clap::{Parser, Subcommand};

use crate::config::monitor::{MonitorArgs, PurgeArgs};

#[derive(Parser)]
#[command(about = "Processing-unit lifecycle monitor", long_about = None, version)]
pub struct Cli {
    #[command(flatten)]
    pub monitor: MonitorArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print every stored processing-unit context as JSON lines
    Contexts,
    /// Delete empty cgroups below the base cgroup
    Sweep,
    /// Remove the whole context store
    Purge(PurgeArgs),
}
