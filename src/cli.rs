use clap::{Args, Parser, Subcommand};

use download_store::config::{StoreConfig, DEFAULT_NAMESPACE};
use download_store::Status;

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "download-store", about = "Inspect and maintain a download queue database")]
pub struct Cli {
    /// Directory holding the queue databases
    #[arg(
        short = 'd',
        long,
        env = "DOWNLOAD_STORE_DIR",
        default_value = "~/.download-store"
    )]
    pub directory: String,

    /// Queue namespace; selects `<directory>/<namespace>.db`
    #[arg(short = 'n', long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Skip destination file checks while sanitizing
    #[arg(long)]
    pub no_file_checks: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show record counts per status
    Status,
    /// List records
    List(ListArgs),
    /// Run the cold-start reconciliation and report repairs
    Sanitize,
    /// Remove one key from a record's extras
    DeleteExtra(DeleteExtraArgs),
    /// Delete the database and its WAL/SHM files
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only records in this status (repeatable)
    #[arg(long = "status", value_parser = parse_status)]
    pub statuses: Vec<Status>,

    /// Only records in this group
    #[arg(long)]
    pub group: Option<i32>,

    /// Only records carrying this tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeleteExtraArgs {
    /// Record id
    #[arg(long)]
    pub id: i32,

    /// Extras key to remove
    #[arg(long)]
    pub key: String,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl Cli {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::from_user_paths(&self.namespace, &self.directory)
            .with_file_exist_checks(!self.no_file_checks)
    }
}

pub fn parse_status(s: &str) -> Result<Status, String> {
    Status::from_str(s).ok_or_else(|| {
        let valid: Vec<&str> = Status::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown status '{s}', expected one of: {}", valid.join(", "))
    })
}
