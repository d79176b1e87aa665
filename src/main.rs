//! download-store: inspect and maintain a download manager's queue database.
//!
//! Every command opens the namespace's database, runs a short series of
//! store calls on the blocking pool, and closes it again.

#![warn(clippy::all)]

mod cli;
mod types;

use std::collections::BTreeMap;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use download_store::config::StoreConfig;
use download_store::{ColdStart, DownloadRecord, DownloadStore, Status};

/// Open the store, run `f` on the blocking pool, then close the store.
async fn with_store<T, F>(config: StoreConfig, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&DownloadStore) -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let store = DownloadStore::open(&config)?;
        let result = f(&store);
        let outcome = store.close();
        for warning in outcome.warnings() {
            tracing::warn!(warning = %warning, "Store did not close cleanly");
        }
        result
    })
    .await?
}

/// Run the status command.
async fn run_status(config: StoreConfig) -> anyhow::Result<()> {
    let db_path = config.database_path();
    if !db_path.exists() {
        println!("No download database found at {}", db_path.display());
        return Ok(());
    }

    let (counts, groups, pending) = with_store(config, |store| {
        let mut counts: BTreeMap<i32, (Status, usize)> = BTreeMap::new();
        for record in store.get_all()? {
            counts
                .entry(record.status.as_i32())
                .or_insert((record.status, 0))
                .1 += 1;
        }
        let groups = store.get_all_group_ids()?;
        let pending = store.get_pending_count(true)?;
        Ok((counts, groups, pending))
    })
    .await?;

    println!("Download Database: {}", db_path.display());
    println!();
    println!("Records:");
    let total: usize = counts.values().map(|(_, n)| n).sum();
    println!("  {:<12} {}", "total", total);
    for (status, count) in counts.values() {
        println!("  {:<12} {}", status.as_str(), count);
    }
    println!();
    println!("Pending:  {pending}");
    println!("Groups:   {}", groups.len());

    Ok(())
}

/// Run the list command.
async fn run_list(config: StoreConfig, args: cli::ListArgs) -> anyhow::Result<()> {
    let records = with_store(config, move |store| {
        let mut records = if !args.tags.is_empty() {
            let labels: Vec<&str> = args.tags.iter().map(String::as_str).collect();
            store.get_by_tags(&labels)?
        } else if let Some(group) = args.group {
            if args.statuses.is_empty() {
                store.get_by_group(group)?
            } else {
                store.get_by_group_with_statuses(group, &args.statuses)?
            }
        } else if !args.statuses.is_empty() {
            store.get_by_statuses(&args.statuses)?
        } else {
            store.get_all()?
        };
        // Tag queries return the union; narrow it by the other filters.
        if !args.tags.is_empty() {
            records.retain(|r| {
                args.group.map_or(true, |g| r.group == g)
                    && (args.statuses.is_empty() || args.statuses.contains(&r.status))
            });
        }
        Ok(records)
    })
    .await?;

    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &DownloadRecord) {
    let progress = if record.total > 0 {
        format!("{}/{}", record.downloaded, record.total)
    } else {
        format!("{}/?", record.downloaded)
    };
    let tags: Vec<&str> = record.effective_tags();
    println!(
        "  {:>6}  {:<11}  {:>21}  group={}  {}{}",
        record.id,
        record.status.as_str(),
        progress,
        record.group,
        record.file,
        if tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", tags.join(", "))
        }
    );
}

/// Run the sanitize command.
async fn run_sanitize(config: StoreConfig) -> anyhow::Result<()> {
    let result = with_store(config, |store| Ok(store.sanitize_on_first_entry()?)).await?;
    match result {
        ColdStart::AlreadyDone => println!("Sanitization already ran."),
        ColdStart::Completed { repaired, outcome } => {
            println!("Repaired {repaired} record(s).");
            for warning in outcome.warnings() {
                println!("  warning: {warning}");
            }
        }
    }
    Ok(())
}

/// Run the delete-extra command.
async fn run_delete_extra(config: StoreConfig, args: cli::DeleteExtraArgs) -> anyhow::Result<()> {
    let id = args.id;
    let updated = with_store(config, move |store| {
        Ok(store.delete_extra_by_key(args.id, &args.key)?)
    })
    .await?;
    match updated {
        Some(record) => println!("Record {} now has {} extra(s).", record.id, record.extras.len()),
        None => println!("No record with id {id}."),
    }
    Ok(())
}

/// Run the reset-state command.
async fn run_reset_state(config: StoreConfig, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = config.database_path();

    if !db_path.exists() {
        println!("No download database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the download database at:");
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(&db_path)?;
    println!("Download database deleted.");

    for sidecar in config.sidecar_paths() {
        let _ = std::fs::remove_file(&sidecar);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let filter = cli.log_level.as_filter();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = cli.store_config();
    tracing::debug!(namespace = %config.namespace, path = %config.database_path().display(), "Using download database");

    match cli.command {
        Command::Status => run_status(config).await,
        Command::List(args) => run_list(config, args).await,
        Command::Sanitize => run_sanitize(config).await,
        Command::DeleteExtra(args) => run_delete_extra(config, args).await,
        Command::ResetState(args) => run_reset_state(config, args).await,
    }
}
