//! skywatch_events - list or purge archived capture events for one owner

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use skywatch::{EventArchive, EventRecord, FilesystemBlobStore, Notifier, SqliteEventStore};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the event database.
    #[arg(long, env = "SKYWATCH_DB_PATH", default_value = "skywatch.db")]
    db_path: String,
    /// Directory holding uploaded artifacts.
    #[arg(long, env = "SKYWATCH_BLOB_DIR", default_value = "skywatch_blobs")]
    blob_dir: PathBuf,
    /// Owner whose events are listed or deleted.
    #[arg(long, env = "SKYWATCH_OWNER", default_value = "local")]
    owner: String,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto, value_name = "MODE")]
    ui: ui::UiMode,
    #[command(subcommand)]
    command: EventsCommand,
}

#[derive(Subcommand, Debug)]
enum EventsCommand {
    /// Print events newest first.
    List {
        /// Emit one JSON record per line instead of a summary.
        #[arg(long)]
        json: bool,
        /// Show at most this many events.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete every event and artifact for the owner.
    DeleteAll {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui);

    let archive = {
        let _stage = ui.stage("Open event archive");
        let events = SqliteEventStore::open(&args.db_path)
            .with_context(|| format!("failed to open event store {}", args.db_path))?;
        let blobs = FilesystemBlobStore::new(args.blob_dir.clone())
            .with_context(|| format!("failed to open blob dir {}", args.blob_dir.display()))?;
        EventArchive::new(
            args.owner.clone(),
            Arc::new(events),
            Arc::new(blobs),
            Notifier::disabled(),
        )
    };

    match args.command {
        EventsCommand::List { json, limit } => {
            let records = {
                let mut stage = ui.stage("Load events");
                let records = archive.list()?;
                stage.detail(format!("{} events", records.len()));
                records
            };
            let shown = limit.unwrap_or(records.len());
            for record in records.iter().take(shown) {
                if json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    println!("{}", summarize(record));
                }
            }
        }
        EventsCommand::DeleteAll { yes } => {
            if !yes {
                return Err(anyhow!(
                    "refusing to delete events for {} without --yes",
                    archive.owner()
                ));
            }
            let removed = {
                let mut stage = ui.stage("Delete events");
                let removed = archive.delete_all()?;
                stage.detail(format!("{} removed", removed));
                removed
            };
            println!("deleted {} events for {}", removed, archive.owner());
        }
    }
    Ok(())
}

fn summarize(record: &EventRecord) -> String {
    let verdict = match &record.verdict {
        Some(v) => format!(
            "{} {:.0}%",
            v.anomaly_grade,
            v.probability_of_genuine_event * 100.0
        ),
        None => "no verdict".to_string(),
    };
    let mut files = Vec::new();
    if record.video.is_some() {
        files.push("video");
    }
    if record.photo.is_some() {
        files.push("photo");
    }
    files.push("report");
    format!(
        "{}  {}  {:<6}  {:<20}  [{}]{}",
        record.captured_at.format("%Y-%m-%d %H:%M:%S"),
        record.id,
        record.source.as_str(),
        verdict,
        files.join(","),
        if record.issues.is_empty() {
            String::new()
        } else {
            format!("  {} issue(s)", record.issues.len())
        }
    )
}
