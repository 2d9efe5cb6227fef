use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presencecam::{
    events::DEFAULT_HISTORY_LIMIT, EventStore, PresenceConfig, UploadCleaner,
};
use tracing::{info, warn};

/// Maintenance for a presencecam deployment: event log and stored uploads.
#[derive(Parser, Debug)]
#[command(name = "presence-admin")]
#[command(about = "Maintain the presencecam event log and upload directory")]
struct Args {
    /// Path to presencecam configuration file
    #[arg(short = 'c', long, default_value = "presencecam.toml")]
    config: String,

    /// Event database (defaults to storage.database_path from the config)
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the event table if it does not exist
    InitDb,
    /// Delete every logged event
    ClearAll,
    /// Delete the most recent N events
    ClearLast {
        /// Number of events to delete
        count: usize,
    },
    /// Delete stored frames, keeping the reference image
    CleanUploads {
        /// Only delete files older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Print recent events, newest first
    History {
        /// Only events logged under this method label
        #[arg(long)]
        method: Option<String>,

        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = PresenceConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config))?;
    let database = args
        .database
        .clone()
        .unwrap_or_else(|| config.storage.database_path.clone());

    match args.command {
        Command::InitDb => {
            EventStore::open(&database)?;
            println!("Database initialized at {}", database);
        }
        Command::ClearAll => {
            let deleted = EventStore::open(&database)?.clear_all()?;
            println!("Deleted {} events", deleted);
        }
        Command::ClearLast { count } => {
            let deleted = EventStore::open(&database)?.clear_last(count)?;
            if deleted < count {
                warn!("Only {} events existed", deleted);
            }
            println!("Deleted the last {} events", deleted);
        }
        Command::CleanUploads { older_than_days } => {
            let mut cleaner = UploadCleaner::new(&config.storage);
            if let Some(days) = older_than_days {
                cleaner = cleaner.older_than_days(days);
            }

            let result = cleaner.run()?;
            for err in &result.errors {
                eprintln!("{}", err);
            }
            println!(
                "Deleted {} files ({:.1} MB), kept {}",
                result.files_deleted,
                result.bytes_freed as f64 / 1_048_576.0,
                result.files_kept
            );
        }
        Command::History { method, limit } => {
            let store = EventStore::open(&database)?;
            let records = store.history(method.as_deref(), limit)?;
            info!("{} events", records.len());

            for record in records {
                println!(
                    "{:>6}  {:<20} {:<24} try {:<5} presence={} fallback={}  {}",
                    record.id,
                    record.timestamp,
                    record.method,
                    record.try_id,
                    record.presence,
                    record.fallback_used,
                    record.filename
                );
            }
        }
    }

    Ok(())
}
