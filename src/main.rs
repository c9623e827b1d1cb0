use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Context, Result, eyre};
use gridstore::{Config, ListQuery, ListedRecord, Origin, RecordLister, SqliteRemote, StateStore};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "gridstore")]
#[command(about = "gridstore CLI - keyed state with local fallback and paginated listings")]
#[command(version)]
struct Cli {
    /// Configuration file (default: gridstore.yaml in the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the state stored under a key
    Get { key: String },

    /// Store a JSON payload under a key
    Set { key: String, payload: String },

    /// List records, one page at a time
    List {
        #[arg(short, long)]
        limit: Option<usize>,
        /// Cursor printed by a previous page
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(short, long)]
        search: Option<String>,
        /// Earliest timestamp (RFC 3339 or YYYY-MM-DD), inclusive
        #[arg(long)]
        since: Option<String>,
        /// Latest timestamp (RFC 3339 or YYYY-MM-DD), inclusive
        #[arg(long)]
        until: Option<String>,
    },

    /// Load a JSON array of records into the remote listing table
    Seed { file: PathBuf },

    /// Print every state entry held by the remote store
    Dump,
}

fn main() -> Result<()> {
    // Setup tracing
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Get { key } => {
            let origin = Origin::open(&config.local)?;
            let store = StateStore::connect(&config, &origin);
            match store.load_value(&key) {
                Some(payload) if cli.json => println!("{}", payload),
                Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
                None if cli.json => println!("null"),
                None => println!("{} {}", "No state for".dimmed(), key.bold()),
            }
        }
        Commands::Set { key, payload } => {
            let payload: serde_json::Value = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let origin = Origin::open(&config.local)?;
            let store = StateStore::connect(&config, &origin);
            store.save_value(&key, &payload);
            if !cli.json {
                println!("{} {}", "Saved".green(), key.bold());
            }
        }
        Commands::List {
            limit,
            cursor,
            category,
            search,
            since,
            until,
        } => {
            let accessor = Rc::new(gridstore::RemoteAccessor::from_config(&config.remote));
            let lister = RecordLister::from_config(accessor, &config.listing);
            let page = lister.list(&ListQuery {
                limit,
                cursor,
                category,
                search,
                start_date: since,
                end_date: until,
            });

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                for record in &page.entries {
                    print_record(record);
                }
                match &page.next_cursor {
                    Some(next) => println!("\n{} {}", "next cursor:".dimmed(), next),
                    None => println!("\n{}", "end of list".dimmed()),
                }
            }
        }
        Commands::Seed { file } => {
            let mut remote = open_remote(&config)?;
            let json = fs::read_to_string(&file).context("Failed to read records file")?;
            let records: Vec<ListedRecord> = serde_json::from_str(&json).context("Failed to parse records file")?;
            let count = remote.insert_records(records)?;
            if !cli.json {
                println!("{} {} records", "Seeded".green(), count);
            }
        }
        Commands::Dump => {
            let remote = open_remote(&config)?;
            let entries = remote.entries()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!("{} {}", entry.key.bold(), entry.payload);
                }
            }
        }
    }

    Ok(())
}

fn open_remote(config: &Config) -> Result<SqliteRemote> {
    let path = config
        .remote
        .database
        .as_ref()
        .ok_or_else(|| eyre!("No remote database configured (set remote.database or GRIDSTORE_REMOTE_DB)"))?;
    SqliteRemote::open(path)
}

fn print_record(record: &ListedRecord) {
    let date = record.timestamp.get(..10).unwrap_or(&record.timestamp);
    println!(
        "{}  {:<12} {}",
        date.cyan(),
        record.category.yellow(),
        record.title.bold()
    );
    if !record.description.is_empty() {
        println!("            {}", record.description);
    }
}
