//! minidb - administration tool for a minidb data directory

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use minidb::access::{Column, DataType, Row, Schema, Value};
use minidb::config::DbConfig;
use minidb::database::Database;
use minidb::storage::wal::WalManager;
use std::ops::Bound;
use std::path::PathBuf;

/// minidb - a single-node transactional key/value store
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./minidb_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Buffer pool size in pages
    #[arg(long, default_value = "64")]
    pool_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value under a key, replacing any previous value
    Put { key: String, value: String },
    /// Print the value stored under a key
    Get { key: String },
    /// Remove a key
    Delete { key: String },
    /// Print every pair with from <= key <= to
    Scan {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Show file metadata, log position and recovery results
    Info,
    /// Dump the write-ahead log without opening the database
    Wal,
    /// Flush every page and write a checkpoint record
    Checkpoint,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = DbConfig::new(&args.data_dir).with_buffer_pool_size(args.pool_size);

    match args.command {
        // Reading the log must not trigger recovery or a checkpoint.
        Command::Wal => dump_wal(&config),
        command => {
            let db = Database::open(config, kv_schema()?).context("Failed to open database")?;
            run(&db, command)?;
            db.close().context("Failed to close database")
        }
    }
}

fn kv_schema() -> Result<Schema> {
    Schema::new(
        "kv",
        vec![
            Column::new("id", DataType::Varchar),
            Column::new("value", DataType::Varchar),
        ],
    )
}

fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Put { key, value } => {
            let rid = db.insert(&[Value::from(key.as_str()), Value::from(value.as_str())])?;
            println!("OK {}", rid);
        }
        Command::Get { key } => match db.get(&Value::from(key.as_str()))? {
            Some(row) => println!("{}", render_value(&row)),
            None => println!("(not found)"),
        },
        Command::Delete { key } => {
            if db.delete(&Value::from(key.as_str()))? {
                println!("OK");
            } else {
                println!("(not found)");
            }
        }
        Command::Scan { from, to } => {
            let low = from.map(|k| Value::from(k.as_str()));
            let high = to.map(|k| Value::from(k.as_str()));
            let rows = db.scan_range(
                low.as_ref().map_or(Bound::Unbounded, Bound::Included),
                high.as_ref().map_or(Bound::Unbounded, Bound::Included),
            )?;
            for row in &rows {
                println!("{}\t{}", row[0], render_value(row));
            }
            println!("({} rows)", rows.len());
        }
        Command::Info => {
            let info = db.info()?;
            println!("data directory: {}", db.config().data_dir.display());
            println!("format version: {}", info.metadata.version);
            println!("page size:      {}", info.metadata.page_size);
            println!("pages:          {}", info.num_pages);
            println!("cached pages:   {}", info.cached_pages);
            println!("rows:           {}", info.rows);
            println!("index height:   {}", info.btree_height);
            println!("next lsn:       {}", info.next_lsn);
            println!("flushed lsn:    {}", info.flushed_lsn);
            println!("last recovery:  {}", db.recovery_stats());
        }
        Command::Checkpoint => {
            let lsn = db.checkpoint()?;
            println!("checkpoint at {}", lsn);
        }
        Command::Wal => dump_wal(db.config())?,
    }
    Ok(())
}

fn dump_wal(config: &DbConfig) -> Result<()> {
    let path = config.wal_path();
    let records = WalManager::read_log(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    for record in &records {
        println!("{}", record);
    }
    println!("({} records)", records.len());
    Ok(())
}

fn render_value(row: &Row) -> String {
    row.get(1).map(|v| v.to_string()).unwrap_or_default()
}
