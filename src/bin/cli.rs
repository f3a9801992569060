//! shmkv CLI
//!
//! Inspect and edit a shmkv data file from the shell. Each invocation opens
//! its own session, so it coexists with long-running processes that have the
//! same file open.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shmkv::{Config, GrowthPolicy, OpenMode, Session, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// shmkv CLI
#[derive(Parser, Debug)]
#[command(name = "shmkv-cli")]
#[command(about = "Command-line access to a shmkv data file")]
#[command(version)]
struct Args {
    /// Data file
    path: PathBuf,

    /// Directory holding the lock region
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Open writes as the sole write-only session
    #[arg(long)]
    write_only: bool,

    /// Let a read-write session grow the file
    #[arg(long)]
    allow_growth: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// Store the value as a number
        #[arg(long)]
        number: bool,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// List every key
    Keys,

    /// Print size, free space and table figures
    Stats,

    /// Write every entry to a snapshot file
    Export {
        /// Snapshot file to write
        file: PathBuf,
    },

    /// Set every entry from a snapshot file
    Import {
        /// Snapshot file to read
        file: PathBuf,
    },

    /// Delete the lock region of the data file
    RemoveLock,
}

impl Commands {
    fn writes(&self) -> bool {
        matches!(
            self,
            Commands::Set { .. } | Commands::Del { .. } | Commands::Import { .. }
        )
    }
}

fn main() -> ExitCode {
    // Logs go to stderr so command output stays clean on stdout
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shmkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> shmkv::Result<()> {
    let mode = match (args.command.writes(), args.write_only) {
        (false, _) => OpenMode::ReadOnly,
        (true, true) => OpenMode::WriteOnly,
        (true, false) => OpenMode::ReadWrite,
    };

    let mut builder = Config::builder().path(&args.path).mode(mode);
    if let Some(dir) = &args.lock_dir {
        builder = builder.lock_dir(dir);
    }
    if args.allow_growth {
        builder = builder.growth_policy(GrowthPolicy::AnyWriter);
    }
    let config = builder.build();

    let command = match args.command {
        Commands::RemoveLock => {
            let removed = shmkv::remove_lock_region(&config)?;
            println!("{}", if removed { "removed" } else { "no lock region" });
            return Ok(());
        }
        command => command,
    };

    let session = Session::open(config)?;
    execute(&session, command)?;
    session.close()
}

fn execute(session: &Session, command: Commands) -> shmkv::Result<()> {
    match command {
        Commands::Get { key } => match session.get(&key)? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Commands::Set { key, value, number } => {
            let value = if number {
                let parsed: f64 = value.parse().map_err(|_| {
                    shmkv::ShmkvError::Config(format!("{:?} is not a number", value))
                })?;
                Value::Number(parsed)
            } else {
                Value::Text(value)
            };
            session.set(&key, value)?;
            println!("OK");
        }
        Commands::Del { key } => {
            session.delete(&key)?;
            println!("OK");
        }
        Commands::Keys => {
            for key in session.enumerate()? {
                println!("{}", key);
            }
        }
        Commands::Stats => {
            let stats = session.stats()?;
            println!("total_size       {}", stats.total_size);
            println!("free_bytes       {}", stats.free_bytes);
            println!("entry_count      {}", stats.entry_count);
            println!("bucket_count     {}", stats.bucket_count);
            println!("max_bucket_count {}", stats.max_bucket_count);
            println!("load_factor      {:.3}", stats.load_factor);
            println!("max_load_factor  {:.3}", stats.max_load_factor);
            println!("longest_chain    {}", stats.longest_chain);
        }
        Commands::Export { file } => {
            let info = session.export(&file)?;
            println!("exported {} entries", info.entry_count);
        }
        Commands::Import { file } => {
            let count = session.import(&file)?;
            println!("imported {} entries", count);
        }
        Commands::RemoveLock => {}
    }
    Ok(())
}
