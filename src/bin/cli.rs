//! stratakv admin CLI
//!
//! Inspect and edit a stratakv database file from the command line.

use clap::{Parser, Subcommand};
use stratakv::{BucketFlags, Config, Database, PutFlags, Result, StrataError};
use tracing_subscriber::{fmt, EnvFilter};

/// stratakv admin CLI
#[derive(Parser, Debug)]
#[command(name = "stratakv-cli")]
#[command(about = "Inspect and edit a stratakv database file")]
#[command(version)]
struct Args {
    /// Database file
    #[arg(short, long, default_value = "./stratakv.db")]
    path: String,

    /// Page size used when the file is created
    #[arg(long, default_value = "4096")]
    page_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show file and bucket statistics
    Stat {
        /// Only this bucket
        bucket: Option<String>,
    },

    /// List bucket names
    Buckets,

    /// Get the value of a key
    Get {
        bucket: String,
        key: String,
    },

    /// Store a key/value pair, creating the bucket if needed
    Put {
        bucket: String,
        key: String,
        value: String,

        /// Create the bucket with sorted duplicates
        #[arg(long)]
        dup_sort: bool,

        /// Fail if the key already exists
        #[arg(long)]
        no_overwrite: bool,
    },

    /// Delete a key, or one of its duplicates
    Del {
        bucket: String,
        key: String,

        /// Only this duplicate value
        value: Option<String>,
    },

    /// Print every entry of a bucket
    Dump {
        bucket: String,

        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,stratakv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("stratakv-cli v{}", stratakv::VERSION);

    let config = Config::builder()
        .path(&args.path)
        .page_size(args.page_size)
        .build();

    let db = match Database::open(config) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open {}: {}", args.path, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&db, args.command) {
        eprintln!("error: {}", e);
        std::process::exit(match e {
            StrataError::NotFound => 2,
            _ => 1,
        });
    }
}

fn run(db: &Database, command: Commands) -> Result<()> {
    match command {
        Commands::Stat { bucket } => {
            let info = db.info();
            println!("path:         {}", db.path().display());
            println!("page size:    {}", info.page_size);
            println!("map size:     {}", info.map_size);
            println!("last page:    {}", info.last_page);
            println!("last txn:     {}", info.last_txnid);
            println!("readers:      {}/{}", info.num_readers, info.max_readers);

            db.view(|txn| {
                println!("free pages:   {}", txn.free_page_count()?);
                let names = match bucket {
                    Some(name) => vec![name],
                    None => txn.bucket_names()?,
                };
                for name in names {
                    let handle = txn.open_bucket(&name)?;
                    let stat = txn.stat(&handle)?;
                    println!(
                        "bucket {:?}: entries={} depth={} branch={} leaf={} overflow={}",
                        name,
                        stat.entries,
                        stat.depth,
                        stat.branch_pages,
                        stat.leaf_pages,
                        stat.overflow_pages
                    );
                }
                Ok(())
            })
        }

        Commands::Buckets => db.view(|txn| {
            for name in txn.bucket_names()? {
                println!("{}", name);
            }
            Ok(())
        }),

        Commands::Get { bucket, key } => db.view(|txn| {
            let handle = txn.open_bucket(&bucket)?;
            let value = txn.get(&handle, key.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&value));
            Ok(())
        }),

        Commands::Put {
            bucket,
            key,
            value,
            dup_sort,
            no_overwrite,
        } => db.update(|txn| {
            let flags = if dup_sort {
                BucketFlags::DUP_SORT
            } else {
                BucketFlags::empty()
            };
            let handle = txn.create_bucket(&bucket, flags)?;
            let put_flags = if no_overwrite {
                PutFlags::NO_OVERWRITE
            } else {
                PutFlags::empty()
            };
            txn.put(&handle, key.as_bytes(), value.as_bytes(), put_flags)
        }),

        Commands::Del { bucket, key, value } => db.update(|txn| {
            let handle = txn.open_bucket(&bucket)?;
            txn.del(&handle, key.as_bytes(), value.as_deref().map(str::as_bytes))
        }),

        Commands::Dump { bucket, limit } => db.view(|txn| {
            let handle = txn.open_bucket(&bucket)?;
            let mut cursor = txn.cursor(&handle)?;
            let limit = limit.unwrap_or(usize::MAX);

            let mut printed = 0;
            let mut entry = cursor.first();
            while printed < limit {
                let (key, value) = match entry {
                    Ok(kv) => kv,
                    Err(StrataError::NotFound) => break,
                    Err(e) => return Err(e),
                };
                println!("{}\t{}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
                printed += 1;
                entry = cursor.next();
            }
            Ok(())
        }),
    }
}
