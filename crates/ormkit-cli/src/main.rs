//! ormkit demo command.
//!
//! Stores a book with its chapters through one session, reads it back
//! through a fresh one, and prints the serialized graph.

mod library;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use ormkit_core::{SessionConfig, SledBackend, StorageConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// ormkit demo
#[derive(Parser, Debug)]
#[command(name = "ormkit")]
#[command(version, about = "Store and serialize a sample book graph with ormkit")]
pub struct Args {
    /// Data directory; a temporary database is used when omitted
    #[arg(short = 'd', long)]
    pub data_path: Option<PathBuf>,

    /// Book id to store and read back
    #[arg(long, default_value_t = 1)]
    pub book_id: i32,

    /// Maximum cascade depth for removals
    #[arg(long, default_value_t = ormkit_core::session::DEFAULT_MAX_CASCADE_DEPTH)]
    pub max_cascade_depth: usize,

    /// Remove the book (and its chapters) after printing it
    #[arg(long)]
    pub remove: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ormkit_cli=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let storage = match &args.data_path {
        Some(path) => StorageConfig::new(path),
        None => StorageConfig::temporary(),
    };
    let session = SessionConfig::new().with_max_cascade_depth(args.max_cascade_depth);

    let registry = Arc::new(library::registry()?);
    let backend = Arc::new(SledBackend::open(&storage, Arc::clone(&registry))?);
    tracing::info!(
        path = %storage.path.display(),
        temporary = storage.temporary,
        "opened storage"
    );

    let report = library::run(registry, backend, session, args.book_id, args.remove)?;
    let output = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", output);
    Ok(())
}
