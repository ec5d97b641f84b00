//! acldb command-line tool.
//!
//! Loads a schema, opens a sled-backed store, and runs JSON requests
//! against it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;

use acldb_core::{Engine, EngineConfig, Schema, SledBackend, SledConfig};
use acldb_proto::{FilterNode, Operation, Request, RequestOptions};

/// acldb command-line tool
#[derive(Parser, Debug)]
#[command(name = "acldb")]
#[command(version, about = "Run requests against an acldb store")]
struct Args {
    /// Data directory
    #[arg(short = 'd', long, default_value = "./acldb_data")]
    data_dir: PathBuf,

    /// Use a temporary store that is deleted on exit
    #[arg(long)]
    temporary: bool,

    /// Schema definition (JSON)
    #[arg(short = 's', long)]
    schema: PathBuf,

    /// Master key accepted by this process
    #[arg(long)]
    master_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a JSON request read from a file, or stdin with `-`
    Exec {
        #[arg(default_value = "-")]
        request: String,
    },
    /// Show the compiled plan for a filter
    Explain {
        class: String,
        /// Filter tree (JSON)
        #[arg(long)]
        filter: Option<String>,
    },
    /// Stream every visible record of a class as JSON lines
    Dump {
        class: String,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        /// Act as this user instead of anonymously
        #[arg(long)]
        user: Option<String>,
    },
    /// Print the validated schema, builtin classes included
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acldb_core=info,acldb=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let schema = load_schema(&args.schema)?;

    if let Command::Schema = args.command {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let engine = open_engine(&args, schema)?;
    tracing::info!(data_dir = %args.data_dir.display(), temporary = args.temporary, "store opened");

    match args.command {
        Command::Exec { request } => {
            let mut request: Request = serde_json::from_str(&read_input(&request)?)
                .context("malformed request")?;
            if request.options.master_key.is_none() {
                request.options.master_key = args.master_key.clone();
            }
            let response = engine.execute(request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Explain { class, filter } => {
            let mut request = Request::new(Operation::Explain, class);
            if let Some(filter) = filter {
                let filter: FilterNode = serde_json::from_str(&filter).context("malformed filter")?;
                request = request.with_filter(filter);
            }
            if let Some(key) = &args.master_key {
                request = request.as_master(key.clone());
            }
            let response = engine.execute(request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Dump {
            class,
            batch_size,
            user,
        } => {
            let mut request = Request::find(class);
            request.options = match (user, &args.master_key) {
                (Some(user), _) => RequestOptions::user(user),
                (None, Some(key)) => RequestOptions::master(key.clone()),
                (None, None) => RequestOptions::default(),
            };
            let mut batches = engine.each_batch(request, batch_size);
            let mut total = 0usize;
            while let Some(batch) = batches.try_next().await? {
                total += batch.len();
                for record in batch {
                    println!("{}", serde_json::to_string(&record)?);
                }
            }
            tracing::info!(records = total, "dump complete");
        }
        Command::Schema => {}
    }
    Ok(())
}

fn load_schema(path: &Path) -> Result<Schema> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    Schema::from_json(&json).context("invalid schema")
}

fn open_engine(args: &Args, schema: Schema) -> Result<Engine> {
    let sled_config = if args.temporary {
        SledConfig::temporary()
    } else {
        std::fs::create_dir_all(&args.data_dir)
            .with_context(|| format!("failed to create {}", args.data_dir.display()))?;
        SledConfig::new(&args.data_dir)
    };
    let backend = SledBackend::open(&sled_config).context("failed to open store")?;

    let mut config = EngineConfig::new();
    if let Some(key) = &args.master_key {
        config = config.with_master_key(key.clone());
    }
    Ok(Engine::builder(schema)
        .with_backend(Arc::new(backend))
        .with_config(config)
        .build())
}

fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        Ok(input)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("failed to read {source}"))
    }
}
