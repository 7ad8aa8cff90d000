//! Jobstore CLI - admin tool for the job document store
//!
//! Connection settings come from `JOBSTORE_*` variables (a `.env` file in
//! the working directory is loaded first), overridable by flags.
//!
//! ## Commands
//!
//! - `init`: provision every repository's indexes
//! - `count`: count documents of a collection matching a filter
//! - `find`: print matching documents as JSON
//! - `watch`: tail inserts and updates of a collection until Ctrl-C
//! - `purge-job`: delete a job with its tasks and trigger tree

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobstore::{
    Backend, Database, FetchAllOptions, Fields, InitOptions, Query, Sort, SortOrder, StoreConfig,
};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "jobstore")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admin tool for the job document store", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Store backend (memory | surreal), overrides JOBSTORE_BACKEND
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// Store endpoint, overrides JOBSTORE_URL
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision indexes for every collection
    Init,

    /// Count documents
    Count {
        collection: String,

        /// Filter document (JSON)
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Print matching documents
    Find {
        collection: String,

        /// Filter document (JSON)
        #[arg(short, long)]
        filter: Option<String>,

        /// Sort keys as `field` or `field:desc`, repeatable
        #[arg(short, long)]
        sort: Vec<String>,

        /// Maximum number of documents (0 = all)
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Comma-separated fields to include
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },

    /// Tail inserts and updates until interrupted
    Watch {
        collection: String,

        /// Match stage over the change event (JSON), e.g. {"fullDocument.jobId": "j1"}
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Delete a job with its tasks and trigger tree
    PurgeJob { job_id: String },
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = StoreConfig::from_env().context("Invalid JOBSTORE_* configuration")?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    Ok(config)
}

fn parse_filter(filter: Option<&str>) -> Result<Query> {
    let Some(raw) = filter else {
        return Ok(Query::all());
    };
    let value: Value = serde_json::from_str(raw).context("Filter is not valid JSON")?;
    Ok(Query::try_from(value)?)
}

fn parse_sort(keys: &[String]) -> Result<Sort> {
    let mut sort = Sort::new();
    for key in keys {
        let (field, order) = match key.split_once(':') {
            None => (key.as_str(), SortOrder::Asc),
            Some((field, "asc")) => (field, SortOrder::Asc),
            Some((field, "desc")) => (field, SortOrder::Desc),
            Some((_, other)) => bail!("unknown sort order '{other}' in '{key}'"),
        };
        sort = sort.by(field, order);
    }
    Ok(sort)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(&cli)?;
    let create_indices = matches!(cli.command, Commands::Init);
    let db = Database::init(&config, InitOptions { create_indices })
        .await
        .with_context(|| format!("Failed to connect to {} store at {}", config.backend, config.url))?;

    let outcome = match cli.command {
        Commands::Init => {
            println!("Indexes provisioned on {} ({})", config.url, config.backend);
            Ok(())
        }
        Commands::Count { collection, filter } => {
            cmd_count(&db, &collection, filter.as_deref()).await
        }
        Commands::Find {
            collection,
            filter,
            sort,
            limit,
            fields,
        } => cmd_find(&db, &collection, filter.as_deref(), &sort, limit, fields).await,
        Commands::Watch { collection, filter } => {
            cmd_watch(&db, &collection, filter.as_deref()).await
        }
        Commands::PurgeJob { job_id } => cmd_purge_job(&db, &job_id).await,
    };

    db.close(false).await.context("Failed to close store")?;
    outcome
}

async fn cmd_count(db: &Database, collection: &str, filter: Option<&str>) -> Result<()> {
    let query = parse_filter(filter)?;
    let count = db.collection(collection).count(&query).await?;
    println!("{count}");
    Ok(())
}

async fn cmd_find(
    db: &Database,
    collection: &str,
    filter: Option<&str>,
    sort: &[String],
    limit: usize,
    fields: Vec<String>,
) -> Result<()> {
    let options = FetchAllOptions {
        query: parse_filter(filter)?,
        fields: (!fields.is_empty()).then(|| Fields::include(fields)),
        sort: parse_sort(sort)?,
        limit,
        ..Default::default()
    };
    let docs = db.collection(collection).fetch_all(options).await?;
    for doc in &docs {
        println!("{}", serde_json::to_string(doc)?);
    }
    info!(count = docs.len(), "documents printed");
    Ok(())
}

async fn cmd_watch(db: &Database, collection: &str, filter: Option<&str>) -> Result<()> {
    let stages = match filter {
        Some(raw) => vec![parse_filter(Some(raw))?],
        None => Vec::new(),
    };
    let subscription = db
        .collection(collection)
        .watch(stages, |notice| {
            let line = serde_json::json!({
                "operationType": notice.operation.as_str(),
                "fullDocument": notice.document,
                "updatedFields": notice.updated_fields,
                "removedFields": notice.removed_fields,
            });
            println!("{line}");
        })
        .await?;
    info!(%collection, "watching, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    subscription.close().await;
    Ok(())
}

async fn cmd_purge_job(db: &Database, job_id: &str) -> Result<()> {
    let outcome = db.purge_job(job_id).await?;
    println!(
        "Purged job {job_id}: {} task(s), {} trigger tree(s)",
        outcome.tasks, outcome.trigger_trees
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_keys_parse_with_optional_order() {
        let sort = parse_sort(&["name".to_string(), "startTime:desc".to_string()]).unwrap();
        assert_eq!(sort, Sort::new().asc("name").desc("startTime"));
        assert!(parse_sort(&["name:sideways".to_string()]).is_err());
    }

    #[test]
    fn filter_must_be_an_object() {
        assert!(parse_filter(None).unwrap().is_empty());
        let query = parse_filter(Some(r#"{"jobId": "j1"}"#)).unwrap();
        assert_eq!(query, Query::eq("jobId", "j1"));
        assert!(parse_filter(Some("[1, 2]")).is_err());
        assert!(parse_filter(Some("{not json")).is_err());
    }

    #[test]
    fn cli_parses_find_arguments() {
        let cli = Cli::try_parse_from([
            "jobstore", "--backend", "memory", "find", "jobs", "--sort", "startTime:desc",
            "--fields", "jobId,status",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(Backend::Memory));
        match cli.command {
            Commands::Find { collection, sort, fields, limit, .. } => {
                assert_eq!(collection, "jobs");
                assert_eq!(sort, vec!["startTime:desc"]);
                assert_eq!(fields, vec!["jobId", "status"]);
                assert_eq!(limit, 20);
            }
            _ => panic!("expected find"),
        }
    }
}
