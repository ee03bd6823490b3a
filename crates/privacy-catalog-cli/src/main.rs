use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use privacy_catalog_api::{CatalogConfig, PrivacyCatalogApi};
use privacy_catalog_core::{Entity, EntityKind, IngestPolicy};
use privacy_catalog_store_sqlite::SCHEMA_VERSION;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pcat")]
#[command(about = "Android privacy catalogue CLI")]
struct Cli {
    #[arg(long, default_value = "./privacy_catalog.sqlite3")]
    db: PathBuf,

    /// YAML catalogue config; built-in defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Ingest(IngestArgs),
    App {
        #[command(subcommand)]
        command: Box<AppCommand>,
    },
    Rank {
        #[command(subcommand)]
        command: Box<RankCommand>,
    },
    Az {
        #[command(subcommand)]
        command: Box<AzCommand>,
    },
    Metrics {
        #[command(subcommand)]
        command: Box<MetricsCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Init,
    SchemaVersion,
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
    /// Accept only these entity tags; overrides the configured allowlist.
    #[arg(long = "only")]
    only: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum AppCommand {
    List,
    Show(HashArgs),
    Latest(PackageArgs),
    Versions(PackageArgs),
    Provenance(HashArgs),
}

#[derive(Debug, Args)]
struct HashArgs {
    #[arg(long)]
    hash: String,
}

#[derive(Debug, Args)]
struct PackageArgs {
    #[arg(long)]
    package: String,
}

#[derive(Debug, Subcommand)]
enum RankCommand {
    Show {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum AzCommand {
    Show {
        #[arg(long)]
        hash: String,
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum MetricsCommand {
    Run,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => CatalogConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => CatalogConfig::default(),
    };
    let api = PrivacyCatalogApi::with_config(cli.db, config);

    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Ingest(args) => run_ingest(&args, &api),
        Command::App { command } => run_app(&command, &api),
        Command::Rank { command } => run_rank(&command, &api),
        Command::Az { command } => run_az(&command, &api),
        Command::Metrics { command } => run_metrics(&command, &api),
    }
}

fn run_db(command: &DbCommand, api: &PrivacyCatalogApi) -> Result<()> {
    match command {
        DbCommand::Init => {
            let version = api.migrate()?;
            emit_json(serde_json::json!({ "schema_version": version }))
        }
        DbCommand::SchemaVersion => {
            let version = api.schema_version()?;
            emit_json(serde_json::json!({
                "schema_version": version,
                "target_version": SCHEMA_VERSION,
                "up_to_date": version == SCHEMA_VERSION
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_ingest(args: &IngestArgs, api: &PrivacyCatalogApi) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let report = if args.only.is_empty() {
        api.ingest(&text)?
    } else {
        let kinds = args
            .only
            .iter()
            .map(|tag| EntityKind::parse(tag).ok_or_else(|| anyhow!("unknown entity tag: {tag}")))
            .collect::<Result<Vec<_>>>()?;
        api.ingest_with_policy(&text, &IngestPolicy::only(kinds))?
    };
    emit_json(serde_json::to_value(&report).context("failed to serialize ingest report")?)
}

fn run_app(command: &AppCommand, api: &PrivacyCatalogApi) -> Result<()> {
    match command {
        AppCommand::List => emit_json(serde_json::json!({ "app_hashes": api.app_hashes()? })),
        AppCommand::Show(args) => {
            let app = api.app(&args.hash)?.ok_or_else(|| anyhow!("app not found: {}", args.hash))?;
            emit_json(serde_json::json!({ "app": Entity::App(app).encode() }))
        }
        AppCommand::Latest(args) => {
            let app = api
                .latest_app(&args.package)?
                .ok_or_else(|| anyhow!("no app matches package: {}", args.package))?;
            emit_json(serde_json::json!({ "app": Entity::App(app).encode() }))
        }
        AppCommand::Versions(args) => {
            let versions: Vec<Value> = api
                .app_versions(&args.package)?
                .into_iter()
                .map(|(hash, version_name)| {
                    serde_json::json!({ "hash": hash, "version_name": version_name })
                })
                .collect();
            emit_json(serde_json::json!({ "package": args.package, "versions": versions }))
        }
        AppCommand::Provenance(args) => {
            let metadata: Vec<Value> = api
                .extraction_metadata(&args.hash)?
                .into_iter()
                .map(|meta| Entity::ExtractionMetadata(meta).encode())
                .collect();
            emit_json(serde_json::json!({ "app_hash": args.hash, "extraction_metadata": metadata }))
        }
    }
}

fn run_rank(command: &RankCommand, api: &PrivacyCatalogApi) -> Result<()> {
    match command {
        RankCommand::Show { name } => {
            let rank =
                api.privacy_rank(name)?.ok_or_else(|| anyhow!("privacy rank not found: {name}"))?;
            emit_json(serde_json::json!({ "privacy_rank": Entity::PrivacyRank(rank).encode() }))
        }
    }
}

fn run_az(command: &AzCommand, api: &PrivacyCatalogApi) -> Result<()> {
    match command {
        AzCommand::Show { hash, date } => {
            let snapshots: Vec<Value> = api
                .az_metadata(hash, date.as_deref())?
                .into_iter()
                .map(|meta| Entity::AzMetadata(meta).encode())
                .collect();
            emit_json(serde_json::json!({ "app_hash": hash, "az_metadata": snapshots }))
        }
    }
}

fn run_metrics(command: &MetricsCommand, api: &PrivacyCatalogApi) -> Result<()> {
    match command {
        MetricsCommand::Run => {
            let report = api.run_metrics()?;
            for summary in &report.metrics {
                if let Some(failure) = &summary.failure {
                    tracing::warn!("metric {} failed: {failure}", summary.name);
                }
            }
            emit_json(serde_json::to_value(&report).context("failed to serialize engine report")?)
        }
    }
}
