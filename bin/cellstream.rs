use anyhow::{anyhow, Context};
use bytes::Bytes;
use cellstream::config::Config;
use cellstream::predict::SohClient;
use cellstream::records::SqliteRecordStore;
use cellstream::registry::SqliteRegistry;
use cellstream::sim::{ChannelSpec, InfluxSink, MemorySink, SeriesSink, SimulationEngine};
use cellstream::store::LocalObjectStore;
use cellstream::{Ingestor, Upload};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("cellstream")
        .about("Battery-test CSV ingestion, SOH prediction and live replay")
        .subcommand_required(true)
        .subcommand(
            Command::new("draft")
                .about("Store a CSV upload and print its draft statistics")
                .arg(Arg::new("file").required(true).value_parser(clap::value_parser!(PathBuf)))
                .arg(Arg::new("content-type").long("content-type").help("Declared content type, e.g. \"text/csv; charset=gbk\"")),
        )
        .subcommand(
            Command::new("import")
                .about("Import a drafted upload into a ledger entry")
                .arg(Arg::new("token").required(true))
                .arg(Arg::new("ledger-id").long("ledger-id").required(true).value_parser(clap::value_parser!(i64))),
        )
        .subcommand(
            Command::new("predict")
                .about("Predict SOH for one cycle of a drafted upload")
                .arg(Arg::new("token").required(true))
                .arg(Arg::new("cycle").long("cycle").required(true).value_parser(clap::value_parser!(i64))),
        )
        .subcommand(
            Command::new("status")
                .about("Show the registry entry for an upload token")
                .arg(Arg::new("token").required(true)),
        )
        .subcommand(
            Command::new("simulate")
                .about("Replay CSV files as live series until done or Ctrl-C")
                .arg(
                    Arg::new("channel")
                        .long("channel")
                        .help("PATH=TARGET_ID, repeatable")
                        .action(ArgAction::Append)
                        .required(true),
                )
                .arg(Arg::new("dry-run").long("dry-run").help("Keep points in memory instead of writing to InfluxDB").action(ArgAction::SetTrue)),
        )
}

fn parse_channel(raw: &str) -> anyhow::Result<ChannelSpec> {
    let (path, target) = raw
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("channel must be PATH=TARGET_ID, got {raw:?}"))?;
    if path.is_empty() || target.is_empty() {
        return Err(anyhow!("channel must be PATH=TARGET_ID, got {raw:?}"));
    }
    Ok(ChannelSpec::new(path, target))
}

fn ingestor(config: &Config) -> anyhow::Result<Ingestor> {
    let registry = SqliteRegistry::open(&config.db_path).context("open upload registry")?;
    let records = SqliteRecordStore::open(&config.db_path).context("open record store")?;
    Ok(Ingestor::new(
        Arc::new(LocalObjectStore::new(&config.data_dir)),
        Arc::new(registry),
        Arc::new(records),
        config.import,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("draft", m)) => {
            let path = m.get_one::<PathBuf>("file").ok_or_else(|| anyhow!("file is required"))?;
            let body = tokio::fs::read(path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            let upload = Upload {
                file_name: path.file_name().and_then(|s| s.to_str()).map(str::to_string),
                content_type: m.get_one::<String>("content-type").cloned(),
                body: Bytes::from(body),
            };
            let draft = ingestor(&config)?.draft(upload).await?;
            println!("{}", serde_json::to_string_pretty(&draft)?);
        }
        Some(("import", m)) => {
            let token = m.get_one::<String>("token").ok_or_else(|| anyhow!("token is required"))?;
            let ledger_id = *m.get_one::<i64>("ledger-id").ok_or_else(|| anyhow!("ledger-id is required"))?;
            let tally = ingestor(&config)?.import(token, ledger_id).await?;
            println!("{}", serde_json::to_string_pretty(&tally)?);
        }
        Some(("predict", m)) => {
            let token = m.get_one::<String>("token").ok_or_else(|| anyhow!("token is required"))?;
            let cycle = *m.get_one::<i64>("cycle").ok_or_else(|| anyhow!("cycle is required"))?;
            let client = SohClient::new(&config.predictor_url)?;
            let prediction = ingestor(&config)?.predict(token, cycle, &client).await?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Some(("status", m)) => {
            let token = m.get_one::<String>("token").ok_or_else(|| anyhow!("token is required"))?;
            let entry = ingestor(&config)?.status(token)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Some(("simulate", m)) => {
            let specs = m
                .get_many::<String>("channel")
                .into_iter()
                .flatten()
                .map(|raw| parse_channel(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            for spec in &specs {
                if !spec.path.exists() {
                    return Err(anyhow!("no such file: {}", spec.path.display()));
                }
            }

            let sink: Arc<dyn SeriesSink> = match (&config.influx, m.get_flag("dry-run")) {
                (Some(influx), false) => Arc::new(InfluxSink::new(influx.clone())?),
                (None, false) => {
                    warn!("INFLUX_URL not set, keeping points in memory");
                    Arc::new(MemorySink::new())
                }
                (_, true) => Arc::new(MemorySink::new()),
            };
            let engine = Arc::new(SimulationEngine::new(sink, config.simulation.clone()));
            let handles = engine.launch_all(specs);
            info!(channels = handles.len(), "simulation running, Ctrl-C to stop");

            let stopper = Arc::clone(&engine);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop();
                }
            });

            for handle in handles {
                let report = handle.await?;
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        _ => unreachable!("subcommand_required"),
    }
    Ok(())
}
