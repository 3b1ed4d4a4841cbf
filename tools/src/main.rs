//! r360-runner: headless runner for the R360 relationship key engine.
//!
//! Usage:
//!   r360-runner run --warehouse wh.db --store keys.db --config r360.json
//!   r360-runner run --warehouse wh.db --store keys.db --as-of "2024-06-30 00:00:00" --dry-run
//!   r360-runner attach --store keys.db --mode portfolio --input in.csv --column acctnbr --output out.csv

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use r360_core::{
    engine::{KeyEngine, RunReport},
    publish::{attach_key, Dataset, KeyTable},
    types::{Mode, AS_OF_FORMAT},
    warehouse::WarehouseSource,
    R360Config, SqliteKeyStore,
};
use std::env;
use std::fs::File;
use std::path::Path;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") => run(&args),
        Some("attach") => attach(&args),
        _ => {
            eprintln!("usage: r360-runner <run|attach> [flags]");
            bail!("missing or unknown subcommand")
        }
    }
}

fn run(args: &[String]) -> Result<()> {
    let warehouse = required_flag(args, "--warehouse")?;
    let store_path = flag(args, "--store").unwrap_or("r360_keys.db");
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let json = args.iter().any(|a| a == "--json");

    let mut config = match flag(args, "--config") {
        Some(path) => R360Config::load(path)?,
        None => R360Config::default(),
    };
    if let Some(dir) = flag(args, "--output-dir") {
        config.output_dir = Some(dir.to_string());
    }
    let as_of = match flag(args, "--as-of") {
        Some(raw) => NaiveDateTime::parse_from_str(raw, AS_OF_FORMAT)
            .map_err(|e| anyhow!("--as-of '{raw}' is not \"YYYY-MM-DD HH:MM:SS\": {e}"))?,
        None => chrono::Local::now().naive_local(),
    };

    if !json {
        println!("R360 relationship keys: r360-runner");
        println!("  warehouse:  {warehouse}");
        println!("  store:      {store_path}");
        println!("  as_of:      {}", as_of.format(AS_OF_FORMAT));
        println!("  modes:      {:?}", config.enabled_modes().iter().map(Mode::as_str).collect::<Vec<_>>());
        println!("  output_dir: {}", config.output_dir.as_deref().unwrap_or("(none)"));
        if dry_run {
            println!("  dry run:    nothing will be committed");
        }
        println!();
    }

    let store = SqliteKeyStore::open(store_path)?;
    store.migrate()?;
    let source = WarehouseSource::new(warehouse);
    let mut engine = KeyEngine::new(config, store);

    let report = if dry_run {
        engine.dry_run(&source, as_of)?
    } else {
        engine.run(&source, as_of)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn attach(args: &[String]) -> Result<()> {
    let store_path = required_flag(args, "--store")?;
    let mode: Mode = required_flag(args, "--mode")?.parse().map_err(|e: String| anyhow!(e))?;
    let input = required_flag(args, "--input")?;
    let column = required_flag(args, "--column")?;
    let output = required_flag(args, "--output")?;

    let store = SqliteKeyStore::open(store_path)?;
    store.migrate()?;
    let keys = KeyTable::from_store(&store, mode)?;
    if keys.is_empty() {
        log::warn!("{mode}: no current keys in {store_path}; every row will get a null key");
    }

    let dataset = Dataset::read_csv(Path::new(input))?;
    let joined = attach_key(&dataset, column, &keys)?;
    joined.write_csv(File::create(output)?)?;

    let key_column = mode.key_column();
    let matched = joined.column(&key_column)?.iter().filter(|k| k.is_some()).count();
    println!("Attached {key_column} to {} rows ({matched} matched) -> {output}", joined.rows.len());
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:     {}", report.run_id);
    println!("  as_of:      {}", report.as_of);
    println!("  committed:  {}", report.committed);
    println!("  accounts:   {} ({} inactive skipped)", report.ingest.accounts, report.ingest.inactive_skipped);
    println!("  roles:      {} ({} skipped)", report.ingest.roles, report.ingest.roles_skipped);
    for m in &report.modes {
        println!();
        println!("=== {} ===", m.mode.as_str().to_uppercase());
        println!("  accounts:     {}", m.keys.accounts);
        println!("  unique keys:  {}", m.unique_keys);
        println!("  retained:     {}", m.keys.retained);
        println!("  minted:       {}", m.keys.minted);
        println!("  merged:       {}", m.keys.merged);
        println!("  split:        {}", m.keys.split);
        println!("  retired:      {}", m.keys.retired);
        println!("  largest hub:  {}", m.graph.largest_hub);
        if let Some(path) = &m.export {
            println!("  export:       {}", path.display());
        }
    }
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

fn required_flag<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    flag(args, name).ok_or_else(|| anyhow!("{name} is required"))
}
