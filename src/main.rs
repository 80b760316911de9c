//! chipmark - IC package marking extraction and counterfeit screening
//!
//! Reads the text printed on a chip package, checks it against datasheet
//! reference data and keeps a log of every analysis.

mod analysis;
mod catalog;
mod config;
mod pipeline;
mod storage;
mod vision;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::pipeline::{AnalysisOutcome, Analyzer};
use crate::storage::{AnalysisRecord, Database};

/// chipmark - IC marking OCR and authenticity screening
#[derive(Parser, Debug)]
#[command(name = "chipmark", version)]
#[command(about = "Extract IC package markings from photos and flag likely counterfeits")]
struct Args {
    /// Configuration file (default: config directory config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a photograph of a chip
    Analyze {
        image: PathBuf,
        /// Use precomputed OCR readings (JSON) instead of running engines
        #[arg(long)]
        readings: Option<PathBuf>,
        /// Do not record the result in the analysis log
        #[arg(long)]
        no_save: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify marking text typed in by hand, one argument per line
    Verify {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        no_save: bool,
        #[arg(long)]
        json: bool,
    },
    /// List recent analyses
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only analyses whose part number contains this text
        #[arg(short, long)]
        part: Option<String>,
    },
    /// Show one stored analysis as JSON
    Show { id: i64 },
    /// Summary figures over the analysis log
    Stats,
    /// Datasheet reference catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Write the preprocessed OCR variants of an image
    Preprocess {
        image: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CatalogCommand {
    /// Look a part number up in the catalog
    Lookup { part: String },
    /// Download a catalog file from a URL
    Sync {
        url: String,
        /// Expected SHA-256 of the file
        #[arg(long)]
        sha256: Option<String>,
        /// Where to store it (default: data directory catalog.json)
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    // `config init` must work before any configuration file exists
    if let Command::Config {
        command: ConfigCommand::Init { force },
    } = args.command
    {
        return init_config(args.config.as_deref(), force);
    }

    let config = config::load_or_create_config(args.config.as_deref())?;

    match args.command {
        Command::Analyze {
            image,
            readings,
            no_save,
            json,
        } => {
            let analyzer = build_analyzer(config)?;
            let outcome = match readings {
                Some(path) => {
                    let readings =
                        vision::load_readings(&path, analyzer.config().ocr.default_confidence)?;
                    analyzer.analyze_readings(&image.display().to_string(), &readings)
                }
                None => analyzer.analyze_image(&image)?,
            };
            finish_analysis(&analyzer, &outcome, no_save, json)
        }
        Command::Verify { text, no_save, json } => {
            let analyzer = build_analyzer(config)?;
            let outcome = analyzer.verify_text(&text);
            finish_analysis(&analyzer, &outcome, no_save, json)
        }
        Command::History { limit, part } => {
            let db = open_database(&config)?;
            let records = match part {
                Some(part) => db.find_by_part(&part, limit)?,
                None => db.recent_analyses(limit)?,
            };
            if records.is_empty() {
                println!("No analyses recorded");
            }
            for record in &records {
                print_history_line(record);
            }
            Ok(())
        }
        Command::Show { id } => {
            let db = open_database(&config)?;
            match db.get_analysis(id)? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(())
                }
                None => bail!("No analysis with id {}", id),
            }
        }
        Command::Stats => {
            let stats = open_database(&config)?.stats()?;
            println!("Analyses:           {}", stats.total);
            println!("Authentic:          {}", stats.authentic);
            println!("Not authentic:      {}", stats.not_authentic);
            println!("Average confidence: {:.2}", stats.average_confidence);
            Ok(())
        }
        Command::Catalog { command } => run_catalog_command(&config, command),
        Command::Config { command } => run_config_command(&config, command),
        Command::Preprocess { image, out_dir } => {
            let source = vision::load_image(&image)?;
            let variants = vision::generate_variants(&source, &config.preprocessing)?;
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("Failed to create {:?}", out_dir))?;
            for (kind, path) in vision::write_variants(&variants, &out_dir)? {
                println!("{:<10} {}", kind, path.display());
            }
            Ok(())
        }
    }
}

/// Log to stderr so stdout stays clean for JSON output
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Built-in catalog plus the configured or synced one
fn load_catalog(config: &AppConfig) -> Result<Catalog> {
    let mut catalog = Catalog::builtin();

    let extra = match &config.general.catalog_path {
        Some(path) => Some(path.clone()),
        None => storage::get_data_dir()
            .ok()
            .map(|dir| dir.join(catalog::DEFAULT_CATALOG_FILE))
            .filter(|path| path.exists()),
    };

    if let Some(path) = extra {
        let loaded = Catalog::load(&path).with_context(|| format!("Failed to load catalog {:?}", path))?;
        info!("Merged {} parts from {:?}", loaded.len(), path);
        catalog.merge(loaded);
    }

    Ok(catalog)
}

fn build_analyzer(config: AppConfig) -> Result<Analyzer> {
    let catalog = load_catalog(&config)?;
    let engines = vision::engines_from_config(&config.ocr);
    Analyzer::new(config, catalog, engines)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let path = match &config.general.database_path {
        Some(path) => path.clone(),
        None => storage::default_database_path()?,
    };
    Database::open(&path)
}

fn finish_analysis(analyzer: &Analyzer, outcome: &AnalysisOutcome, no_save: bool, json: bool) -> Result<()> {
    let mut stored_id = None;
    if analyzer.config().general.save_results && !no_save {
        let db = open_database(analyzer.config())?;
        let id = db.insert_analysis(&outcome.to_new_analysis()?)?;
        info!("Saved analysis #{}", id);
        stored_id = Some(id);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        print_outcome(outcome, stored_id);
    }
    Ok(())
}

fn print_outcome(outcome: &AnalysisOutcome, stored_id: Option<i64>) {
    let marking = &outcome.marking;
    let or_dash = |value: Option<&str>| value.unwrap_or("-").to_string();

    println!("Marking:      {}", outcome.fused.texts().join(" | "));
    println!("Part number:  {}", or_dash(marking.part_number.as_deref()));
    println!("Manufacturer: {}", or_dash(marking.manufacturer.as_deref()));
    match &marking.date_code {
        Some(dc) => println!("Date code:    {} (week {} of {})", dc.raw, dc.week, dc.year),
        None => println!("Date code:    -"),
    }
    println!("Lot code:     {}", or_dash(marking.lot_code.as_deref()));
    match &outcome.catalog_match {
        Some(m) => println!(
            "Catalog:      {} by {} ({:?}, {:.0}%)",
            m.record.part_number,
            m.record.manufacturer,
            m.kind,
            m.similarity * 100.0
        ),
        None => println!("Catalog:      no match"),
    }
    println!();
    for finding in &outcome.report.findings {
        println!("  {:>+4}  {}", finding.points, finding.message);
    }
    println!();
    println!("Score: {}/100, verdict: {}", outcome.report.score, outcome.report.verdict);
    if let Some(id) = stored_id {
        println!("Saved as analysis #{}", id);
    }
}

fn print_history_line(record: &AnalysisRecord) {
    println!(
        "#{:<5} {}  {:<16} {:<20} {:>5.2} {}",
        record.id,
        record.timestamp.format("%Y-%m-%d %H:%M"),
        record.part_number.as_deref().unwrap_or("-"),
        record.manufacturer.as_deref().unwrap_or("-"),
        record.confidence,
        if record.is_authentic { "authentic" } else { "not authentic" }
    );
}

fn run_catalog_command(config: &AppConfig, command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::Lookup { part } => {
            let catalog = load_catalog(config)?;
            match catalog.lookup(&part) {
                Some(m) => println!("{}", serde_json::to_string_pretty(&m)?),
                None => {
                    warn!("{} not found in catalog ({} parts)", part, catalog.len());
                    bail!("No catalog entry for {}", part);
                }
            }
            Ok(())
        }
        CatalogCommand::Sync { url, sha256, dest } => {
            let dest = match dest {
                Some(dest) => dest,
                None => storage::get_data_dir()?.join(catalog::DEFAULT_CATALOG_FILE),
            };
            let parts = catalog::sync_catalog(&url, &dest, sha256.as_deref())?;
            println!("Synced {} parts to {}", parts, dest.display());
            Ok(())
        }
    }
}

fn init_config(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => config::default_config_path()?,
    };
    if path.exists() && !force {
        bail!("{:?} already exists; use --force to overwrite", path);
    }
    config::save_config(&AppConfig::default(), &path)
        .with_context(|| format!("Failed to write {:?}", path))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn run_config_command(config: &AppConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init { force } => init_config(None, force),
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}
