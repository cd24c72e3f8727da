use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use filmwatch::utils::{RecordFilter, RecordStats};
use filmwatch::{JsonSource, NoveltyTracker, ScrapeCycle};
use log::LevelFilter;

#[derive(Parser)]
#[command(name = "filmwatch")]
#[command(about = "Tracks when scraped films were first seen", long_about = None)]
struct Cli {
    #[arg(
        short = 'l',
        long = "log-level",
        value_enum,
        default_value = "info",
        global = true,
        help = "Set the logging level"
    )]
    log_level: LogLevel,

    #[arg(
        long,
        env = "FILMWATCH_DB",
        default_value = filmwatch::DEFAULT_DB_PATH,
        global = true,
        help = "Path to the seen store (SQLite)"
    )]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scrape cycle from a JSON list of observations and report new slugs
    Record {
        #[arg(
            short = 'i',
            long,
            value_name = "FILE",
            help = "JSON observations file (reads stdin when omitted)"
        )]
        input: Option<PathBuf>,

        #[arg(
            long,
            value_name = "RFC3339",
            help = "Cycle timestamp for observations without one (defaults to now)",
            value_parser = |s: &str| DateTime::parse_from_rfc3339(s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| e.to_string()),
        )]
        at: Option<DateTime<Utc>>,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// List first-seen records, oldest first, with optional filtering and pagination
    List {
        #[arg(
            long,
            help = "Maximum number of results to return",
            value_parser = clap::value_parser!(u16).range(1..)
        )]
        limit: Option<u16>,

        #[arg(
            long,
            help = "Number of results to skip from the beginning"
        )]
        offset: Option<u16>,

        #[arg(
            long,
            value_name = "YYYY-MM-DD",
            help = "Only slugs first seen on or after this date",
            value_parser = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| e.to_string()),
        )]
        since: Option<NaiveDate>,

        #[arg(
            long,
            value_name = "YYYY-MM-DD",
            help = "Only slugs first seen on or before this date",
            value_parser = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| e.to_string()),
        )]
        until: Option<NaiveDate>,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// Open the seen store, verify its schema and print the record count
    Check,
}

fn serialize_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}

async fn open_or_exit(db: &Path) -> NoveltyTracker {
    NoveltyTracker::open(db).await.unwrap_or_else(|e| {
        log::error!("Error opening seen store {}: {}", db.display(), e);
        process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.clone().into())
        .init();

    match cli.command {
        Commands::Record { input, at, format } => {
            let reader: Box<dyn Read> = match &input {
                Some(path) => Box::new(File::open(path).unwrap_or_else(|e| {
                    log::error!("Error opening {}: {}", path.display(), e);
                    process::exit(1);
                })),
                None => Box::new(io::stdin()),
            };

            let tracker = match NoveltyTracker::open(&cli.db).await {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    log::warn!("Seen store {} unusable: {}", cli.db.display(), e);
                    None
                }
            };

            let cycle = ScrapeCycle::new(at.unwrap_or_else(Utc::now));
            let report = cycle
                .run(tracker.as_ref(), &mut JsonSource::new(reader))
                .await
                .unwrap_or_else(|e| {
                    log::error!("Error reading observations: {}", e);
                    process::exit(1);
                });

            if let Some(tracker) = &tracker {
                tracker.close().await;
            }

            match format {
                OutputFormat::Json => serialize_json(&report),
                OutputFormat::Text => print!("{}", report),
            }
        }

        Commands::List {
            limit,
            offset,
            since,
            until,
            format,
        } => {
            let filter = RecordFilter {
                since,
                until,
                limit: limit.map(usize::from),
                offset: offset.map(usize::from),
            };

            let filter = filter.validate().unwrap_or_else(|e| {
                log::error!("Invalid args: {e}");
                process::exit(1);
            });

            let tracker = open_or_exit(&cli.db).await;
            let records = tracker.list_all().await.unwrap_or_else(|e| {
                log::error!("Error listing seen records: {}", e);
                process::exit(1);
            });
            tracker.close().await;

            let records = filter.apply(records);

            match format {
                OutputFormat::Json => serialize_json(&records),
                OutputFormat::Text => {
                    if records.is_empty() {
                        println!("No entries to display.");
                    } else {
                        for (i, record) in records.iter().enumerate() {
                            println!("{:>3}. {}", i + 1, record);
                        }
                        print!("{}", RecordStats::from_records(&records));
                    }
                }
            }
        }

        Commands::Check => {
            let tracker = open_or_exit(&cli.db).await;
            let count = tracker.count().await.unwrap_or_else(|e| {
                log::error!("Error reading seen store: {}", e);
                process::exit(1);
            });
            tracker.close().await;

            println!("{}: ok, {} slug(s) tracked", cli.db.display(), count);
        }
    }
}
