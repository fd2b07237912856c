#![warn(clippy::unwrap_used)]
#![doc = include_str!("../README.md")]

mod classifier;
mod error;
mod run;
mod sink;
mod workbook;

use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use run::{AmountPolicy, Exporter, RunReport};

/// Splits the Kaspi Pay transaction export found in a directory into one CSV file per payment
/// method, then moves the export to the `processed` directory
#[derive(Debug, Parser)]
struct Args {
    /// Directory holding the export, where the CSV files are written
    #[arg(long, default_value = ".")]
    dir: PathBuf,
    /// Skips rows with an unreadable amount instead of stopping
    #[arg(long)]
    skip_invalid_amounts: bool,
    /// Prints the raw rows found in the spreadsheet
    #[arg(long)]
    print_rows: bool,
    /// One of error, warn, info, debug, trace
    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    log_level: LevelFilter,
}

fn parse_log_level(level: &str) -> Result<LevelFilter, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(format!("invalid log level '{level}'")),
    }
}

fn setup_logging(level: LevelFilter) {
    let terminal_log = fmt::layer()
        .with_target(false)
        .with_writer(stderr)
        .with_filter(level);

    tracing_subscriber::registry().with(terminal_log).init();
}

fn print_report(report: &RunReport) {
    info!(
        "Read {} rows: {} exported, {} from other channels, {} incomplete, {} with an invalid amount, {} lost",
        report.rows_read,
        report.records_written,
        report.skipped_channel,
        report.skipped_short,
        report.skipped_amount,
        report.write_failures
    );
    for bucket in &report.buckets {
        if bucket.lost > 0 {
            warn!("{} records could not be written to {:?}", bucket.lost, bucket.path);
        }
    }
    println!("Export completed successfully!");
    for bucket in &report.buckets {
        println!("{}: {} records in {:?}", bucket.bucket.name(), bucket.written, bucket.path);
    }
    println!("Spreadsheet moved to {:?}", report.archived_to);
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let Args {
        dir,
        skip_invalid_amounts,
        print_rows,
        log_level,
    } = Args::parse();
    setup_logging(log_level);

    let amount_policy = if skip_invalid_amounts {
        AmountPolicy::Skip
    } else {
        AmountPolicy::Abort
    };
    let report = Exporter::new(&dir)
        .amount_policy(amount_policy)
        .print_rows(print_rows)
        .run()
        .with_context(|| format!("Could not export the spreadsheet in {dir:?}"))?;
    print_report(&report);
    Ok(())
}
