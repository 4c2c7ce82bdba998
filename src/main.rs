use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, LevelFilter};

use edfbids::{pipeline, RunConfig};

/// Anonymize EDF recordings, match them to a lab-result sheet and write a
/// BIDS dataset.
#[derive(Debug, Parser)]
#[command(name = "edfbids", version, about)]
struct Cli {
    /// Directory searched recursively for EDF files
    input: PathBuf,

    /// BIDS dataset root to create or extend
    bids: PathBuf,

    /// Lab-result sheet (CSV, TSV or an Excel/ODS workbook)
    #[arg(long, env = "EDFBIDS_SHEET")]
    sheet: Option<PathBuf>,

    /// JSON run configuration; command-line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// BIDS task label
    #[arg(long)]
    task: Option<String>,

    /// Skip recordings larger than this many bytes
    #[arg(long)]
    max_file_size: Option<u64>,

    /// Reprocess recordings whose output already exists
    #[arg(long)]
    overwrite: bool,

    /// Restrict channel labels to [A-Za-z0-9_.-] and repair broken ranges
    #[arg(long)]
    sanitize_labels: bool,

    /// Write sub-<code>_scans.tsv with acquisition times
    #[arg(long)]
    write_scans: bool,

    /// Audit table directory (default: <bids>/sourcedata/audit)
    #[arg(long)]
    audit_dir: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig, edfbids::BidsError> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default(),
        };

        config.input_dir = self.input;
        config.bids_dir = self.bids;
        if let Some(sheet) = self.sheet {
            config.clinical_sheet = Some(sheet);
        }
        if let Some(task) = self.task {
            config.task = task;
        }
        if let Some(size) = self.max_file_size {
            config.max_file_size = size;
        }
        if let Some(dir) = self.audit_dir {
            config.audit_dir = Some(dir);
        }
        config.overwrite |= self.overwrite;
        config.sanitize_labels |= self.sanitize_labels;
        config.write_scans |= self.write_scans;
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // RUST_LOG 优先
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let summary = cli.into_config().and_then(|config| pipeline::run(&config));
    match summary {
        Ok(summary) => {
            println!(
                "{} processed: {} anonymized, {} copied unanonymized, {} failed; {} unmatched, {} skipped",
                summary.processed,
                summary.anonymized,
                summary.copied_unanonymized,
                summary.failed,
                summary.unmatched,
                summary.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
