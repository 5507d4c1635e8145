//! evidence-upload CLI - Upload local files into an evidence store.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use evidence_upload::{
    LocalStorage, Session, Snapshot, TaskId, TaskStatus, UploadConfig, UploadFile, UploadTask,
    format_bytes, format_millis,
};

const DEFAULT_DEST: &str = "evidence";

// ============================================================================
// CLI Configuration
// ============================================================================

struct CliConfig {
    files: Vec<PathBuf>,
    dest: PathBuf,
    config_path: Option<PathBuf>,
    concurrency: Option<usize>,
    max_files: Option<usize>,
    accept: Option<String>,
    timeout_secs: Option<u64>,
    json: bool,
}

fn next_value(args: &[String], i: &mut usize, flag: &str) -> String {
    *i += 1;
    if let Some(value) = args.get(*i) {
        value.clone()
    } else {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: {flag} expects a number, got '{value}'");
        std::process::exit(1);
    })
}

fn parse_args() -> CliConfig {
    let args: Vec<_> = env::args().skip(1).collect();

    let mut cli = CliConfig {
        files: Vec::new(),
        dest: PathBuf::from(DEFAULT_DEST),
        config_path: None,
        concurrency: None,
        max_files: None,
        accept: None,
        timeout_secs: None,
        json: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--dest" => {
                cli.dest = PathBuf::from(next_value(&args, &mut i, "--dest"));
            }
            "-c" | "--concurrency" => {
                let v = next_value(&args, &mut i, "--concurrency");
                cli.concurrency = Some(parse_number(&v, "--concurrency"));
            }
            "-m" | "--max-files" => {
                let v = next_value(&args, &mut i, "--max-files");
                cli.max_files = Some(parse_number(&v, "--max-files"));
            }
            "-a" | "--accept" => {
                cli.accept = Some(next_value(&args, &mut i, "--accept"));
            }
            "-t" | "--timeout" => {
                let v = next_value(&args, &mut i, "--timeout");
                cli.timeout_secs = Some(parse_number(&v, "--timeout"));
            }
            "--config" => {
                cli.config_path = Some(PathBuf::from(next_value(&args, &mut i, "--config")));
            }
            "--json" => {
                cli.json = true;
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                cli.files.push(PathBuf::from(arg));
            }
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn print_usage() {
    eprintln!("Usage: evidence-upload [OPTIONS] <file>...");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <file>                 Local file to upload");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d, --dest <DIR>       Storage directory (default: {DEFAULT_DEST})");
    eprintln!("  -c, --concurrency <N>  Concurrent uploads");
    eprintln!("  -m, --max-files <N>    Refuse the batch if it exceeds N files");
    eprintln!("  -a, --accept <PATTERN> Accepted types, e.g. \"image/*,.pdf\"");
    eprintln!("  -t, --timeout <SECS>   Per-upload timeout");
    eprintln!("      --config <FILE>    Config file (default: {})", UploadConfig::default_path().display());
    eprintln!("      --json             Print the final snapshot as JSON");
    eprintln!("  -h, --help             Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG               Log filter, e.g. evidence_upload=debug");
}

/// Loads the config file and applies command-line overrides on top.
fn load_config(cli: &CliConfig) -> evidence_upload::Result<UploadConfig> {
    let mut config = match &cli.config_path {
        Some(path) => UploadConfig::load(path)?,
        None => UploadConfig::load_or_default()?,
    };
    if let Some(n) = cli.concurrency {
        config = config.with_max_concurrent_uploads(n);
    }
    if cli.max_files.is_some() {
        config = config.with_max_files(cli.max_files);
    }
    if let Some(accept) = &cli.accept {
        config = config.with_accept_pattern(accept.clone());
    }
    if let Some(secs) = cli.timeout_secs {
        config = config.with_upload_timeout(Duration::from_secs(secs));
    }
    config.validate()?;
    Ok(config)
}

async fn read_files(paths: &[PathBuf]) -> Vec<UploadFile> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        match UploadFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(e) => eprintln!("{} {}: {e}", style("Skipping").yellow(), path.display()),
        }
    }
    files
}

// ============================================================================
// Progress Bars
// ============================================================================

fn make_progress_bar(task: &UploadTask) -> ProgressBar {
    let bar = ProgressBar::new(task.size_bytes);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} - {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╌"),
    );
    bar.set_message(task.name.clone());
    bar
}

/// One bar per task, driven by session snapshots.
struct SnapshotBars {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl SnapshotBars {
    fn new(hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    fn update(&mut self, snapshot: &Snapshot) {
        for task in &snapshot.tasks {
            let bar = self
                .bars
                .entry(task.id)
                .or_insert_with(|| self.multi.add(make_progress_bar(task)));
            if bar.is_finished() {
                continue;
            }
            bar.set_position(task.size_bytes * u64::from(task.progress_percent) / 100);
            match task.status {
                TaskStatus::Succeeded => {
                    bar.finish_with_message(format!("{} {}", task.name, style("done").green()));
                }
                TaskStatus::Failed => {
                    let reason = task.error.as_ref().map_or("", |e| e.message.as_str());
                    bar.abandon_with_message(format!("{} {reason}", style(&task.name).red()));
                }
                TaskStatus::Cancelled => {
                    bar.abandon_with_message(format!("{} cancelled", task.name));
                }
                TaskStatus::Queued => bar.set_message(format!("{} (queued)", task.name)),
                TaskStatus::Uploading => bar.set_message(task.name.clone()),
            }
        }
    }
}

fn print_summary(snapshot: &Snapshot) {
    let a = &snapshot.analytics;
    println!();
    println!(
        "{} {} uploaded ({}), {} failed",
        style("Done:").bold(),
        style(a.total_succeeded).green(),
        format_bytes(a.total_bytes),
        if a.total_failed > 0 {
            style(a.total_failed).red()
        } else {
            style(a.total_failed).dim()
        }
    );
    if a.total_succeeded > 0 {
        println!(
            "Average upload time: {}",
            format_millis(a.average_upload_time_ms)
        );
    }
    for path in snapshot.succeeded_paths() {
        println!("  {path}");
    }
    for task in snapshot.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
        let reason = task.error.as_ref().map_or("unknown error", |e| e.message.as_str());
        println!("  {} {}: {reason}", style("failed").red(), task.name);
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> evidence_upload::Result<()> {
    env_logger::init();

    let cli = parse_args();
    if cli.files.is_empty() {
        print_usage();
        std::process::exit(1);
    }

    let config = load_config(&cli)?;
    let storage = LocalStorage::new(cli.dest.clone());
    let session = Session::spawn(config, Arc::new(storage))?;

    let files = read_files(&cli.files).await;
    let outcome = match session.enqueue(files, None).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("{} {e}", style("Error:").red().bold());
            session.shutdown().await;
            std::process::exit(1);
        }
    };
    for rejected in &outcome.rejected {
        eprintln!(
            "{} {}: {}",
            style("Rejected").yellow(),
            rejected.name,
            rejected.reason
        );
    }
    if outcome.accepted.is_empty() {
        eprintln!("Nothing to upload.");
        session.shutdown().await;
        std::process::exit(1);
    }

    let mut bars = SnapshotBars::new(cli.json);
    let mut snapshots = session.snapshots();
    let mut last = session.snapshot();
    while let Some(snapshot) = snapshots.next().await {
        bars.update(&snapshot);
        let idle = snapshot.is_idle();
        last = snapshot;
        if idle {
            break;
        }
    }
    session.shutdown().await;

    if cli.json {
        match serde_json::to_string_pretty(&last) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error: failed to encode snapshot: {e}");
                std::process::exit(1);
            }
        }
    } else {
        print_summary(&last);
    }

    if last.has_failures {
        std::process::exit(1);
    }
    Ok(())
}
