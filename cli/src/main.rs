//! snapbak - Command-line interface for the backup engine.
//!
//! Loads one or more backup jobs from a JSON job file, runs them
//! sequentially and reports progress to the console.

use std::cell::Cell;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use engine::{
    BackupEntry, BackupJob, DirectProvider, JobConfig, Progress, ProgressCallback, RunOutcome,
};
use env_logger::{Builder, Env};

/// snapbak - Consistent point-in-time volume backups
#[derive(Parser, Debug)]
#[command(name = "snapbak")]
#[command(version = "0.1.0")]
#[command(about = "Back up live volumes into streaming zip archives")]
struct Args {
    /// Backup job configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    job: PathBuf,

    /// Ask for confirmation before each job
    #[arg(long, short = 'i')]
    interactive: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// CLI implementation of ProgressCallback for displaying backup progress
struct CliProgress {
    verbose: bool,
    last_update: Cell<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            last_update: Cell::new(Instant::now()),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let filled = (percent / 5) as usize;
        let empty = 20 - filled.min(20);
        format!("[{}{}] {}%", "=".repeat(filled.min(20)), " ".repeat(empty), percent)
    }
}

impl ProgressCallback for CliProgress {
    fn on_run_started(&self, config: &JobConfig) {
        eprintln!("Preparing backup `{}`...", config.name);
        for source in &config.sources {
            eprintln!("  Source: {}", source.display());
        }
        eprintln!("  Target: {}", config.target.display());
        eprintln!(
            "  Mode: {}",
            if config.incremental { "incremental" } else { "full" }
        );
        eprintln!();
    }

    fn on_entries_collected(&self, count: usize, total_bytes: u64) {
        eprintln!(
            "Collected {} entries ({})",
            count,
            Self::format_bytes(total_bytes)
        );
    }

    fn on_entry_started(&self, index: usize, count: usize, entry: &BackupEntry) {
        if self.verbose {
            eprintln!(
                "[{:4}/{}] Compressing: {}",
                index + 1,
                count,
                entry.real_path.display()
            );
        }
    }

    fn on_entry_excluded(&self, real_path: &Path) {
        if self.verbose {
            eprintln!("Excluded: {}", real_path.display());
        }
    }

    fn on_progress(&self, progress: Progress) {
        // Throttle progress updates to avoid spam (max once per 200ms)
        if self.last_update.get().elapsed().as_millis() < 200 {
            return;
        }
        self.last_update.set(Instant::now());

        let percent = (progress.fraction() * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{}",
            Self::progress_bar(percent),
            Self::format_bytes(progress.written()),
            Self::format_bytes(progress.total())
        );
        let _ = std::io::stderr().flush();
    }

    fn on_run_completed(&self, outcome: &RunOutcome, elapsed: Duration) {
        eprintln!();
        match outcome {
            RunOutcome::Success => eprintln!("Done!"),
            RunOutcome::Cancelled => eprintln!("Backup cancelled."),
            RunOutcome::Failed(e) => eprintln!("Backup failed: {}", e),
        }
        eprintln!("Completed in: {}", Self::format_duration(elapsed));
    }
}

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    let args = Args::parse();

    let exit_code = match run_cli(&args) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(msg) => {
            log::error!("{}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability.
///
/// `Ok(true)` means every job succeeded; `Ok(false)` means at least one job
/// failed or was cancelled; `Err` means the job file could not be used.
fn run_cli(args: &Args) -> Result<bool, String> {
    let configs = JobConfig::load_file(&args.job).map_err(|e| e.to_string())?;

    if configs.len() > 1 {
        eprintln!("`{}` contains multiple backup jobs.", args.job.display());
    }

    let mut all_ok = true;
    for config in configs {
        if args.interactive && !confirm(&config.name)? {
            eprintln!("Backup cancelled.");
            continue;
        }

        let target = config.target.clone();
        let mut job =
            BackupJob::new(config, Box::new(DirectProvider)).map_err(|e| e.to_string())?;

        let progress = CliProgress::new(args.verbose);
        match job.run(Some(&progress)) {
            RunOutcome::Success => {
                eprintln!("Backup file: {}", target.display());
            }
            RunOutcome::Cancelled | RunOutcome::Failed(_) => {
                all_ok = false;
            }
        }
    }

    Ok(all_ok)
}

fn confirm(name: &str) -> Result<bool, String> {
    loop {
        eprint!("Start the backup `{}`? (y/n): ", name);
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .map_err(|e| format!("could not read answer: {}", e))?;

        match answer.trim().to_lowercase().as_str() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => continue,
        }
    }
}
