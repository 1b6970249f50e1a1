//! # treearchive CLI
//!
//! Command-line front end for the treearchive backup engine.
//!
//! ## Usage
//! ```bash
//! # Back up ./world into ./backups as a parallel .tar.gz
//! treearchive create ./world -o ./backups -f gzip -c "before upgrade"
//!
//! # Use a JSON configuration, overriding the core limit
//! treearchive --config backup.json create ./world -j 2
//!
//! # Check an archive against its status trailer
//! treearchive verify ./backups/2024.06.01_04-00-00.tar.gz
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use treearchive::{
    utils::format_elapsed, verify_archive, ActionInitiator, ArchiveFormat, ArchiveReader, BackupConfig,
    BackupContext, BackupJob, BackupQueue, ErrorHandlingMode, FollowupJob, Host, Notifier,
};

/// treearchive - backup archives with a tree integrity digest
#[derive(Parser)]
#[command(name = "treearchive")]
#[command(version)]
#[command(about = "Archive a directory tree and verify archives against their status trailer")]
#[command(long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a directory
    Create {
        /// Directory to archive
        source: PathBuf,

        /// Directory receiving the archive
        #[arg(short, long, default_value = "backups")]
        output: PathBuf,

        /// Archive format
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,

        /// Compression threads (0 = all cores)
        #[arg(short = 'j', long)]
        cores: Option<i32>,

        /// Exclude paths matching a pattern (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Comment appended to the archive name
        #[arg(short, long)]
        comment: Option<String>,

        /// Keep the partial archive when the job fails
        #[arg(long)]
        lenient: bool,
    },

    /// Verify an archive
    Verify {
        /// Archive to check
        archive: PathBuf,

        /// Archive format (inferred from the extension by default)
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Zip,
    Bzip2,
    Gzip,
    Lzma,
    Tar,
}

impl From<FormatArg> for ArchiveFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Zip => ArchiveFormat::Zip,
            FormatArg::Bzip2 => ArchiveFormat::Bzip2,
            FormatArg::Gzip => ArchiveFormat::Gzip,
            FormatArg::Lzma => ArchiveFormat::Lzma,
            FormatArg::Tar => ArchiveFormat::Tar,
        }
    }
}

/// A plain directory with nothing to quiesce
struct LocalHost {
    source: PathBuf,
    backup_root: PathBuf,
}

impl Host for LocalHost {
    fn source_dir(&self) -> PathBuf {
        self.source.clone()
    }

    fn backup_root(&self) -> PathBuf {
        self.backup_root.clone()
    }

    fn suspend_persistence(&self) -> treearchive::Result<()> {
        debug!("Nothing to suspend for {:?}", self.source);
        Ok(())
    }

    fn resume_persistence(&self) {}

    fn submit_followup(&self, job: FollowupJob) -> treearchive::Result<()> {
        debug!("No retention policy configured; ignoring {:?}", job);
        Ok(())
    }
}

/// Prints notices to the terminal
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn info(&self, _ctx: &BackupContext, message: &str) {
        println!("{} {}", "•".blue(), message);
    }

    fn error(&self, _ctx: &BackupContext, message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    fn broadcast(&self, message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_filter = if cli.verbose { "treearchive=debug" } else { "treearchive=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => BackupConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => BackupConfig::default(),
    };

    match cli.command {
        Commands::Create {
            source,
            output,
            format,
            cores,
            exclude,
            comment,
            lenient,
        } => {
            let mut config = config;
            if let Some(format) = format {
                config.format = format.into();
            }
            if let Some(cores) = cores {
                config.compression_core_count_limit = cores;
            }
            config.file_blacklist.extend(exclude);
            if lenient {
                config.error_handling_mode = ErrorHandlingMode::Lenient;
            }
            cmd_create(source, output, comment, config)
        }
        Commands::Verify { archive, format } => cmd_verify(archive, format),
    }
}

/// Archive a directory through the job queue
fn cmd_create(source: PathBuf, output: PathBuf, comment: Option<String>, config: BackupConfig) -> anyhow::Result<()> {
    if !source.is_dir() {
        bail!("{} is not a directory", source.display());
    }

    println!(
        "{} {} {}",
        "Archiving".blue().bold(),
        source.display().to_string().cyan(),
        format!("({})", config.format).dimmed()
    );

    let ctx = BackupContext::builder()
        .initiator(ActionInitiator::Console)
        .comment(comment)
        .host(Arc::new(LocalHost {
            source,
            backup_root: output,
        }))
        .notifier(Arc::new(ConsoleNotifier))
        .build()?;

    let queue = BackupQueue::new()?;
    let outcome = queue.submit(BackupJob::new(ctx, config))?.wait()?;
    let status = &outcome.report.status;

    println!("\n{} Archive created", "✓".green().bold());
    println!("  Archive: {}", outcome.report.archive.display().to_string().cyan());
    println!("  Files: {}", status.file_count);
    println!("  Size: {} bytes", status.total_size);
    println!(
        "  Threads: {} ({})",
        outcome.core_count,
        if outcome.parallel { "parallel" } else { "sequential" }
    );
    println!("  Digest: {}", status.tree_hash[..16.min(status.tree_hash.len())].yellow());
    println!("  Time: {}", format_elapsed(outcome.report.elapsed));

    if !status.is_complete() {
        println!("\n{} {} files could not be archived:", "!".yellow().bold(), status.broken_files.len());
        for (path, reason) in &status.broken_files {
            println!("  {} {}", path.yellow(), reason.dimmed());
        }
    }

    Ok(())
}

/// Check an archive against its status trailer
fn cmd_verify(archive: PathBuf, format: Option<FormatArg>) -> anyhow::Result<()> {
    let reader = match format {
        Some(format) => ArchiveReader::new(archive, format.into()),
        None => ArchiveReader::open(archive)?,
    };

    println!(
        "{} {}",
        "Verifying".blue().bold(),
        reader.path().display().to_string().cyan()
    );

    let report = verify_archive(reader.path(), reader.format())?;

    println!("\n{}", "Verification Report:".bold());
    println!("  Entries: {}", report.entry_count);
    println!("  Recorded files: {}", report.status.file_count);
    println!(
        "  Digest: {}",
        if report.digest_matches() { "✓ Matches".green() } else { "✗ Mismatch".red() }
    );
    println!(
        "  Status trailer: {}",
        if report.trailer_count == 1 {
            "✓ Present".green()
        } else {
            format!("✗ Found {}", report.trailer_count).red()
        }
    );
    println!("  Written: {} by {}", report.status.finished_at.to_rfc3339(), report.status.initiator);
    if let Some(comment) = &report.status.comment {
        println!("  Comment: {}", comment);
    }
    if !report.status.is_complete() {
        println!(
            "  Files missing at backup time: {}",
            report.status.broken_files.len().to_string().yellow()
        );
    }

    if !report.is_valid() {
        bail!("{} failed verification", reader.path().display());
    }
    Ok(())
}
