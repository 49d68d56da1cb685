//! Binary entry point for the tessera administrative CLI.
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tessera::{
    admin::{
        self, AdminError, AdminOpenOptions, CheckpointReport, LogDump, OpenReport, PageDump,
        StatsReport, VerifyLevel, VerifyReport,
    },
    db::{ArchiveReport, RecoveryReport},
    types::Lsn,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Administrative CLI for tessera stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, value_name = "FILE", help = "TOML file with store options")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override page size (bytes) when creating a store")]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Override page cache size (bytes per table)")]
    cache_size: Option<usize>,

    #[arg(long, global = true, help = "Override log file rollover size (bytes)")]
    log_rollover_size: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Open (creating if needed) a store and print a summary")]
    Open {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Run recovery and report what was replayed")]
    Recover {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Verify page checksums, fragment bookkeeping, and the log")]
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Full,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },

    #[command(about = "Take a checkpoint")]
    Checkpoint {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(subcommand, about = "Dump log records or table pages")]
    Dump(DumpCommand),

    #[command(about = "Remove (or list) log files recovery no longer needs")]
    Archive {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, help = "Only list the files that would be removed")]
        dry_run: bool,
    },

    #[command(about = "Print store statistics")]
    Stats {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum DumpCommand {
    #[command(about = "Decode log records")]
    Log {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, value_name = "FILE/OFFSET", default_value = "0/0", help = "First LSN")]
        from: String,

        #[arg(long, default_value_t = 1000, help = "Maximum records to print")]
        limit: usize,
    },

    #[command(about = "Print the live records of a table's data pages")]
    Pages {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, default_value = "main", help = "Table name")]
        table: String,

        #[arg(long, help = "Single page number")]
        page: Option<u64>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}: {err}", err.kind_name());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TESSERA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> admin::Result<()> {
    let mut opts = build_open_options(&cli.open)?;
    match cli.command {
        Command::Open { dir } => {
            opts.create_if_missing = true;
            let report = admin::open(&dir, &opts)?;
            emit(cli.format, &report, print_open_text)?;
        }
        Command::Recover { dir } => {
            let report = admin::recover(&dir, &opts)?;
            emit(cli.format, &report, print_recovery_text)?;
        }
        Command::Verify { dir, level } => {
            let report = admin::verify(&dir, &opts, level.into())?;
            emit(cli.format, &report, print_verify_text)?;
            if !report.success {
                return Err(AdminError::Core(tessera::types::TesseraError::Corrupt(format!(
                    "{} problem(s) found in {}",
                    report.findings.len(),
                    dir.display()
                ))));
            }
        }
        Command::Checkpoint { dir } => {
            let report = admin::checkpoint(&dir, &opts)?;
            emit(cli.format, &report, print_checkpoint_text)?;
        }
        Command::Dump(DumpCommand::Log { dir, from, limit }) => {
            let from: Lsn = from.parse()?;
            let report = admin::dump_log(&dir, &opts, from, limit)?;
            emit(cli.format, &report, print_log_text)?;
        }
        Command::Dump(DumpCommand::Pages { dir, table, page }) => {
            let report = admin::dump_pages(&dir, &opts, &table, page)?;
            emit(cli.format, &report, print_pages_text)?;
        }
        Command::Archive { dir, dry_run } => {
            let report = admin::archive(&dir, &opts, dry_run)?;
            emit(cli.format, &report, print_archive_text)?;
        }
        Command::Stats { dir } => {
            let report = admin::stats(&dir, &opts)?;
            emit(cli.format, &report, print_stats_text)?;
        }
    }
    Ok(())
}

fn build_open_options(args: &OpenArgs) -> admin::Result<AdminOpenOptions> {
    let mut opts = match &args.config {
        Some(path) => AdminOpenOptions::from_config_file(path)?,
        None => AdminOpenOptions::default(),
    };
    if let Some(page_size) = args.page_size {
        opts.store.page_size = page_size;
    }
    if let Some(cache_size) = args.cache_size {
        opts.store.cache_size = cache_size;
    }
    if let Some(size) = args.log_rollover_size {
        opts.store.log_rollover_size = size;
    }
    opts.store.validate()?;
    Ok(opts)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> admin::Result<()>
where
    T: serde::Serialize,
    F: Fn(&T),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)
                .map_err(|err| AdminError::Message(format!("cannot encode report: {err}")))?;
            println!("{json}");
        }
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn print_open_text(report: &OpenReport) {
    println!("Store {}", report.dir);
    println!(
        "  log: files={} first_lsn={} next_lsn={}",
        report.log_files, report.first_lsn, report.next_lsn
    );
    for (id, name) in &report.tables {
        println!("  table {id}: {name}");
    }
    print_recovery_text(&report.recovery);
}

fn print_recovery_text(report: &RecoveryReport) {
    println!(
        "Recovery: scan_start={} records={} committed={} aborted={} unfinished={} rows_replayed={} stale_released={}",
        report.scan_start,
        report.records_scanned,
        report.committed,
        report.aborted,
        report.unfinished,
        report.rows_replayed,
        report.stale_released
    );
    if let Some(lsn) = report.last_checkpoint {
        println!("  last_checkpoint_end={lsn}");
    }
    if let Some(info) = &report.checkpoint {
        println!("  post-recovery checkpoint begin={} end={}", info.begin, info.end);
    }
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} tables={} pages={} records={} log_records={}",
        report.level,
        report.success,
        report.counts.tables,
        report.counts.pages,
        report.counts.records,
        report.counts.log_records,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_checkpoint_text(report: &CheckpointReport) {
    let info = &report.checkpoint;
    println!(
        "Checkpoint completed in {:.2} ms: begin={} end={} pages_written={} active={}",
        report.duration_ms, info.begin, info.end, info.pages_written, info.active
    );
}

fn print_log_text(report: &LogDump) {
    for entry in &report.records {
        println!(
            "{:>14} {:>6} {:<16} prev={} {}",
            entry.lsn.to_string(),
            entry.txn.to_string(),
            entry.kind,
            entry.prev_lsn,
            entry.detail
        );
    }
    if report.truncated {
        println!("... (limit reached)");
    }
}

fn print_pages_text(report: &PageDump) {
    println!("Table {}", report.table);
    for page in &report.pages {
        println!("  page {} ({} rows)", page.page, page.rows.len());
        for (slot, commit, key, value) in &page.rows {
            println!("    [{slot}] commit={commit} key={key} value={value}");
        }
    }
}

fn print_archive_text(report: &ArchiveReport) {
    let verb = if report.removed { "Removed" } else { "Removable" };
    println!("{verb} {} log file(s) below {}", report.files.len(), report.cutoff);
    for file in &report.files {
        println!("  {}", display(file));
    }
}

fn print_stats_text(report: &StatsReport) {
    let store = &report.store;
    println!(
        "WAL: records={} bytes={} fsyncs={} files={} durable_lsn={} next_lsn={}",
        store.wal.records_appended,
        store.wal.bytes_appended,
        store.wal.fsyncs,
        store.wal.files,
        store.wal.durable_lsn,
        store.wal.next_lsn
    );
    for table in &store.tables {
        println!(
            "Table {} ({}): keys={} hits={} misses={} evictions={} next_page={}",
            table.name,
            table.id,
            table.keys,
            table.pager.hits,
            table.pager.misses,
            table.pager.evictions,
            table.pager.next_page
        );
    }
    println!(
        "Filesystem: dir={} table_bytes={} log_bytes={}",
        report.filesystem.dir, report.filesystem.table_bytes, report.filesystem.log_bytes
    );
}
