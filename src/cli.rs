// PackCam CLI binary

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use packcam_lib::clock::{parse_user_time, CanonicalTime, Clock, SystemClock};
use packcam_lib::config::JsonConfigFile;
use packcam_lib::db::schema::{self, EventQuery, FileJob, JobStatus};
use packcam_lib::db::{get_default_db_path, open_db};
use packcam_lib::ingest::{Discoverer, DiscoveryRequest, ScanReport};
use packcam_lib::jobs::{self, progress, JobOutcome};
use packcam_lib::metadata::FfprobeCreationTime;
use packcam_lib::scheduler::Scheduler;

/// How often `run` logs a progress line while waiting for Ctrl-C.
const PROGRESS_LOG_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "packcam")]
#[command(about = "PackCam - packing events from warehouse camera footage", long_about = None)]
#[command(version)]
struct Cli {
    /// Log as JSON lines instead of plain text
    #[arg(long, global = true)]
    json: bool,

    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Config file (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Backfill this many days before switching to continuous scanning
        #[arg(long)]
        backfill_days: Option<u32>,
    },

    /// Run one discovery pass and enqueue what it finds
    Scan {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        backfill_days: Option<u32>,
        /// Only scan these cameras (repeatable)
        #[arg(long = "camera")]
        cameras: Vec<String>,
    },

    /// Process a file or directory right now
    Process {
        /// Video file, or a directory of video files
        path: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
        /// Camera id, when the path is not under a configured camera root
        #[arg(long)]
        camera: Option<String>,
    },

    /// List queued files
    Jobs {
        /// Filter by status (pending, processing, done, failed)
        #[arg(long)]
        status: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show queue progress
    Progress,

    /// Requeue or fail jobs stuck in processing past the timeout
    Reclaim {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Look up packing events
    Events {
        #[arg(long)]
        camera: Option<String>,
        /// Lower bound, e.g. 2024-03-10 or 2024-03-10T14:00:00
        #[arg(long)]
        from: Option<String>,
        /// Upper bound
        #[arg(long)]
        to: Option<String>,
        /// Tracking code
        #[arg(long)]
        code: Option<String>,
        /// Config file, used for the site timezone of --from/--to
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "100")]
        limit: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let db_path = cli.db.unwrap_or_else(get_default_db_path);

    match cli.command {
        Commands::Run { config, backfill_days } => cmd_run(&db_path, config, backfill_days),
        Commands::Scan { config, backfill_days, cameras } => cmd_scan(&db_path, &config, backfill_days, cameras),
        Commands::Process { path, config, camera } => cmd_process(&db_path, config, &path, camera),
        Commands::Jobs { status, limit } => cmd_jobs(&db_path, status, limit),
        Commands::Progress => cmd_progress(&db_path),
        Commands::Reclaim { config } => cmd_reclaim(&db_path, &config),
        Commands::Events { camera, from, to, code, config, limit } => {
            cmd_events(&db_path, camera, from, to, code, config, limit)
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    // The library logs through `log`; try_init also installs the bridge.
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Logging not initialised: {}", e);
    }
}

fn cmd_run(db_path: &Path, config: PathBuf, backfill_days: Option<u32>) -> Result<()> {
    let scheduler = Scheduler::builder(db_path, Arc::new(JsonConfigFile::new(config))).build()?;

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })?;

    scheduler.start(first_request(backfill_days))?;
    println!("Scheduler running. Press Ctrl-C to stop.");

    loop {
        match rx.recv_timeout(Duration::from_secs(PROGRESS_LOG_SECS)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                let p = scheduler.get_progress()?;
                log::info!(
                    "Progress: {} pending, {} processing, {} done, {} failed ({} this run)",
                    p.pending, p.processing, p.done, p.failed, p.processed_this_run
                );
            }
        }
    }

    println!("Stopping, waiting for in-flight jobs...");
    scheduler.stop()?;

    let p = scheduler.get_progress()?;
    println!("Processed {} file(s) this run.", p.processed_this_run);
    Ok(())
}

fn cmd_scan(db_path: &Path, config_path: &Path, backfill_days: Option<u32>, cameras: Vec<String>) -> Result<()> {
    let config = JsonConfigFile::load(config_path)?;
    let conn = open_db(db_path)?;

    let creation = FfprobeCreationTime;
    let clock = SystemClock;
    let report = Discoverer::new(&config, &creation, &clock)
        .with_cameras(&cameras)
        .discover(&conn, &first_request(backfill_days))?;

    print_scan_report(&report);
    Ok(())
}

fn cmd_process(db_path: &Path, config: PathBuf, path: &Path, camera: Option<String>) -> Result<()> {
    let scheduler = Scheduler::builder(db_path, Arc::new(JsonConfigFile::new(config))).build()?;
    if !path.exists() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }

    println!("Processing {}", path.display());
    let report = scheduler.run_adhoc(path, camera.as_deref())?;
    print_scan_report(&report.scan);

    if report.results.is_empty() {
        return Ok(());
    }

    println!();
    println!("{:>6}  {:>10}  {:>7}  {}", "Job", "Outcome", "Events", "File");
    println!("{}", "-".repeat(70));
    for result in &report.results {
        let (label, events, detail) = match &result.outcome {
            Ok(JobOutcome::Done { events }) => ("done", events.to_string(), None),
            Ok(JobOutcome::Failed { error }) => ("failed", "-".to_string(), Some(error)),
            Ok(JobOutcome::Retrying { error }) => ("retrying", "-".to_string(), Some(error)),
            Ok(JobOutcome::Stale) => ("stale", "-".to_string(), None),
            Err(error) => ("error", "-".to_string(), Some(error)),
        };
        println!("{:>6}  {:>10}  {:>7}  {}", result.job_id, label, events, shorten(&result.path, 45));
        if let Some(error) = detail {
            println!("{:>6}  {}", "", error);
        }
    }

    Ok(())
}

fn cmd_jobs(db_path: &Path, status: Option<String>, limit: i64) -> Result<()> {
    let status = match status {
        Some(s) => Some(JobStatus::parse(&s).ok_or_else(|| anyhow::anyhow!("Unknown status '{}'", s))?),
        None => None,
    };

    let conn = open_db(db_path)?;
    let jobs = schema::list_file_jobs(&conn, status, limit)?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("{:>6}  {:>10}  {:>12}  {:>10}  {:>7}  {:>20}  {}", "ID", "Status", "Camera", "Mode", "Retries", "Created", "File");
    println!("{}", "-".repeat(100));
    for job in &jobs {
        print_job_row(job);
    }

    let pending = jobs::count_pending(&conn)?;
    println!();
    println!("{} job(s) pending", pending);
    Ok(())
}

fn print_job_row(job: &FileJob) {
    println!(
        "{:>6}  {:>10}  {:>12}  {:>10}  {:>7}  {:>20}  {}",
        job.id,
        job.status.as_str(),
        job.camera_id,
        job.mode.as_str(),
        job.retries,
        format_time(job.created_at, Tz::UTC),
        shorten(&job.path, 40)
    );
    if let Some(ref error) = job.last_error {
        println!("{:>6}  {}", "", error);
    }
}

fn cmd_progress(db_path: &Path) -> Result<()> {
    let conn = open_db(db_path)?;
    let p = progress::read_progress(&conn)?;

    println!("Total:       {}", p.total);
    println!("Pending:     {}", p.pending);
    println!("Processing:  {}", p.processing);
    println!("Done:        {}", p.done);
    println!("Failed:      {}", p.failed);
    println!("Complete:    {:.1}%", p.percent);
    Ok(())
}

fn cmd_reclaim(db_path: &Path, config_path: &Path) -> Result<()> {
    let config = JsonConfigFile::load(config_path)?;
    let conn = open_db(db_path)?;

    let report = jobs::requeue_if_timed_out(&conn, config.timeout(), config.max_retries, SystemClock.now())?;
    println!("Requeued {} job(s), failed {} job(s)", report.requeued, report.failed);
    Ok(())
}

fn cmd_events(
    db_path: &Path,
    camera: Option<String>,
    from: Option<String>,
    to: Option<String>,
    code: Option<String>,
    config: Option<PathBuf>,
    limit: i64,
) -> Result<()> {
    let tz = match config {
        Some(path) => JsonConfigFile::load(&path)?.timezone,
        None => Tz::UTC,
    };

    let query = EventQuery {
        camera_id: camera,
        from: from.as_deref().map(|s| user_time(s, tz)).transpose()?,
        to: to.as_deref().map(|s| user_time(s, tz)).transpose()?,
        tracking_code: code,
        limit: Some(limit),
    };

    let conn = open_db(db_path)?;
    let events = schema::find_events(&conn, &query)?;

    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!("{:>6}  {:>12}  {:>20}  {:>8}  {:<24}  {}", "ID", "Camera", "Start", "Duration", "Codes", "File");
    println!("{}", "-".repeat(100));
    for event in &events {
        let codes = if event.tracking_codes.is_empty() {
            "-".to_string()
        } else {
            event.tracking_codes.iter().cloned().collect::<Vec<_>>().join(",")
        };
        println!(
            "{:>6}  {:>12}  {:>20}  {:>8}  {:<24}  {}",
            event.id,
            event.camera_id,
            format_time(event.start, tz),
            format_duration(event.duration_ms),
            shorten(&codes, 24),
            shorten(&event.source_path, 40)
        );
    }
    Ok(())
}

// --- Helper Functions ---

fn first_request(backfill_days: Option<u32>) -> DiscoveryRequest {
    match backfill_days {
        Some(days) => DiscoveryRequest::BulkBackfill { days },
        None => DiscoveryRequest::Continuous,
    }
}

fn user_time(raw: &str, tz: Tz) -> Result<CanonicalTime> {
    parse_user_time(raw, tz).ok_or_else(|| anyhow::anyhow!("Cannot parse time '{}'", raw))
}

fn print_scan_report(report: &ScanReport) {
    println!("Scan complete:");
    println!("  Candidates:      {}", report.candidates);
    println!("  Enqueued:        {}", report.enqueued.len());
    println!("  Already queued:  {}", report.skipped_existing);
    println!("  Unreadable:      {}", report.skipped_files);
    println!("  Outside window:  {}", report.outside_window);
    if report.capped {
        println!("  Stopped at the queue depth cap");
    }
    for err in &report.camera_errors {
        println!("  Camera {}: {}", err.camera, err.error);
    }
}

fn format_time(t: CanonicalTime, tz: Tz) -> String {
    t.in_zone(tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_duration(ms: i64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn shorten(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > max {
        let tail: String = chars[chars.len() - (max - 3)..].iter().collect();
        format!("...{}", tail)
    } else {
        s.to_string()
    }
}
