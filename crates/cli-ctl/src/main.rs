use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use monitor::stream::PreviewOutcome;
use monitor::{
    Backends, CoverageEntry, Engine, EngineUpdate, HttpBackend, IngestEvent, Job, JobId, JobScope,
    MonitorConfig, RepairRequest,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Job monitor command-line client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the configuration
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List jobs in display order
    Jobs {
        /// Only jobs for these targets
        #[arg(long = "target")]
        targets: Vec<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Cancel one job
    Cancel { id: String },
    /// Cancel every queued job
    CancelQueued,
    /// Cancel every job
    CancelAll,
    /// Hold queued jobs from starting
    Pause,
    /// Release the queue
    Resume,
    /// Print per-category artifact coverage
    Coverage {
        /// Restrict coverage to these files
        #[arg(long = "scope")]
        scope: Vec<String>,
    },
    /// Stream repair candidates as they are found
    RepairPreview {
        /// Library paths to analyze (default: everything)
        #[arg(long = "root")]
        roots: Vec<String>,
        /// Stop after this many candidates (also sent to the backend)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Follow live updates until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let default_config_path = PathBuf::from("/etc/jobwatch/config.json");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let mut cfg = MonitorConfig::load_config(config_path).context("Failed to load configuration")?;
    if let Some(url) = args.server {
        cfg.server_url = url;
    }
    debug!("Using backend at {}", cfg.server_url);

    let backend = Arc::new(HttpBackend::new(&cfg).context("Failed to create HTTP client")?);
    let engine = Engine::new(&cfg, Backends::from_shared(backend));

    match args.command {
        Command::Jobs { targets, json } => list_jobs(&engine, targets, json).await,
        Command::Cancel { id } => {
            engine
                .cancel_job(JobId::new(id.clone()))
                .await
                .with_context(|| format!("Failed to cancel job {}", id))?;
            info!("✅ Cancel requested for job {}", id);
            Ok(())
        }
        Command::CancelQueued => {
            engine.cancel_queued().await.context("Failed to cancel queued jobs")?;
            info!("✅ Queued jobs canceled");
            Ok(())
        }
        Command::CancelAll => {
            engine.cancel_all().await.context("Failed to cancel jobs")?;
            info!("✅ All jobs canceled");
            Ok(())
        }
        Command::Pause => {
            engine.pause_queue(true).await.context("Failed to pause the queue")?;
            info!("⏸️  Queue paused");
            Ok(())
        }
        Command::Resume => {
            engine.pause_queue(false).await.context("Failed to resume the queue")?;
            info!("▶️  Queue resumed");
            Ok(())
        }
        Command::Coverage { scope } => print_coverage(&engine, scope).await,
        Command::RepairPreview { roots, limit } => repair_preview(&engine, roots, limit).await,
        Command::Watch => watch(&engine).await,
    }
}

async fn list_jobs(engine: &Engine, targets: Vec<String>, json: bool) -> Result<()> {
    if !targets.is_empty() {
        engine
            .set_job_scope(Some(JobScope { targets }))
            .await
            .context("Failed to fetch jobs")?;
    } else {
        engine.refresh().await.context("Failed to fetch jobs")?;
    }
    let snapshot = engine.snapshot().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.jobs)?);
        return Ok(());
    }

    if snapshot.jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    let now = chrono::Utc::now().timestamp();
    println!("{:<9} {:>5} {:>8}  {:<12} {:<14} TARGET", "STATUS", "PROG", "TIME", "ID", "TASK");
    for job in &snapshot.jobs {
        println!("{}", job_line(job, now));
    }
    if let Some(stats) = snapshot.stats {
        println!(
            "\nrunning={} queued={} completed={} failed={} total={}",
            count_text(stats.running),
            count_text(stats.queued),
            count_text(stats.completed),
            count_text(stats.failed),
            count_text(stats.total)
        );
    }
    Ok(())
}

fn job_line(job: &Job, now: i64) -> String {
    let mut status = job.canonical_status.to_string();
    if job.paused {
        status.push_str(" (p)");
    }
    let progress = job
        .progress_percent
        .map(|p| format!("{:.0}%", p))
        .unwrap_or_else(|| "-".to_string());
    let time = job
        .duration_secs(now)
        .map(|s| format!("{}s", s))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:<9} {:>5} {:>8}  {:<12} {:<14} {}",
        status,
        progress,
        time,
        job.id.as_str(),
        job.task.as_deref().unwrap_or("-"),
        job.target.as_deref().unwrap_or("-")
    );
    if let Some(error) = &job.error {
        line.push_str(&format!("  [{}]", error));
    }
    line
}

/// Absent counts are unknown, not zero
fn count_text(count: Option<u64>) -> String {
    count.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string())
}

async fn print_coverage(engine: &Engine, scope: Vec<String>) -> Result<()> {
    let entries = if scope.is_empty() {
        engine.refresh_coverage(true).await
    } else {
        let scope: BTreeSet<String> = scope.into_iter().collect();
        engine.set_coverage_scope(Some(scope)).await
    }
    .context("Failed to compute coverage")?;

    if entries.is_empty() {
        println!("No coverage data");
        return Ok(());
    }
    for entry in entries.iter() {
        println!("{}", coverage_line(entry));
    }
    Ok(())
}

fn coverage_line(entry: &CoverageEntry) -> String {
    let percent = entry
        .percent()
        .map(|p| format!("{:5.1}%", p))
        .unwrap_or_else(|| "    -".to_string());
    format!(
        "{:<12} {} processed={} missing={} total={}",
        entry.category(),
        percent,
        entry.processed(),
        entry.missing(),
        entry.total()
    )
}

async fn repair_preview(engine: &Engine, roots: Vec<String>, limit: Option<usize>) -> Result<()> {
    let mut request = RepairRequest::new(roots);
    request.limit = limit;
    let mut preview = engine
        .preview_repair(request)
        .await
        .context("Failed to start repair preview")?;

    let cancel = preview.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut reached_limit = false;
    while let Some(event) = preview.next().await {
        match event {
            IngestEvent::Item(candidate) => {
                println!(
                    "{:.2} {:<10} {} -> {}",
                    candidate.confidence, candidate.strategy, candidate.from, candidate.to
                );
                if !reached_limit && limit_reached(preview.candidates().len(), limit) {
                    reached_limit = true;
                    preview.cancel();
                }
            }
            IngestEvent::Progress(progress) => match progress.total {
                Some(total) => eprintln!("... {}/{} analyzed", progress.processed, total),
                None => eprintln!("... {} analyzed", progress.processed),
            },
            IngestEvent::Error(_) | IngestEvent::Done => {}
        }
    }

    let found = preview.candidates().len();
    match preview.outcome() {
        Some(PreviewOutcome::Completed) => {
            info!("✅ Repair preview complete: {} candidate(s)", found);
            Ok(())
        }
        Some(PreviewOutcome::Canceled) if reached_limit => {
            info!("✅ Repair preview stopped at the limit of {} candidate(s)", found);
            Ok(())
        }
        Some(PreviewOutcome::Canceled) => {
            info!("Repair preview canceled after {} candidate(s)", found);
            Ok(())
        }
        Some(PreviewOutcome::Failed(message)) => {
            bail!("Repair preview failed after {} candidate(s): {}", found, message)
        }
        None => Ok(()),
    }
}

fn limit_reached(found: usize, limit: Option<usize>) -> bool {
    limit.is_some_and(|limit| found >= limit)
}

async fn watch(engine: &Engine) -> Result<()> {
    let mut updates = engine.subscribe();
    engine.start().await?;
    info!("Watching job updates (Ctrl-C to stop)");

    let now = || chrono::Utc::now().timestamp();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(EngineUpdate::Jobs(update)) => {
                    for delta in &update.deltas {
                        println!("{:<8} {}", format!("{:?}", delta.kind).to_lowercase(), job_line(&delta.job, now()));
                    }
                }
                Ok(EngineUpdate::Coverage(entries)) => {
                    for entry in entries.iter() {
                        println!("coverage {}", coverage_line(entry));
                    }
                }
                Ok(EngineUpdate::Transport(mode)) => println!("transport {}", mode),
                Ok(EngineUpdate::Notice(notice)) => println!("notice   {:?}: {}", notice.kind, notice.message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} update(s), printing a fresh snapshot", missed);
                    for job in engine.snapshot().await?.jobs {
                        println!("snapshot {}", job_line(&job, now()));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await?;
    Ok(())
}
