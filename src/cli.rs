use crate::backend::HttpBackend;
use crate::model::{ControllerConfig, ControllerEvent, Phase, Snapshot, Submission};
use crate::orchestrator::{
    self, ControllerHandle, OutputTargets, ProcessedScan, Services, MIN_PROGRESS_TICK,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "neuronav-scan",
    version,
    about = "Upload a brain scan to NeuroNav and follow the analysis"
)]
pub struct Cli {
    /// Scan to analyze (.png, .jpg, .jpeg, .dcm, .nii, .nii.gz, .zip)
    #[arg(required_unless_present = "history")]
    pub file: Option<PathBuf>,

    /// Base URL of the NeuroNav backend
    #[arg(long, default_value = "http://localhost:8000")]
    pub base_url: String,

    /// API path prefix
    #[arg(long, default_value = "/api/v1")]
    pub api_prefix: String,

    /// Print JSON result and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print text progress and summary, then exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for scripting)
    #[arg(long)]
    pub silent: bool,

    /// Minimum processing time before the first status poll
    #[arg(long, default_value = "16s")]
    pub min_processing: humantime::Duration,

    /// Delay between status polls
    #[arg(long, default_value = "5s")]
    pub poll_interval: humantime::Duration,

    /// Progress animation tick
    #[arg(long, default_value = "300ms")]
    pub progress_tick: humantime::Duration,

    /// Give up after this many non-terminal status responses
    #[arg(long, default_value_t = 60)]
    pub max_poll_attempts: u32,

    /// Per-request HTTP timeout
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Export the result as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export the result as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Print the N most recent saved results and exit
    #[arg(long, value_name = "N")]
    pub history: Option<usize>,

    /// Automatically submit the scan when the TUI launches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub submit_on_launch: bool,
}

impl Cli {
    pub fn is_non_tui(&self) -> bool {
        self.silent || self.json || self.text || self.history.is_some()
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if let Some(n) = args.history {
        return print_history(n);
    }

    if !args.json && !args.text && !args.silent {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_json(args).await;
    }

    run_text(args).await
}

/// Build a `ControllerConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ControllerConfig {
    ControllerConfig {
        base_url: args.base_url.clone(),
        api_prefix: args.api_prefix.clone(),
        min_processing: Duration::from(args.min_processing),
        poll_interval: Duration::from(args.poll_interval),
        progress_tick: Duration::from(args.progress_tick).max(MIN_PROGRESS_TICK),
        max_poll_attempts: args.max_poll_attempts.max(1),
        request_timeout: Duration::from(args.request_timeout),
        ..Default::default()
    }
}

pub(crate) fn output_targets(args: &Cli) -> OutputTargets {
    OutputTargets {
        auto_save: args.auto_save,
        export_json: args.export_json.clone(),
        export_csv: args.export_csv.clone(),
    }
}

pub(crate) async fn load_submission(args: &Cli) -> Result<Submission> {
    let path = args.file.as_deref().context("no scan file given")?;
    let submission = Submission::from_path(path).await?;
    if !submission.is_supported_extension() {
        tracing::warn!(file = %submission.file_name, "file type is not in the accepted list");
    }
    Ok(submission)
}

/// Start a controller backed by the HTTP client.
pub(crate) fn start_controller(
    cfg: &ControllerConfig,
    event_tx: Option<mpsc::UnboundedSender<ControllerEvent>>,
) -> Result<(ControllerHandle, tokio::task::JoinHandle<()>)> {
    let backend = Arc::new(HttpBackend::new(cfg).context("failed to build HTTP client")?);
    Ok(orchestrator::spawn_controller(
        cfg.clone(),
        Services::from_backend(backend),
        event_tx,
    ))
}

/// Turn a terminal snapshot into the process outcome.
fn terminal_outcome(snapshot: &Snapshot) -> Result<()> {
    match &snapshot.phase {
        Phase::Completed => Ok(()),
        Phase::Failed { reason } => Err(anyhow::anyhow!("analysis failed: {reason}")),
        Phase::TimedOut => Err(anyhow::anyhow!(
            "{}",
            snapshot
                .error
                .clone()
                .unwrap_or_else(|| "processing taking too long".into())
        )),
        other => Err(anyhow::anyhow!("analysis ended in unexpected phase {other:?}")),
    }
}

/// Submit one file and wait for a terminal phase, forwarding events to `on_event`.
async fn drive_submission(
    args: &Cli,
    mut on_event: impl FnMut(ControllerEvent),
) -> Result<Snapshot> {
    let cfg = build_config(args);
    let submission = load_submission(args).await?;
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ControllerEvent>();
    let (handle, join) = start_controller(&cfg, Some(evt_tx))?;
    let mut state_rx = handle.subscribe();

    handle.select_file(submission);
    handle.submit();

    let snapshot = loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => on_event(ev),
            changed = state_rx.changed() => {
                changed.context("controller stopped unexpectedly")?;
                let snap = state_rx.borrow_and_update().clone();
                if snap.phase.is_terminal() {
                    break snap;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.clear();
                return Err(anyhow::anyhow!("cancelled"));
            }
        }
    };

    // Flush remaining events so the final phase change is reported.
    while let Ok(ev) = evt_rx.try_recv() {
        on_event(ev);
    }
    drop(handle);
    let _ = join.await;
    Ok(snapshot)
}

async fn run_json(args: Cli) -> Result<()> {
    let snapshot = drive_submission(&args, |_| {}).await?;
    terminal_outcome(&snapshot)?;

    let processed = finish(&args, &snapshot)?;
    if !args.silent {
        let (out_tx, out_handle) = spawn_output_writer();
        let out = serde_json::to_string_pretty(&processed.record)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        for msg in processed.messages {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
        drop(out_tx);
        let _ = out_handle.await;
    }
    Ok(())
}

async fn run_text(args: Cli) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let mut last_printed: Option<(u8, String)> = None;

    let events_tx = out_tx.clone();
    let snapshot = drive_submission(&args, move |ev| {
        let line = match ev {
            ControllerEvent::PhaseChanged { phase } => Some(match phase {
                Phase::Failed { reason } => format!("== Failed: {reason} =="),
                other => format!("== {} ==", other.label()),
            }),
            ControllerEvent::Progress(p) => {
                // Only report stage changes and 10% steps.
                let report = match &last_printed {
                    Some((pct, stage)) => *stage != p.stage_label || p.percent >= pct + 10,
                    None => true,
                };
                report.then(|| {
                    last_printed = Some((p.percent, p.stage_label.clone()));
                    format!("{:>3}%  {}", p.percent, p.stage_label)
                })
            }
            ControllerEvent::PollAttempt {
                attempt,
                max,
                status,
            } => Some(format!("Status: {status} (attempt {attempt}/{max})")),
            ControllerEvent::Info(msg) => Some(msg),
        };
        if let Some(line) = line {
            let _ = events_tx.send(OutputLine::Stderr(line));
        }
    })
    .await;

    let res = snapshot.and_then(|snapshot| {
        terminal_outcome(&snapshot)?;
        let processed = finish(&args, &snapshot)?;
        let summary = crate::text_summary::build_text_summary(&processed.record);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        for msg in processed.messages {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
        Ok(())
    });

    drop(out_tx);
    let _ = out_handle.await;
    res
}

fn finish(args: &Cli, snapshot: &Snapshot) -> Result<ProcessedScan> {
    orchestrator::process_completion(&build_config(args), &output_targets(args), snapshot)
        .context("completed analysis is missing its result")
}

fn print_history(limit: usize) -> Result<()> {
    let records = crate::storage::load_recent(limit).context("failed to load saved results")?;
    if records.is_empty() {
        println!("No saved results.");
        return Ok(());
    }
    for r in records {
        println!(
            "{}  {:<24}  {:<18} {:>5.1}%  {}",
            r.saved_at_utc,
            r.file_name,
            crate::text_summary::class_label(&r.result.predicted_class),
            r.result.confidence * 100.0,
            r.job_id
        );
    }
    Ok(())
}
