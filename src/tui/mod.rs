mod help;

use crate::cli::{build_config, load_submission, output_targets, start_controller, Cli};
use crate::model::{ControllerConfig, Phase, ScanRecord, Snapshot, Submission};
use crate::orchestrator::{self, ControllerHandle, OutputTargets};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Terminal,
};
use std::sync::{mpsc as std_mpsc, OnceLock};
use std::{io, time::Duration, time::Instant};

static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

struct UiState {
    show_help: bool,
    info: String,
    targets: OutputTargets,
    // Job id whose completion has already been saved/exported.
    processed_job: Option<String>,
    last_record: Option<ScanRecord>,
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let submission = load_submission(&args).await?;
    let (handle, controller) = start_controller(&cfg, None)?;
    handle.select_file(submission);
    if args.submit_on_launch {
        handle.submit();
    }

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    // It owns the only handle, so the controller stops when the UI exits.
    let ui_handle = std::thread::spawn(move || run_threaded(args, cfg, handle));

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    let _ = controller.await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }
    Ok(())
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(args: Cli, cfg: ControllerConfig, handle: ControllerHandle) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let mut state = UiState {
        show_help: false,
        info: if args.submit_on_launch {
            "Submitting scan…".into()
        } else {
            "Press s to submit".into()
        },
        targets: output_targets(&args),
        processed_job: None,
        last_record: None,
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        let snapshot = handle.current_state();
        handle_completion(&cfg, &mut state, &snapshot);

        if last_tick.elapsed() >= tick_rate {
            terminal
                .draw(|f| draw(f.area(), f, &state, &snapshot, &cfg))
                .ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        handle.clear();
                        break Ok(());
                    }
                    (_, KeyCode::Char('s')) => {
                        if matches!(snapshot.phase, Phase::Idle | Phase::Failed { .. })
                            && snapshot.submission.is_some()
                        {
                            state.info = "Submitting scan…".into();
                            handle.submit();
                        } else if snapshot.submission.is_none() {
                            state.info = "No file selected (press r to reload it)".into();
                        } else {
                            state.info = format!("Cannot submit while {}", snapshot.phase.label());
                        }
                    }
                    (_, KeyCode::Char('x')) => {
                        handle.clear();
                        state.last_record = None;
                        state.processed_job = None;
                        state.info = "Cleared".into();
                    }
                    (_, KeyCode::Char('r')) => match reload_submission(&args) {
                        Ok(submission) => {
                            state.info = format!("Selected {}", submission.file_name);
                            state.last_record = None;
                            state.processed_job = None;
                            handle.select_file(submission);
                        }
                        Err(e) => state.info = format!("Reload failed: {e:#}"),
                    },
                    (_, KeyCode::Char('y')) => match state.last_record.as_ref() {
                        Some(record) => {
                            let copied = serde_json::to_string_pretty(record)
                                .map_err(anyhow::Error::from)
                                .and_then(|json| copy_to_clipboard(&json));
                            state.info = match copied {
                                Ok(()) => "✓ Copied result JSON to clipboard".into(),
                                Err(e) => format!("Clipboard copy failed: {e:#}"),
                            };
                        }
                        None => state.info = "No completed result to copy yet.".into(),
                    },
                    (_, KeyCode::Char('a')) => {
                        state.targets.auto_save = !state.targets.auto_save;
                        state.info = if state.targets.auto_save {
                            "Auto-save enabled".into()
                        } else {
                            "Auto-save disabled".into()
                        };
                    }
                    (_, KeyCode::Char('?')) => {
                        state.show_help = !state.show_help;
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn reload_submission(args: &Cli) -> Result<Submission> {
    let path = args.file.as_deref().context("no scan file given")?;
    Submission::read(path)
}

/// Save/export each completed job exactly once.
fn handle_completion(cfg: &ControllerConfig, state: &mut UiState, snapshot: &Snapshot) {
    if snapshot.phase != Phase::Completed {
        return;
    }
    let job_id = snapshot.job.as_ref().map(|j| j.id.clone());
    if job_id.is_none() || state.processed_job == job_id {
        return;
    }
    state.processed_job = job_id;
    if let Some(processed) = orchestrator::process_completion(cfg, &state.targets, snapshot) {
        state.info = if processed.messages.is_empty() {
            "Analysis complete".into()
        } else {
            processed.messages.join(" | ")
        };
        state.last_record = Some(processed.record);
    }
}

fn phase_color(phase: &Phase) -> Color {
    match phase {
        Phase::Idle => Color::Gray,
        Phase::Uploading | Phase::Processing => Color::Cyan,
        Phase::Completed => Color::Green,
        Phase::Failed { .. } => Color::Red,
        Phase::TimedOut => Color::Yellow,
    }
}

fn kv(label: &str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::raw(value),
    ])
}

fn draw(
    area: Rect,
    f: &mut ratatui::Frame,
    state: &UiState,
    snapshot: &Snapshot,
    cfg: &ControllerConfig,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(3),
        ])
        .split(area);

    let file = snapshot
        .submission
        .as_ref()
        .map(|s| format!("{} ({} bytes, {})", s.file_name, s.size_bytes, s.mime_type))
        .unwrap_or_else(|| "-".into());
    let job = snapshot
        .job
        .as_ref()
        .map(|j| j.id.clone())
        .unwrap_or_else(|| "-".into());
    let header = Paragraph::new(vec![
        kv("File", file),
        kv("Scan ID", job),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                snapshot.phase.label(),
                Style::default().fg(phase_color(&snapshot.phase)),
            ),
        ]),
        kv(
            "Backend",
            format!(
                "{}  polls {}/{}",
                snapshot.backend_status.as_deref().unwrap_or("-"),
                snapshot.poll_attempts,
                cfg.max_poll_attempts
            ),
        ),
    ])
    .block(Block::default().borders(Borders::ALL).title("NeuroNav scan"));
    f.render_widget(header, chunks[0]);

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(phase_color(&snapshot.phase)))
        .percent(u16::from(snapshot.progress.percent))
        .label(format!(
            "{}%  {}",
            snapshot.progress.percent, snapshot.progress.stage_label
        ));
    f.render_widget(gauge, chunks[1]);

    if state.show_help {
        help::draw_help(chunks[2], f);
    } else {
        draw_result(chunks[2], f, snapshot);
    }

    let footer = Paragraph::new(vec![Line::from(vec![
        Span::raw(state.info.clone()),
        Span::styled(
            "   (s submit, x clear, r reselect, ? help, q quit)",
            Style::default().fg(Color::DarkGray),
        ),
    ])])
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, chunks[3]);
}

fn draw_result(area: Rect, f: &mut ratatui::Frame, snapshot: &Snapshot) {
    let lines: Vec<Line> = match (&snapshot.phase, snapshot.result.as_ref()) {
        (Phase::Completed, Some(result)) => crate::text_summary::prediction_lines(result)
            .into_iter()
            .map(Line::from)
            .collect(),
        (Phase::Failed { reason }, _) => vec![
            Line::from(Span::styled(
                format!("Failed: {reason}"),
                Style::default().fg(Color::Red),
            )),
            Line::from("Press s to try again or r to reselect the file."),
        ],
        (Phase::TimedOut, _) => vec![
            Line::from(Span::styled(
                snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| "Processing taking too long".into()),
                Style::default().fg(Color::Yellow),
            )),
            Line::from("Press r to reselect the file and start over."),
        ],
        (Phase::Idle, _) if snapshot.submission.is_none() => {
            vec![Line::from("No file selected. Press r to reload it.")]
        }
        (Phase::Idle, _) => vec![Line::from("Ready. Press s to submit.")],
        _ => vec![Line::from("Waiting for results…")],
    };
    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Result"));
    f.render_widget(p, area);
}

fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        // Clipboard managers on Linux read lazily; keep the owner alive briefly.
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue text for the clipboard thread; returns without blocking.
fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}
