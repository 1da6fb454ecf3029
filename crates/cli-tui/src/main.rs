use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use monitor::{
    Backends, CanonicalStatus, CoverageEntry, Engine, EngineUpdate, HttpBackend, Job, JobId, JobStats,
    JobsUpdate, MonitorConfig, Notice, NoticeKind, TransportMode,
};
use monitor::reconcile::DeltaKind;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::collections::{HashMap, VecDeque};
use std::io::stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const MAX_NOTICES: usize = 3;

struct App {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    stats: Option<JobStats>,
    coverage: Arc<Vec<CoverageEntry>>,
    mode: Option<TransportMode>,
    notices: VecDeque<Notice>,
    table_state: TableState,
    focused: bool,
    should_quit: bool,
    server_url: String,
}

impl App {
    fn new(server_url: String) -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            stats: None,
            coverage: Arc::new(Vec::new()),
            mode: None,
            notices: VecDeque::new(),
            table_state: TableState::default(),
            focused: true,
            should_quit: false,
            server_url,
        }
    }

    fn apply(&mut self, update: EngineUpdate) {
        match update {
            EngineUpdate::Jobs(update) => self.apply_jobs(update),
            EngineUpdate::Coverage(entries) => self.coverage = entries,
            EngineUpdate::Transport(mode) => self.mode = Some(mode),
            EngineUpdate::Notice(notice) => self.push_notice(notice),
        }
    }

    fn apply_jobs(&mut self, update: JobsUpdate) {
        let selected = self.selected_id();
        for delta in update.deltas {
            match delta.kind {
                DeltaKind::Upserted => {
                    self.jobs.insert(delta.job.id.clone(), delta.job);
                }
                DeltaKind::Removed => {
                    self.jobs.remove(&delta.job.id);
                }
            }
        }
        self.order = update.order;
        self.stats = update.stats;
        self.reselect(selected);
    }

    /// Replace everything after a lagged subscription
    fn resync(&mut self, jobs: Vec<Job>, stats: Option<JobStats>, coverage: Option<Arc<Vec<CoverageEntry>>>) {
        let selected = self.selected_id();
        self.order = jobs.iter().map(|j| j.id.clone()).collect();
        self.jobs = jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
        self.stats = stats;
        if let Some(coverage) = coverage {
            self.coverage = coverage;
        }
        self.reselect(selected);
    }

    fn push_notice(&mut self, notice: Notice) {
        if self.notices.len() == MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }

    fn ordered_jobs(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    fn selected_id(&self) -> Option<JobId> {
        self.table_state.selected().and_then(|i| self.order.get(i).cloned())
    }

    /// Keep the selection on the same job when rows move
    fn reselect(&mut self, previous: Option<JobId>) {
        let index = previous
            .and_then(|id| self.order.iter().position(|o| *o == id))
            .or_else(|| self.table_state.selected().map(|i| i.min(self.order.len().saturating_sub(1))));
        self.table_state.select(if self.order.is_empty() { None } else { index });
    }

    fn select_next(&mut self) {
        if self.order.is_empty() {
            return;
        }
        let next = match self.table_state.selected() {
            Some(i) => (i + 1).min(self.order.len() - 1),
            None => 0,
        };
        self.table_state.select(Some(next));
    }

    fn select_previous(&mut self) {
        if self.order.is_empty() {
            return;
        }
        let previous = self.table_state.selected().map(|i| i.saturating_sub(1)).unwrap_or(0);
        self.table_state.select(Some(previous));
    }

    fn count(&self, status: CanonicalStatus) -> usize {
        self.jobs.values().filter(|j| j.canonical_status == status).count()
    }
}

/// Actions the key handler asks the event loop to perform
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Refresh,
    Cancel(JobId),
    CancelQueued,
    CancelAll,
    Pause(bool),
}

fn handle_key(app: &mut App, key: KeyEvent) -> Option<Action> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => {
            app.should_quit = true;
            None
        }
        KeyCode::Char('r') => Some(Action::Refresh),
        KeyCode::Char('c') => app.selected_id().map(Action::Cancel),
        KeyCode::Char('Q') => Some(Action::CancelQueued),
        KeyCode::Char('X') => Some(Action::CancelAll),
        KeyCode::Char('p') => Some(Action::Pause(true)),
        KeyCode::Char('u') => Some(Action::Pause(false)),
        KeyCode::Down | KeyCode::Char('j') => {
            app.select_next();
            None
        }
        KeyCode::Up | KeyCode::Char('k') => {
            app.select_previous();
            None
        }
        _ => None,
    }
}

/// Run an action off the UI loop; failures reach the screen as engine notices
fn dispatch(engine: &Arc<Engine>, action: Action) {
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        let outcome = match &action {
            Action::Refresh => engine.force_refresh().await,
            Action::Cancel(id) => engine.cancel_job(id.clone()).await,
            Action::CancelQueued => engine.cancel_queued().await,
            Action::CancelAll => engine.cancel_all().await,
            Action::Pause(paused) => engine.pause_queue(*paused).await,
        };
        if let Err(e) = outcome {
            log::debug!("{:?} failed: {}", action, e);
        }
    });
}

/// Forward terminal events from a blocking reader thread
fn spawn_input_reader() -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || loop {
        match crossterm::event::poll(Duration::from_millis(250)) {
            Ok(true) => match crossterm::event::read() {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            Ok(false) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(_) => break,
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Default to warn so log lines do not tear the alternate screen
    let default_level = if args.verbose { "debug" } else { "warn" };
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

    let backend = Arc::new(HttpBackend::new(&cfg).context("Failed to create HTTP client")?);
    let engine = Arc::new(Engine::new(&cfg, Backends::from_shared(backend)));
    let mut updates = engine.subscribe();

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(
        stdout,
        crossterm::terminal::EnterAlternateScreen,
        crossterm::event::EnableFocusChange
    )?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &engine, &mut updates, cfg.server_url.clone()).await;

    // Restore terminal
    let _ = engine.stop().await;
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::event::DisableFocusChange,
        crossterm::terminal::LeaveAlternateScreen
    )?;

    result
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    engine: &Arc<Engine>,
    updates: &mut broadcast::Receiver<EngineUpdate>,
    server_url: String,
) -> Result<()> {
    let mut app = App::new(server_url);
    let mut input = spawn_input_reader();
    // Redraw tick keeps running-job durations current
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    engine.start().await.context("Failed to start the monitor engine")?;

    loop {
        terminal.draw(|f| ui(f, &mut app))?;

        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => app.apply(update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} update(s), resynchronizing", missed);
                    let snapshot = engine.snapshot().await?;
                    app.mode = Some(snapshot.transport.mode);
                    app.resync(snapshot.jobs, snapshot.stats, snapshot.coverage);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = input.recv() => match event {
                Some(Event::Key(key)) => {
                    if let Some(action) = handle_key(&mut app, key) {
                        dispatch(engine, action);
                    }
                }
                Some(Event::FocusGained) if !app.focused => {
                    app.focused = true;
                    engine.start().await?;
                }
                Some(Event::FocusLost) if app.focused => {
                    app.focused = false;
                    engine.stop().await?;
                }
                Some(_) => {}
                None => break,
            },
            _ = tick.tick() => {}
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

/// Job monitor TUI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the configuration
    #[arg(short, long)]
    server: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 12 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x12.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let coverage_height = (app.coverage.len().div_ceil(3) as u16 * 3).clamp(3, 9);
    let notice_height = if app.notices.is_empty() { 0 } else { app.notices.len() as u16 + 2 };
    let status_height = 3;

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(coverage_height),
            Constraint::Min(3),
            Constraint::Length(notice_height),
            Constraint::Length(status_height),
        ])
        .split(size);

    render_coverage(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    if notice_height > 0 {
        render_notices(f, app, chunks[2]);
    }
    render_status_bar(f, app, chunks[3]);
}

fn render_coverage(f: &mut Frame, app: &App, area: Rect) {
    if app.coverage.is_empty() {
        let empty = Paragraph::new("No coverage data yet")
            .block(Block::default().borders(Borders::ALL).title("Coverage"));
        f.render_widget(empty, area);
        return;
    }

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Length(3); (area.height / 3).max(1) as usize])
        .split(area);

    for (row_area, chunk) in rows.iter().zip(app.coverage.chunks(3)) {
        let cells = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(33),
                Constraint::Percentage(34),
                Constraint::Percentage(33),
            ])
            .split(*row_area);

        for (cell, entry) in cells.iter().zip(chunk) {
            let percent = entry.percent().unwrap_or(0.0);
            let gauge = Gauge::default()
                .block(Block::default().borders(Borders::ALL).title(entry.category().to_string()))
                .gauge_style(Style::default().fg(coverage_color(percent)))
                .percent(percent.clamp(0.0, 100.0) as u16)
                .label(format!("{}/{} ({:.1}%)", entry.processed(), entry.total(), percent));
            f.render_widget(gauge, *cell);
        }
    }
}

fn coverage_color(percent: f64) -> Color {
    if percent >= 90.0 {
        Color::Green
    } else if percent >= 50.0 {
        Color::Cyan
    } else {
        Color::Yellow
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "TASK", "TARGET", "PROG", "TIME", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = chrono::Utc::now().timestamp();
    let rows: Vec<Row> = if app.order.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("Server: {}", app.server_url),
        ])]
    } else {
        app.ordered_jobs()
            .map(|job| {
                let mut status = status_label(job.canonical_status).to_string();
                if job.paused {
                    status.push('*');
                }
                Row::new(vec![
                    status,
                    truncate_string(job.task.as_deref().unwrap_or("-"), 16),
                    truncate_string(job.target_name().unwrap_or("-"), 50),
                    job.progress_percent
                        .map(|p| format!("{:.0}%", p))
                        .unwrap_or_else(|| "-".to_string()),
                    format_duration(job.duration_secs(now)),
                    truncate_string(job.error.as_deref().unwrap_or(""), 40),
                ])
                .style(Style::default().fg(status_color(job.canonical_status)))
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(16),
        Constraint::Percentage(45),
        Constraint::Length(5),
        Constraint::Length(9),
        Constraint::Percentage(30),
    ];

    let title = format!("Jobs ({})", app.order.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_notices(f: &mut Frame, app: &App, area: Rect) {
    let text: Vec<String> = app
        .notices
        .iter()
        .map(|n| format!("{} {}", notice_marker(n.kind), n.message))
        .collect();
    let paragraph = Paragraph::new(text.join("\n"))
        .block(Block::default().borders(Borders::ALL).title("Notices"))
        .style(Style::default().fg(Color::Yellow));
    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let mode = app.mode.map(|m| m.to_string()).unwrap_or_else(|| "starting".to_string());
    let focus = if app.focused { "" } else { " (paused: unfocused)" };
    let queued = app
        .stats
        .as_ref()
        .and_then(|s| s.queued)
        .map(|q| q as usize)
        .unwrap_or_else(|| app.count(CanonicalStatus::Queued));

    let status_text = format!(
        "Mode: {}{} | Running: {} | Queued: {} | Done: {} | Failed: {} | q=quit r=refresh c=cancel Q=cancel queued X=cancel all p/u=pause/resume",
        mode,
        focus,
        app.count(CanonicalStatus::Running),
        queued,
        app.count(CanonicalStatus::Completed),
        app.count(CanonicalStatus::Failed),
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn status_label(status: CanonicalStatus) -> &'static str {
    match status {
        CanonicalStatus::Running => "RUN",
        CanonicalStatus::Queued => "QUE",
        CanonicalStatus::Completed => "OK",
        CanonicalStatus::Failed => "FAIL",
        CanonicalStatus::Canceled => "CANC",
        CanonicalStatus::Unknown => "?",
    }
}

fn status_color(status: CanonicalStatus) -> Color {
    match status {
        CanonicalStatus::Running => Color::Cyan,
        CanonicalStatus::Queued => Color::White,
        CanonicalStatus::Completed => Color::Green,
        CanonicalStatus::Failed => Color::Red,
        CanonicalStatus::Canceled | CanonicalStatus::Unknown => Color::DarkGray,
    }
}

fn notice_marker(kind: NoticeKind) -> &'static str {
    match kind {
        NoticeKind::Degraded => "⚠️ ",
        NoticeKind::Recovered => "✅",
        NoticeKind::CommandFailed => "❌",
        NoticeKind::Unsupported => "🚫",
    }
}

/// Seconds as `1h02m`, `3m07s` or `42s`; unknown durations show as `-`
fn format_duration(secs: Option<i64>) -> String {
    match secs {
        None => "-".to_string(),
        Some(s) if s >= 3600 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        Some(s) if s >= 60 => format!("{}m{:02}s", s / 60, s % 60),
        Some(s) => format!("{}s", s),
    }
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
