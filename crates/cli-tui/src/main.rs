use anyhow::{Context, Result};
use batch::{
    Batch, BatchConfig, BatchHandle, FfmpegLauncher, FfprobeProbe, SlotState, SlotView, StatusSink,
    Summary,
};
use clap::Parser;
use crossterm::event::{Event, KeyCode, KeyEventKind};
use log::{info, warn};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::Line,
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io::stdout;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;

/// Status lines kept on screen
const LOG_LINES: usize = 200;

/// Interactive batch transcoder with per-slot progress
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source directory
    #[arg(short, long)]
    src: Option<PathBuf>,

    /// Destination directory
    #[arg(short, long)]
    dst: Option<PathBuf>,

    /// Number of concurrent transcoders (1-16)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Playback speed multiplier (0 < tempo <= 2)
    #[arg(short, long)]
    tempo: Option<f64>,

    /// Write logs here instead of discarding them
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct TuiState {
    log: VecDeque<String>,
    last_replaceable: bool,
    overall_percent: f64,
    overall_label: String,
    summary: Option<Summary>,
}

impl TuiState {
    /// A replacing message overwrites the previous one only if that one was
    /// also posted as replaceable
    fn push_message(&mut self, message: &str, replace: bool) {
        if replace && self.last_replaceable {
            if let Some(last) = self.log.back_mut() {
                *last = message.to_string();
                return;
            }
        }
        self.log.push_back(message.to_string());
        while self.log.len() > LOG_LINES {
            self.log.pop_front();
        }
        self.last_replaceable = replace;
    }
}

struct TuiSink {
    state: Arc<Mutex<TuiState>>,
}

impl TuiSink {
    fn lock(&self) -> std::sync::MutexGuard<'_, TuiState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StatusSink for TuiSink {
    fn post(&self, message: &str, replace: bool) {
        self.lock().push_message(message, replace);
    }

    // Slot gauges are drawn from the handle's slot table
    fn set_slot_progress(&self, _slot: usize, _percent: f64, _label: &str) {}

    fn set_overall_progress(&self, percent: f64, label: &str) {
        let mut state = self.lock();
        state.overall_percent = percent;
        state.overall_label = label.to_string();
    }

    fn finished(&self, summary: &Summary) {
        let mut state = self.lock();
        state.push_message(&summary.line(), false);
        state.summary = Some(summary.clone());
    }
}

struct App {
    handle: Arc<BatchHandle>,
    state: Arc<Mutex<TuiState>>,
    system: System,
    selected: usize,
    should_quit: bool,
}

impl App {
    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
    }

    fn select_next(&mut self) {
        let count = self.handle.slot_count();
        if count > 0 {
            self.selected = (self.selected + 1) % count;
        }
    }

    fn select_prev(&mut self) {
        let count = self.handle.slot_count();
        if count > 0 {
            self.selected = (self.selected + count - 1) % count;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    logger.format_timestamp_secs();
    match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            logger.target(env_logger::Target::Pipe(Box::new(file)));
        }
        // Anything on stderr would tear the alternate screen
        None => {
            logger.filter_level(log::LevelFilter::Off);
        }
    }
    logger.init();

    let mut cfg = BatchConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(src) = args.src {
        cfg.source_dir = src;
    }
    if let Some(dst) = args.dst {
        cfg.dest_dir = dst;
    }
    if let Some(threads) = args.threads {
        cfg.threads = threads;
    }
    if let Some(tempo) = args.tempo {
        cfg.tempo = tempo;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let state = Arc::new(Mutex::new(TuiState::default()));
    let sink = Arc::new(TuiSink { state: state.clone() });
    let probe = Arc::new(FfprobeProbe::new(cfg.ffprobe_bin.clone()));
    let launcher = Arc::new(FfmpegLauncher::new(&cfg));
    let handle = Arc::new(
        rt.block_on(Batch::start(cfg, probe, launcher, sink))
            .context("Failed to start batch")?,
    );

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App {
        handle: handle.clone(),
        state,
        system: System::new(),
        selected: 0,
        should_quit: false,
    };

    let result = run(&mut terminal, &mut app, &rt);

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;
    result?;

    if !handle.is_idle() {
        rt.block_on(handle.shutdown());
    }
    let summary = rt.block_on(handle.wait());
    println!("{}", summary.line());
    Ok(())
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    app: &mut App,
    rt: &tokio::runtime::Runtime,
) -> Result<()> {
    loop {
        app.refresh();
        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = crossterm::event::read()? {
                if key.kind == KeyEventKind::Press {
                    handle_key(app, key.code, rt);
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn handle_key(app: &mut App, code: KeyCode, rt: &tokio::runtime::Runtime) {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => {
            if !app.handle.is_idle() {
                info!("Quit requested");
                rt.block_on(app.handle.shutdown());
            }
            app.should_quit = true;
        }
        KeyCode::Down | KeyCode::Char('j') => app.select_next(),
        KeyCode::Up | KeyCode::Char('k') => app.select_prev(),
        KeyCode::Char(c) if c.is_ascii_digit() => {
            let slot = c.to_digit(10).map(|d| d as usize).unwrap_or(0);
            if slot > 0 && slot <= app.handle.slot_count() {
                app.selected = slot - 1;
            }
        }
        KeyCode::Char('p') | KeyCode::Char(' ') => {
            let outcome = app.handle.toggle_pause(app.selected);
            info!("Toggle pause on slot {}: {:?}", app.selected + 1, outcome);
        }
        KeyCode::Char('c') => {
            let handle = app.handle.clone();
            let slot = app.selected;
            rt.spawn(async move {
                if !handle.cancel(slot).await {
                    warn!("Slot {} has no running job", slot + 1);
                }
            });
        }
        _ => {}
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 12 || size.width < 60 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 60x12.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let slots = app.handle.slots();
    let slot_height = (slots.len() as u16).max(1) + 2;

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),           // CPU / Memory
            Constraint::Length(3),           // Overall
            Constraint::Length(slot_height), // Slots
            Constraint::Min(3),              // Status log
            Constraint::Length(1),           // Key help
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_overall(f, app, chunks[1]);
    render_slots(f, app, &slots, chunks[2]);
    render_log(f, app, chunks[3]);

    let help = Paragraph::new("↑/↓ or 1-9 select | p pause/resume | c cancel | q quit")
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(help, chunks[4]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);
}

fn render_overall(f: &mut Frame, app: &App, area: Rect) {
    let state = app.state.lock().unwrap_or_else(|e| e.into_inner());
    let percent = clamp_percent(state.overall_percent);
    let (title, color) = if state.summary.is_some() {
        ("Done", Color::Green)
    } else if app.handle.is_shutting_down() {
        ("Stopping", Color::Red)
    } else {
        ("Overall", Color::Blue)
    };
    let label = if state.overall_label.is_empty() {
        format!("{:.0}%", percent)
    } else {
        state.overall_label.clone()
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(color))
        .percent(percent as u16)
        .label(label);
    f.render_widget(gauge, area);
}

fn slot_style(state: SlotState) -> (Color, &'static str) {
    match state {
        SlotState::Idle => (Color::DarkGray, "IDLE"),
        SlotState::Running => (Color::Cyan, "RUN"),
        SlotState::Paused => (Color::Yellow, "PAUSE"),
        SlotState::Done => (Color::Green, "OK"),
        SlotState::Failed => (Color::Red, "FAIL"),
        SlotState::Cancelled => (Color::Magenta, "CANC"),
    }
}

fn render_slots(f: &mut Frame, app: &App, slots: &[SlotView], area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!("Workers ({})", slots.len()));
    let inner = block.inner(area);
    f.render_widget(block, area);

    if slots.is_empty() {
        f.render_widget(Paragraph::new("No work queued"), inner);
        return;
    }

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Length(1); slots.len()])
        .split(inner);

    let name_width = (inner.width as usize).saturating_sub(20).max(10);
    for (view, row) in slots.iter().zip(rows.iter()) {
        let (color, tag) = slot_style(view.state);
        let percent = clamp_percent(view.percent);
        let mut style = Style::default().fg(color);
        if view.slot == app.selected {
            style = style.add_modifier(Modifier::BOLD | Modifier::REVERSED);
        }
        let label = format!(
            "{} {:<5} {:>3.0}% {}",
            view.slot + 1,
            tag,
            percent,
            truncate_string(&view.label, name_width)
        );
        let gauge = Gauge::default()
            .gauge_style(style)
            .percent(percent as u16)
            .label(label);
        f.render_widget(gauge, *row);
    }
}

fn render_log(f: &mut Frame, app: &App, area: Rect) {
    let state = app.state.lock().unwrap_or_else(|e| e.into_inner());
    let visible = area.height.saturating_sub(2) as usize;
    let width = area.width.saturating_sub(2) as usize;
    let items: Vec<ListItem> = state
        .log
        .iter()
        .skip(state.log.len().saturating_sub(visible))
        .map(|line| ListItem::new(Line::from(truncate_string(line, width))))
        .collect();
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(list, area);
}

/// Shorten to at most `max_len` characters, ending in "..." when cut
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
