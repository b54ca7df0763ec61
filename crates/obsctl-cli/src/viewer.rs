use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use obsctl_core::{ControllerStatus, HealthStatus, ObsState, ObservationController, TransportAdapter};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, Paragraph};
use ratatui::Terminal;

const SAMPLE_EVERY: Duration = Duration::from_millis(250);

struct Series {
    label: &'static str,
    color: Color,
    points: VecDeque<(f64, f64)>,
}

impl Series {
    fn new(label: &'static str, color: Color) -> Self {
        Self {
            label,
            color,
            points: VecDeque::new(),
        }
    }

    fn push(&mut self, x: f64, y: f64, window_sec: f64) {
        self.points.push_back((x, y));
        while let Some((old_x, _)) = self.points.front() {
            if x - old_x > window_sec {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    fn upper_bound(&self) -> f64 {
        self.points
            .iter()
            .map(|(_, y)| *y)
            .fold(1.0, f64::max)
            .ceil()
    }
}

struct ViewerState {
    start: Instant,
    latest: Option<ControllerStatus>,
    severity: Series,
    pending: Series,
}

impl ViewerState {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            latest: None,
            severity: Series::new("health (0 ok .. 3 failed)", Color::Red),
            pending: Series::new("pending commands", Color::Cyan),
        }
    }

    fn update(&mut self, status: ControllerStatus, window_sec: f64) {
        let t = self.start.elapsed().as_secs_f64();
        self.severity.push(t, severity(status.aggregated_status), window_sec);
        self.pending.push(t, status.pending.len() as f64, window_sec);
        self.latest = Some(status);
    }
}

fn severity(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Ok => 0.0,
        HealthStatus::Unknown => 1.0,
        HealthStatus::Degraded => 2.0,
        HealthStatus::Failed => 3.0,
    }
}

fn state_color(state: ObsState) -> Color {
    match state {
        ObsState::Fault => Color::Red,
        ObsState::Aborting | ObsState::Aborted => Color::Magenta,
        ObsState::Scanning => Color::Green,
        ObsState::Ready | ObsState::Idle => Color::Cyan,
        _ => Color::Yellow,
    }
}

fn health_color(status: HealthStatus) -> Color {
    match status {
        HealthStatus::Ok => Color::Green,
        HealthStatus::Degraded => Color::Yellow,
        HealthStatus::Failed => Color::Red,
        HealthStatus::Unknown => Color::Gray,
    }
}

const COMMAND_BUFFER_CHARS: usize = 8;

/// Appends a typed key to the rolling command buffer, trimming by characters.
/// Returns true once the buffer spells `exit`.
pub(crate) fn push_key(buffer: &mut String, c: char) -> bool {
    buffer.extend(c.to_lowercase());
    let excess = buffer.chars().count().saturating_sub(COMMAND_BUFFER_CHARS);
    if excess > 0 {
        *buffer = buffer.chars().skip(excess).collect();
    }
    buffer.ends_with("exit")
}

pub async fn run_viewer<T: TransportAdapter>(
    controller: &ObservationController<T>,
    window_sec: f64,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = ViewerState::new();
    let mut next_sample = Instant::now();
    let mut command_buffer = String::new();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') => break,
                        KeyCode::Char(c) => {
                            if push_key(&mut command_buffer, c) {
                                break;
                            }
                        }
                        KeyCode::Backspace => {
                            command_buffer.pop();
                        }
                        _ => {}
                    }
                }
            }

            if Instant::now() >= next_sample {
                state.update(controller.status(), window_sec);
                next_sample = Instant::now() + SAMPLE_EVERY;
            }

            terminal.draw(|frame| draw_ui(frame.size(), frame, &state, window_sec))?;
            tokio::task::yield_now().await;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, state: &ViewerState, window_sec: f64) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Percentage(45),
            Constraint::Min(0),
        ])
        .split(area);

    frame.render_widget(render_header(state, window_sec), rows[0]);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[1]);
    frame.render_widget(render_devices(state), middle[0]);
    frame.render_widget(render_activity(state, middle[1].height), middle[1]);

    let charts = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[2]);
    let now_sec = state.start.elapsed().as_secs_f64();
    render_chart(frame, charts[0], &state.severity, now_sec, window_sec, Some(3.0));
    render_chart(frame, charts[1], &state.pending, now_sec, window_sec, None);
}

fn render_header(state: &ViewerState, window_sec: f64) -> Paragraph<'static> {
    let mut lines = Vec::new();
    if let Some(status) = &state.latest {
        let timer = if status.scan_timer.active {
            format!(
                "scan window {} ends in {:.1}s",
                status.scan_timer.window_id.unwrap_or_default(),
                status.scan_timer.remaining_ms.unwrap_or_default() as f64 / 1000.0
            )
        } else {
            "no scan window".to_string()
        };
        lines.push(Line::from(vec![
            Span::styled(
                format!("{}  ", status.observation_id),
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                status.observation_state.as_str(),
                Style::default()
                    .fg(state_color(status.observation_state))
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw("  health="),
            Span::styled(
                status.aggregated_status.as_str(),
                Style::default().fg(health_color(status.aggregated_status)),
            ),
            Span::raw(format!("  {timer}  pending={}", status.pending.len())),
        ]));
        lines.push(Line::from(format!(
            "{}  window={}s  (press 'q' to quit)",
            status.last_activity.as_deref().unwrap_or("no activity yet"),
            window_sec as u64
        )));
    } else {
        lines.push(Line::from("Waiting first status..."));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Observation"))
}

fn render_devices(state: &ViewerState) -> Paragraph<'static> {
    let mut lines = Vec::new();
    if let Some(status) = &state.latest {
        for device in &status.devices {
            let liveness = if device.responsive {
                Span::styled("up  ", Style::default().fg(Color::Green))
            } else {
                Span::styled("DOWN", Style::default().fg(Color::Red).add_modifier(Modifier::BOLD))
            };
            lines.push(Line::from(vec![
                liveness,
                Span::raw(format!(" {:<12} ", device.id)),
                Span::styled(
                    format!("{:<9}", device.status.as_str()),
                    Style::default().fg(health_color(device.status)),
                ),
                Span::raw(format!(
                    " {:<11}{}",
                    device.obs_state.map(|s| s.as_str()).unwrap_or("-"),
                    if device.required { "" } else { " (optional)" }
                )),
            ]));
        }
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Subordinates"))
}

fn render_activity(state: &ViewerState, height: u16) -> Paragraph<'static> {
    let visible = usize::from(height.saturating_sub(2));
    let lines: Vec<Line> = state
        .latest
        .iter()
        .flat_map(|status| status.activity.iter().rev().take(visible))
        .map(|entry| {
            Line::from(vec![
                Span::styled(
                    entry.ts.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::Gray),
                ),
                Span::raw(entry.message.clone()),
            ])
        })
        .collect();

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Activity"))
}

fn render_chart(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    series: &Series,
    now_sec: f64,
    window_sec: f64,
    y_max: Option<f64>,
) {
    let points: Vec<(f64, f64)> = series.points.iter().copied().collect();

    let x_min = (now_sec - window_sec).max(0.0);
    let x_max = now_sec.max(window_sec);
    let x_mid = (x_min + x_max) / 2.0;
    let y_top = y_max.unwrap_or_else(|| series.upper_bound());

    let dataset = Dataset::default()
        .name(series.label)
        .marker(symbols::Marker::Braille)
        .graph_type(ratatui::widgets::GraphType::Line)
        .style(Style::default().fg(series.color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(series.label))
        .x_axis(
            Axis::default()
                .title("time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([x_min, x_max])
                .labels(vec![
                    Span::raw(format!("{x_min:.0}")),
                    Span::raw(format!("{x_mid:.0}")),
                    Span::raw(format!("{x_max:.0}")),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, y_top])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", y_top / 2.0)),
                    Span::raw(format!("{y_top:.0}")),
                ]),
        );

    frame.render_widget(chart, area);
}
