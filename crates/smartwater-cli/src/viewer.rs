use std::io;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, Paragraph};
use ratatui::Terminal;
use smartwater_core::{
    BannerAction, Credentials, FeedTransport, FieldKind, OutcomeKind, PollSnapshot, Poller,
    FIELD_TABLE,
};
use tokio::sync::watch;

const CHANNEL_COLORS: [Color; 8] = [
    Color::Cyan,
    Color::Yellow,
    Color::Blue,
    Color::Green,
    Color::LightGreen,
    Color::Magenta,
    Color::Red,
    Color::LightYellow,
];

struct ChannelSeries {
    label: String,
    kind: FieldKind,
    color: Color,
    points: Vec<(f64, f64)>,
}

impl ChannelSeries {
    fn bounds(&self) -> [f64; 2] {
        if self.kind == FieldKind::Binary {
            return [-0.1, 1.1];
        }
        if self.points.is_empty() {
            return [0.0, 1.0];
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for (_, y) in &self.points {
            min = min.min(*y);
            max = max.max(*y);
        }
        if (max - min).abs() < f64::EPSILON {
            [min - 1.0, max + 1.0]
        } else {
            let pad = (max - min) * 0.12;
            [min - pad, max + pad]
        }
    }
}

struct ViewerState {
    latest: Option<PollSnapshot>,
    series: Vec<ChannelSeries>,
    span_sec: f64,
}

impl ViewerState {
    fn new() -> Self {
        Self {
            latest: None,
            series: build_series(),
            span_sec: 0.0,
        }
    }

    fn update(&mut self, snapshot: PollSnapshot) {
        let xs = sample_offsets(&snapshot);
        self.span_sec = xs.last().copied().unwrap_or(0.0);
        self.series = build_series();
        for (sample, x) in snapshot.series.iter().zip(xs.iter()) {
            for (idx, series) in self.series.iter_mut().enumerate() {
                if let Some(y) = sample.value(idx) {
                    series.points.push((*x, y));
                }
            }
        }
        self.latest = Some(snapshot);
    }
}

fn build_series() -> Vec<ChannelSeries> {
    FIELD_TABLE
        .iter()
        .zip(CHANNEL_COLORS)
        .enumerate()
        .map(|(idx, (field, color))| ChannelSeries {
            label: if field.unit.is_empty() {
                format!("F{} {}", idx + 1, field.label)
            } else {
                format!("F{} {} ({})", idx + 1, field.label, field.unit)
            },
            kind: field.kind,
            color,
            points: Vec::new(),
        })
        .collect()
}

/// Seconds since the first sample of the window, or the sample index when timestamps are unusable.
fn sample_offsets(snapshot: &PollSnapshot) -> Vec<f64> {
    let first = snapshot.series.first().and_then(|s| s.created_at);
    snapshot
        .series
        .iter()
        .enumerate()
        .map(|(idx, sample)| match (first, sample.created_at) {
            (Some(first), Some(ts)) => (ts - first).num_milliseconds() as f64 / 1000.0,
            _ => idx as f64,
        })
        .collect()
}

pub async fn run_viewer<T: FeedTransport + 'static>(
    poller: &mut Poller<T>,
    config: watch::Receiver<Credentials>,
    interval: Duration,
) -> Result<()> {
    let mut updates = poller.subscribe();
    poller.start(config, interval);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = ViewerState::new();
    let mut command_buffer = String::new();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') => break,
                        KeyCode::Char(c) => {
                            command_buffer.push(c.to_ascii_lowercase());
                            if command_buffer.len() > 8 {
                                let drain = command_buffer.len() - 8;
                                command_buffer.drain(0..drain);
                            }
                            if command_buffer.ends_with("exit") {
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

            if updates.has_changed().unwrap_or(false) {
                let snapshot = updates.borrow_and_update().clone();
                state.update(snapshot);
            }

            terminal.draw(|frame| draw_ui(frame.size(), frame, &state))?;
            tokio::task::yield_now().await;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    poller.stop();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, state: &ViewerState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(0)])
        .split(area);

    frame.render_widget(render_header(state), rows[0]);

    let chart_rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
        ])
        .split(rows[1]);

    let mut idx = 0;
    for row_area in chart_rows.iter().copied() {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(row_area);

        for col in cols.iter().copied() {
            if let Some(series) = state.series.get(idx) {
                render_channel_chart(frame, col, series, state.span_sec);
            }
            idx += 1;
        }
    }
}

fn banner_color(kind: OutcomeKind) -> Color {
    match kind {
        OutcomeKind::Ok => Color::Green,
        OutcomeKind::Empty => Color::Cyan,
        OutcomeKind::Unconfigured | OutcomeKind::Unreachable => Color::Yellow,
        OutcomeKind::Unauthorized | OutcomeKind::Unknown => Color::Red,
    }
}

fn action_hint(action: Option<BannerAction>) -> &'static str {
    match action {
        Some(BannerAction::OpenSettings) => "  -> run `smartwaterd configure`",
        Some(BannerAction::Login) => "  -> issue a new token",
        Some(BannerAction::Retry) => "  -> retrying on next tick",
        None => "",
    }
}

fn render_header(state: &ViewerState) -> Paragraph<'static> {
    let mut lines = Vec::new();
    let title = Span::styled(
        "Smart Water Telemetry  ",
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    );

    match state.latest.as_ref() {
        Some(snapshot) => {
            let status = match &snapshot.status {
                Some(banner) => Span::styled(
                    format!("{}{}", banner.message, action_hint(banner.action)),
                    Style::default().fg(banner_color(banner.kind)),
                ),
                None => Span::raw("Waiting first poll..."),
            };
            lines.push(Line::from(vec![title, status]));

            let m = &snapshot.latest;
            let levels = format!(
                "level={:.1}cm distance={:.1}cm runtime={:.2}h",
                m.level_cm,
                m.distance_cm,
                m.pump_runtime_hours,
            );
            let flags = format!(
                "pump={} buzzer={} object={} level_ok={} storage_ok={}",
                on_off(m.pump_on),
                on_off(m.buzzer_active),
                on_off(m.object_detected),
                on_off(m.level_ok),
                on_off(m.storage_ok),
            );
            lines.push(Line::from(format!("{levels} {flags}")));
            lines.push(Line::from(format!(
                "tick={} samples={} last_ok={}  (press 'q' to quit)",
                snapshot.tick,
                snapshot.series.len(),
                snapshot
                    .last_ok_ts
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
            )));
        }
        None => lines.push(Line::from(vec![title, Span::raw("Waiting first poll...")])),
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"))
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

fn render_channel_chart(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    series: &ChannelSeries,
    span_sec: f64,
) {
    let x_max = span_sec.max(1.0);
    let x_mid = x_max / 2.0;
    let y_bounds = series.bounds();

    let dataset = Dataset::default()
        .name(series.label.clone())
        .marker(symbols::Marker::Braille)
        .graph_type(ratatui::widgets::GraphType::Line)
        .style(Style::default().fg(series.color))
        .data(&series.points);

    let y_labels = match series.kind {
        FieldKind::Binary => vec![Span::raw("OFF"), Span::raw(""), Span::raw("ON")],
        FieldKind::Numeric => vec![
            Span::raw(format!("{:.1}", y_bounds[0])),
            Span::raw(format!("{:.1}", (y_bounds[0] + y_bounds[1]) / 2.0)),
            Span::raw(format!("{:.1}", y_bounds[1])),
        ],
    };

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(series.label.clone()))
        .x_axis(
            Axis::default()
                .title("window (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, x_max])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{x_mid:.0}")),
                    Span::raw(format!("{x_max:.0}")),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("value")
                .style(Style::default().fg(Color::Gray))
                .bounds(y_bounds)
                .labels(y_labels),
        );

    frame.render_widget(chart, area);
}
