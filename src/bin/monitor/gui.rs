use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    symbols,
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};
use std::{
    error::Error,
    io,
    time::{Duration, Instant},
};

use goertzel_link::{
    broadcaster::{LinkEvent, Subscription},
    frame_decoder::DecodedBatch,
    goertzel::GoertzelEngine,
};

struct App {
    events: Subscription,
    engine: GoertzelEngine,
    points: Vec<(f64, f64)>,
    frames: u64,
    status: String,
}

impl App {
    fn new(events: Subscription, engine: GoertzelEngine) -> App {
        App {
            events,
            engine,
            points: vec![],
            frames: 0,
            status: "Waiting for the node".to_owned(),
        }
    }

    fn on_tick(&mut self) {
        for event in self.events.drain() {
            match event {
                LinkEvent::Data(DecodedBatch::Goertzel(records)) => {
                    self.points = records
                        .iter()
                        .map(|r| {
                            let estimate = self.engine.node_estimate(r);
                            (estimate.frequency, estimate.power_g2)
                        })
                        .collect();
                    self.frames += 1;
                }
                LinkEvent::Data(DecodedBatch::Raw(text)) => {
                    self.status = format!("Node says: {}", text.lines().next().unwrap_or(""));
                }
                LinkEvent::Status { status } => self.status = status,
                LinkEvent::Error { error } => self.status = format!("Error: {}", error),
            }
        }
    }

    fn bounds(&self) -> ([f64; 2], [f64; 2]) {
        let max_freq = self.points.iter().map(|p| p.0).fold(0.0, f64::max);
        let max_power = self.points.iter().map(|p| p.1).fold(0.0, f64::max);
        (
            [0.0, (max_freq * 1.1).max(100.0)],
            [0.0, (max_power * 1.2).max(1e-6)],
        )
    }
}

pub fn engage_gui(events: Subscription, engine: GoertzelEngine) -> Result<(), Box<dyn Error>> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // create app and run it
    let tick_rate = Duration::from_millis(250);
    let app = App::new(events, engine);
    let res = run_app(&mut terminal, app, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    res?;
    Ok(())
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    tick_rate: Duration,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, &app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') = key.code {
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }
    }
}

fn labels(bounds: [f64; 2], precision: usize) -> Vec<Span<'static>> {
    (0..=4)
        .map(|i| bounds[0] + (bounds[1] - bounds[0]) * f64::from(i) / 4.0)
        .map(|v| Span::from(format!("{:.*}", precision, v)))
        .collect()
}

fn ui(f: &mut Frame, app: &App) {
    let areas = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(3)])
        .split(f.size());
    let (x_bounds, y_bounds) = app.bounds();

    let chart = Chart::new(vec![Dataset::default()
        .name("Node power (g²)")
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Magenta))
        .data(&app.points)])
    .block(
        Block::default()
            .title(format!(" Goertzel monitor: {} frames ", app.frames))
            .borders(Borders::ALL),
    )
    .x_axis(
        Axis::default()
            .title(Span::styled("Frequency (Hz)", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds(x_bounds)
            .labels(labels(x_bounds, 0)),
    )
    .y_axis(
        Axis::default()
            .title(Span::styled("Power (g²)", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds(y_bounds)
            .labels(labels(y_bounds, 6)),
    );

    let status = Paragraph::new(app.status.as_str())
        .block(Block::default().title(" Link (q to quit) ").borders(Borders::ALL));

    f.render_widget(chart, areas[0]);
    f.render_widget(status, areas[1]);
}
