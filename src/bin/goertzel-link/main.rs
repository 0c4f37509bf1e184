//! Command line front-end: list ports, stream a node's output as JSON lines,
//! bridge JSON commands to the link, and run the offline analyses.

use clap::Parser;
use goertzel_link::{
    args::{
        BridgeCommand, CommandTask, CompareCommand, LinkArgs, ListenCommand, ScenarioCommand,
    },
    broadcaster::{Broadcaster, LinkEvent},
    comparison::{ComparisonAnalyzer, ComparisonOptions, ComparisonReport},
    config::Settings,
    dummy_node::{DummyNode, DummyOpener},
    gui::device_selector,
    recording::{load_goertzel_table, load_samples},
    scenario::{analyze, Metric, ScenarioAnalysis, MEASURED_SIZES},
    serial_link::{available_ports, PortOpener, SerialLinkManager, SerialOpener},
    session::Session,
};

use crossbeam_channel::Receiver;
use log::{debug, info};
use std::{
    error::Error,
    io::{self, BufRead, Write},
    sync::Arc,
    thread::{self, JoinHandle},
};

// Example:
// cargo run --bin goertzel-link -- listen --port /dev/ttyACM0 --baud 115200
// cargo run --bin goertzel-link -- compare --samples raw.csv --table node.tsv

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = LinkArgs::parse();

    let settings = match &args.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::default(),
    };

    match args.command {
        CommandTask::Ports => list_ports()?,
        CommandTask::Listen(cmd) => {
            if cmd.simulate {
                listen(simulator(&settings), &settings, &cmd)?
            } else {
                listen(SerialOpener, &settings, &cmd)?
            }
        }
        CommandTask::Bridge(BridgeCommand { simulate }) => {
            if simulate {
                bridge(simulator(&settings), &settings)?
            } else {
                bridge(SerialOpener, &settings)?
            }
        }
        CommandTask::Compare(cmd) => compare(&settings, &cmd)?,
        CommandTask::Scenario(cmd) => scenario(&cmd),
        CommandTask::DefaultConfig => println!("{}", Settings::default().to_ron()?),
    }

    Ok(())
}

fn simulator(settings: &Settings) -> DummyOpener {
    DummyOpener::new(DummyNode::builder().set_sensor(settings.sensor.clone()))
}

fn list_ports() -> io::Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial devices found");
    }
    for port in ports {
        print!("{}", port.path.to_string_lossy());
        if let Some(manufacturer) = &port.manufacturer {
            print!("\t{}", manufacturer);
        }
        println!();
    }
    Ok(())
}

/// Writes every event from `events` to stdout as one JSON line until the
/// channel closes.
fn spawn_printer(events: Receiver<LinkEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events.iter() {
            let line = match event.to_json() {
                Ok(line) => line,
                Err(e) => {
                    debug!("Could not serialize {:?}: {}", event, e);
                    continue;
                }
            };
            let mut stdout = io::stdout().lock();
            if writeln!(stdout, "{}", line).and_then(|_| stdout.flush()).is_err() {
                break;
            }
        }
    })
}

/// Blocks until stdin reaches end of file, handing every line to `on_line`.
fn until_eof(mut on_line: impl FnMut(&str)) -> io::Result<()> {
    for line in io::stdin().lock().lines() {
        let line = line?;
        if !line.trim().is_empty() {
            on_line(&line);
        }
    }
    Ok(())
}

fn listen<O: PortOpener>(
    opener: O,
    settings: &Settings,
    cmd: &ListenCommand,
) -> Result<(), Box<dyn Error>> {
    let path = match (&cmd.port, cmd.simulate) {
        (Some(port), _) => port.clone(),
        (None, true) => "simulated".to_owned(),
        (None, false) => match device_selector(available_ports()?)? {
            Some(path) => path.to_string_lossy().into_owned(),
            None => return Ok(()),
        },
    };

    let broadcaster = Broadcaster::new();
    let subscription = broadcaster.subscribe();
    let printer = spawn_printer(subscription.receiver().clone());
    let link = SerialLinkManager::new(opener, broadcaster.clone(), settings.link.clone());

    let connected = link.connect(&path, cmd.baud);
    if connected.is_ok() {
        info!("Listening on {}; end input (Ctrl-D) to stop", path);
        until_eof(|_| {})?;
    }

    let disconnected = link.disconnect();
    broadcaster.unsubscribe(subscription.id());
    drop(subscription);
    if printer.join().is_err() {
        debug!("Printer thread panicked");
    }

    connected?;
    disconnected?;
    Ok(())
}

fn bridge<O: PortOpener>(opener: O, settings: &Settings) -> Result<(), Box<dyn Error>> {
    let link = Arc::new(SerialLinkManager::new(
        opener,
        Broadcaster::new(),
        settings.link.clone(),
    ));
    let session = Session::open(Arc::clone(&link));
    let printer = spawn_printer(session.events().receiver().clone());

    until_eof(|line| {
        if let Err(e) = session.handle(line) {
            debug!("Command {:?} failed: {}", line, e);
        }
    })?;

    drop(session);
    if printer.join().is_err() {
        debug!("Printer thread panicked");
    }
    Ok(())
}

fn compare(settings: &Settings, cmd: &CompareCommand) -> Result<(), Box<dyn Error>> {
    let samples = load_samples(&cmd.samples)?;
    let records = load_goertzel_table(&cmd.table)?;
    info!(
        "Loaded {} samples and {} Goertzel rows",
        samples.len(),
        records.len()
    );

    let analyzer = ComparisonAnalyzer::new(settings.sensor.clone());
    let options = ComparisonOptions {
        freq_limit: Some(cmd.freq_limit),
        selected: cmd.selected.clone(),
    };
    let report = analyzer.run(&samples, &records, &options)?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ComparisonReport) {
    println!(
        "{:>10}  {:>12}  {:>12}  {:>12}  {:>8}",
        "Freq (Hz)", "DFT (g²)", "Edge (g²)", "Node (g²)", "Diff (%)"
    );
    for row in &report.rows {
        println!(
            "{:>10.1}  {:>12.5}  {:>12.5}  {:>12.5}  {:>8.1}",
            row.frequency,
            row.reference.power_g2,
            row.edge.power_g2,
            row.node.power_g2,
            row.difference_percent
        );
    }

    if let Some(mean) = report.mean_abs_difference() {
        println!("\nMean |difference|: {:.2}%", mean);
    }
    match report.correlation {
        Some(c) => println!(
            "Pearson r (node vs edge): {:.4}, p = {:.3e}, n = {}",
            c.r, c.p_value, c.n
        ),
        None => println!("Pearson r (node vs edge): not enough rows"),
    }
    if let Some(model) = report.regression {
        let r_squared = model
            .r_squared
            .map_or("undefined".to_owned(), |r| format!("{:.4}", r));
        println!(
            "Node = {:.4} x Edge + {:.3e} (R² {})",
            model.slope, model.intercept, r_squared
        );
    }
}

fn scenario(cmd: &ScenarioCommand) {
    let metric = if cmd.latency {
        Metric::Latency
    } else {
        Metric::Energy
    };
    let sizes = if cmd.sizes.is_empty() {
        MEASURED_SIZES.to_vec()
    } else {
        cmd.sizes.clone()
    };
    print_scenario(&analyze(metric, &sizes));
}

fn print_scenario(analysis: &ScenarioAnalysis) {
    let unit = analysis.metric.unit();
    println!(
        "{:>6}  {:>14}  {:>14}  {:>12}  {:>8}",
        "Size",
        format!("Streaming ({})", unit),
        format!("On node ({})", unit),
        format!("Saved ({})", unit),
        "Saved %"
    );
    for p in &analysis.points {
        println!(
            "{:>6}  {:>14.3}  {:>14.3}  {:>12.3}  {:>7.1}%{}",
            p.size,
            p.streaming,
            p.on_node,
            p.savings,
            p.savings_percent,
            if p.extrapolated { "  (extrapolated)" } else { "" }
        );
    }

    if let Some(summary) = analysis.summary {
        println!(
            "\nAverage saving: {:.3} {} ({:.1}%)",
            summary.average_savings, unit, summary.average_savings_percent
        );
    }
    if let Some(regression) = analysis.regression {
        for (name, model) in [
            ("Streaming", regression.streaming),
            ("On node", regression.on_node),
        ] {
            println!(
                "{}: {:.4} {}/sample + {:.4} (R² {})",
                name,
                model.slope,
                unit,
                model.intercept,
                model
                    .r_squared
                    .map_or("undefined".to_owned(), |r| format!("{:.4}", r))
            );
        }
    }
}
