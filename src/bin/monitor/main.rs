mod gui;

use clap::Parser;
use goertzel_link::{
    args::MonitorArgs,
    broadcaster::Broadcaster,
    config::Settings,
    dummy_node::{DummyNode, DummyOpener},
    goertzel::GoertzelEngine,
    gui::device_selector,
    serial_link::{available_ports, PortOpener, SerialLinkManager, SerialOpener},
};
use gui::engage_gui;
use log::warn;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = MonitorArgs::parse();
    let settings = match &args.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::default(),
    };

    if args.simulate {
        let opener = DummyOpener::new(DummyNode::builder().set_sensor(settings.sensor.clone()));
        run(opener, &settings, &args)
    } else {
        run(SerialOpener, &settings, &args)
    }
}

fn run<O: PortOpener>(
    opener: O,
    settings: &Settings,
    args: &MonitorArgs,
) -> Result<(), Box<dyn Error>> {
    let path = match (&args.port, args.simulate) {
        (Some(port), _) => port.clone(),
        (None, true) => "simulated".to_owned(),
        (None, false) => match device_selector(available_ports()?)? {
            Some(path) => path.to_string_lossy().into_owned(),
            None => return Ok(()),
        },
    };

    let broadcaster = Broadcaster::new();
    let events = broadcaster.subscribe();
    let link = SerialLinkManager::new(opener, broadcaster, settings.link.clone());

    // A failed connect is shown in the status bar, so keep going.
    if let Err(e) = link.connect(&path, args.baud) {
        warn!("Could not connect to {}: {}", path, e);
    }

    engage_gui(events, GoertzelEngine::new(settings.sensor.clone()))?;

    link.disconnect()?;
    Ok(())
}
