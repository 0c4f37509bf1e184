use std::{io::stdout, path::PathBuf, time::Duration};

use crate::gui::error::TuiError;
use crate::serial_link::PortInfo;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

fn describe(port: &PortInfo) -> String {
    let extra: Vec<&str> = [&port.manufacturer, &port.serial_number]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect();
    if extra.is_empty() {
        port.path.to_string_lossy().into_owned()
    } else {
        format!("{} ({})", port.path.to_string_lossy(), extra.join(", "))
    }
}

/// Lets the user pick one of `available_ports` with the arrow keys.
/// Returns `None` when the user quits without choosing.
pub fn device_selector(mut available_ports: Vec<PortInfo>) -> Result<Option<PathBuf>, TuiError> {
    if available_ports.is_empty() {
        return Err(TuiError::NoDevices);
    }

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let result = select(&available_ports);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(result?.map(|i| available_ports.swap_remove(i).path))
}

fn select(available_ports: &[PortInfo]) -> Result<Option<usize>, TuiError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    let n_ports = available_ports.len();
    loop {
        let title = Title::from(" Device Selector ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let list = List::new(available_ports.iter().map(describe))
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(cursor));
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Down => cursor = (cursor + 1) % n_ports,
                        KeyCode::Up => cursor = (cursor + n_ports - 1) % n_ports,
                        KeyCode::Enter => return Ok(Some(cursor)),
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(None),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_ports_with_and_without_metadata() {
        let mut port = PortInfo {
            path: PathBuf::from("/dev/ttyACM0"),
            manufacturer: None,
            serial_number: None,
            vendor_id: None,
            product_id: None,
        };
        assert_eq!(describe(&port), "/dev/ttyACM0");

        port.manufacturer = Some("Texas Instruments".to_owned());
        port.serial_number = Some("0A1B".to_owned());
        assert_eq!(describe(&port), "/dev/ttyACM0 (Texas Instruments, 0A1B)");
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(device_selector(vec![]), Err(TuiError::NoDevices)));
    }
}
