//! One consumer attached to the link.
//!
//! A consumer talks to the link with small JSON commands:
//!
//! ```text
//! {"command":"connect","comPort":"/dev/ttyACM0","baudRate":115200}
//! {"command":"disconnect"}
//! ```
//!
//! and hears back through the [`Broadcaster`]. State changes go to every
//! consumer; a command that could not be carried out is answered only to
//! the consumer that sent it. When a session ends the link is closed, the
//! same as a consumer walking away from the node.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

use crate::broadcaster::{LinkEvent, Subscription};
use crate::serial_link::{LinkError, PortOpener, SerialLinkManager};

/// How long a closing session waits for another consumer's connect or
/// disconnect to finish before giving up on closing the link.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A request from a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    /// Open a port, replacing any open one
    Connect {
        /// Device path
        #[serde(rename = "comPort")]
        com_port: String,
        /// Baud rate
        #[serde(rename = "baudRate")]
        baud_rate: u32,
    },
    /// Close the open port
    Disconnect,
}

/// Why a command was not carried out.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The message was not a valid command
    #[error("{0}")]
    Parse(#[from] serde_json::Error),
    /// The link refused the command
    #[error("{0}")]
    Link(#[from] LinkError),
}

impl Command {
    /// Parses one JSON message.
    pub fn parse(message: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(message.trim())?)
    }
}

/// A consumer's connection to the link: its own event stream plus the
/// ability to issue commands.
pub struct Session<O: PortOpener> {
    link: Arc<SerialLinkManager<O>>,
    events: Subscription,
}

impl<O: PortOpener> Session<O> {
    /// Attaches a new consumer.
    pub fn open(link: Arc<SerialLinkManager<O>>) -> Self {
        let events = link.broadcaster().subscribe();
        info!("Session {} opened", events.id());
        Self { link, events }
    }

    /// Events for this consumer.
    pub fn events(&self) -> &Subscription {
        &self.events
    }

    /// Carries out a command.
    pub fn execute(&self, command: &Command) -> Result<(), LinkError> {
        debug!("Session {} executing {:?}", self.events.id(), command);
        match command {
            Command::Connect {
                com_port,
                baud_rate,
            } => self.link.connect(com_port, *baud_rate),
            Command::Disconnect => self.link.disconnect(),
        }
    }

    /// Handles one raw message. Failures are answered on this session's
    /// own stream and returned.
    pub fn handle(&self, message: &str) -> Result<(), SessionError> {
        let result =
            Command::parse(message).and_then(|c| self.execute(&c).map_err(SessionError::from));
        if let Err(e) = &result {
            warn!("Session {} message failed: {}", self.events.id(), e);
            self.link.broadcaster().send_to(
                self.events.id(),
                LinkEvent::error(format!("Error processing message: {}", e)),
            );
        }
        result
    }
}

impl<O: PortOpener> Drop for Session<O> {
    fn drop(&mut self) {
        info!("Session {} closed", self.events.id());
        self.link.broadcaster().unsubscribe(self.events.id());
        if let Err(e) = self.link.disconnect_within(CLOSE_TIMEOUT) {
            warn!("Error disconnecting on session close: {}", e);
        }
    }
}
