//! Owns the one serial connection to the sensor node.
//!
//! A link moves through `Closed -> Opening -> Open -> Closing -> Closed`.
//! A failed attempt passes through `Error` and lands back in `Closed`. Only
//! one transition runs at a time: each one holds the manager's in-flight
//! guard for its whole duration, and a second caller is turned away with
//! [`LinkError::LinkBusy`] instead of queueing behind it.
//!
//! While a link is open a reader thread pulls bytes off the port, feeds them
//! to a [`FrameDecoder`] and publishes every decoded batch on the
//! [`Broadcaster`]. If the port fails underneath us (the node was unplugged,
//! say) the reader tears the connection down itself and reports an error.

use log::{debug, error, info, trace, warn};
use serde::Serialize;
use serial2::SerialPort;
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::broadcaster::{Broadcaster, LinkEvent};
use crate::config::LinkConfig;
use crate::frame_decoder::FrameDecoder;

const READ_CHUNK: usize = 256;
const GUARD_RETRY: Duration = Duration::from_millis(5);

/// Failures of link transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Another transition is still in flight
    #[error("link is busy with another connect or disconnect")]
    LinkBusy,
    /// The requested baud rate is not one of the accepted rates
    #[error("unsupported baud rate {0}")]
    InvalidBaudRate(u32),
    /// The transport refused to open the port
    #[error("Error opening serial port: {0}")]
    OpenFailed(String),
    /// The transport reported an error while closing the port
    #[error("Error closing serial port: {0}")]
    CloseFailed(String),
}

/// Where the link is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// No port is open
    Closed,
    /// A port is being opened
    Opening,
    /// A port is open and being read
    Open,
    /// The open port is being flushed and closed
    Closing,
    /// The current attempt failed. Held only while the failure is being
    /// recorded: the link is back in `Closed` before the failing call
    /// returns and before the `{error}` event goes out, so [`state`] never
    /// reports it.
    ///
    /// [`state`]: SerialLinkManager::state
    Error,
}

/// The operations the link needs from an open port.
pub trait LinkPort: Send + Sync + 'static {
    /// Reads whatever is available. Timeouts are reported as
    /// [`io::ErrorKind::TimedOut`] and are not treated as failures.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drives the DTR handshake line.
    fn set_dtr(&self, asserted: bool) -> io::Result<()>;

    /// Waits until everything written has left the port.
    fn flush(&self) -> io::Result<()>;

    /// Closes the port.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Opens ports for the link.
pub trait PortOpener {
    /// The port type produced.
    type Port: LinkPort;

    /// Opens `path` at `baud_rate`, with reads timing out after
    /// `read_timeout`.
    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Self::Port>;
}

/// Opens real serial devices through [serial2].
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    type Port = SerialPort;

    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<SerialPort> {
        let mut port = SerialPort::open(path, baud_rate)?;
        port.set_read_timeout(read_timeout)?;
        Ok(port)
    }
}

impl LinkPort for SerialPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        SerialPort::read(self, buf)
    }

    fn set_dtr(&self, asserted: bool) -> io::Result<()> {
        SerialPort::set_dtr(self, asserted)
    }

    fn flush(&self) -> io::Result<()> {
        SerialPort::flush(self)
    }

    fn close(self) -> io::Result<()> {
        // serial2 closes the file descriptor on drop.
        drop(self);
        Ok(())
    }
}

/// A serial device the platform reports as present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Device path, e.g. `/dev/ttyACM0` or `COM3`
    pub path: PathBuf,
    /// Manufacturer string, when the backend reports one
    pub manufacturer: Option<String>,
    /// Serial number, when the backend reports one
    pub serial_number: Option<String>,
    /// USB vendor id, when the backend reports one
    pub vendor_id: Option<String>,
    /// USB product id, when the backend reports one
    pub product_id: Option<String>,
}

impl PortInfo {
    fn from_path(path: PathBuf) -> Self {
        Self {
            path,
            manufacturer: None,
            serial_number: None,
            vendor_id: None,
            product_id: None,
        }
    }
}

/// Lists the serial devices currently present.
pub fn available_ports() -> io::Result<Vec<PortInfo>> {
    Ok(SerialPort::available_ports()?
        .into_iter()
        .map(PortInfo::from_path)
        .collect())
}

/// The open connection. There is at most one per manager.
struct Connection<P> {
    id: u64,
    path: String,
    baud_rate: u32,
    port: Arc<P>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

struct LinkInner<P> {
    state: LinkState,
    connection: Option<Connection<P>>,
}

/// State shared between the manager and its reader thread.
struct Shared<P> {
    in_flight: AtomicBool,
    inner: Mutex<LinkInner<P>>,
    broadcaster: Broadcaster,
    next_id: AtomicU64,
}

/// Held for the duration of one transition.
struct TransitionGuard<'a>(&'a AtomicBool);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: LinkPort> Shared<P> {
    fn try_begin(&self) -> Option<TransitionGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TransitionGuard(&self.in_flight))
    }

    fn inner(&self) -> MutexGuard<'_, LinkInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, state: LinkState, status: String) {
        self.inner().state = state;
        info!("Link {:?}: {}", state, status);
        self.broadcaster.publish(LinkEvent::status(status));
    }

    /// Passes through `Error` back to `Closed` under one lock.
    fn mark_failed(&self, message: &str) {
        let mut inner = self.inner();
        inner.state = LinkState::Error;
        error!("Link {:?}: {}", LinkState::Error, message);
        inner.state = LinkState::Closed;
        debug!("Link {:?} after failure", LinkState::Closed);
    }

    fn fail(&self, message: String) {
        self.mark_failed(&message);
        self.broadcaster.publish(LinkEvent::error(message));
    }

    /// Closes the current connection, if any. The caller holds the guard
    /// and is not the reader thread.
    fn close_current(&self) -> Result<(), LinkError> {
        let Some(mut connection) = self.inner().connection.take() else {
            return Ok(());
        };

        self.enter(LinkState::Closing, format!("Closing {}", connection.path));

        connection.stop.store(true, Ordering::Release);
        if let Some(reader) = connection.reader.take() {
            if reader.join().is_err() {
                warn!("Reader for {} panicked", connection.path);
            }
        }

        match release_port(connection.port) {
            Ok(()) => {
                self.enter(
                    LinkState::Closed,
                    "Serial port successfully closed".to_owned(),
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(format!("Error closing serial port: {}", reason));
                Err(LinkError::CloseFailed(reason))
            }
        }
    }

    /// Called by the reader of connection `id` when its port fails.
    fn transport_failed(&self, id: u64, stop: &AtomicBool, reason: io::Error) {
        // Wait for any transition in flight. If that transition is tearing
        // this connection down it raises `stop` before joining us, and the
        // teardown is then its job.
        let guard = loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match self.try_begin() {
                Some(guard) => break guard,
                None => thread::sleep(GUARD_RETRY),
            }
        };

        let connection = {
            let mut inner = self.inner();
            if inner.connection.as_ref().is_some_and(|c| c.id == id) {
                inner.connection.take()
            } else {
                None
            }
        };
        let Some(connection) = connection else {
            return;
        };

        // We are the reader, so there is nothing to join.
        drop(connection.reader);
        if let Err(e) = release_port(connection.port) {
            debug!("Closing failed port {}: {}", connection.path, e);
        }
        let message = format!(
            "Serial Port Error on {}: {}; link closed",
            connection.path, reason
        );
        self.mark_failed(&message);
        drop(guard);
        self.broadcaster.publish(LinkEvent::error(message));
    }
}

fn release_port<P: LinkPort>(port: Arc<P>) -> io::Result<()> {
    let flushed = port.flush();
    let closed = match Arc::try_unwrap(port) {
        Ok(port) => port.close(),
        // Someone still holds a handle; the port closes when it lets go.
        Err(_shared) => Ok(()),
    };
    flushed.and(closed)
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn spawn_reader<P: LinkPort>(
    shared: Arc<Shared<P>>,
    id: u64,
    port: Arc<P>,
    stop: Arc<AtomicBool>,
    max_frame_bytes: usize,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("link-reader-{id}"))
        .spawn(move || {
            let mut decoder = FrameDecoder::new(max_frame_bytes);
            let mut buffer = [0u8; READ_CHUNK];

            while !stop.load(Ordering::Acquire) {
                match port.read(&mut buffer) {
                    Ok(0) => continue,
                    Ok(n) => {
                        trace!("Read {} bytes", n);
                        if let Some(batch) = decoder.feed(&buffer[..n]) {
                            shared.broadcaster.publish(LinkEvent::Data(batch));
                        }
                    }
                    Err(e) if is_idle(&e) => continue,
                    Err(e) => {
                        drop(port);
                        shared.transport_failed(id, &stop, e);
                        return;
                    }
                }
            }

            if let Some(batch) = decoder.flush() {
                shared.broadcaster.publish(LinkEvent::Data(batch));
            }
            debug!("Reader {} stopped", id);
        })
}

/// The single owner of the serial connection.
pub struct SerialLinkManager<O: PortOpener> {
    opener: O,
    config: LinkConfig,
    shared: Arc<Shared<O::Port>>,
}

impl<O: PortOpener> SerialLinkManager<O> {
    /// A closed link that opens ports with `opener` and reports on
    /// `broadcaster`.
    pub fn new(opener: O, broadcaster: Broadcaster, config: LinkConfig) -> Self {
        Self {
            opener,
            config,
            shared: Arc::new(Shared {
                in_flight: AtomicBool::new(false),
                inner: Mutex::new(LinkInner {
                    state: LinkState::Closed,
                    connection: None,
                }),
                broadcaster,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The broadcaster this link reports on.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.shared.broadcaster
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.shared.inner().state
    }

    /// Path and baud rate of the open connection.
    pub fn connection(&self) -> Option<(String, u32)> {
        self.shared
            .inner()
            .connection
            .as_ref()
            .map(|c| (c.path.clone(), c.baud_rate))
    }

    /// Opens `path` at `baud_rate`, closing the current connection first if
    /// there is one.
    ///
    /// DTR is deasserted right after opening: the node's reset line hangs
    /// off it, and leaving it asserted would reboot the node on every
    /// connect. Failing to do so is logged but does not fail the connect.
    pub fn connect(&self, path: &str, baud_rate: u32) -> Result<(), LinkError> {
        if !self.config.accepts(baud_rate) {
            return Err(LinkError::InvalidBaudRate(baud_rate));
        }
        let _guard = self.shared.try_begin().ok_or(LinkError::LinkBusy)?;

        self.shared.close_current()?;

        self.shared.enter(
            LinkState::Opening,
            format!("Opening {} at {} baud", path, baud_rate),
        );

        let port = match self
            .opener
            .open(path, baud_rate, self.config.read_timeout())
        {
            Ok(port) => port,
            Err(e) => {
                let reason = e.to_string();
                self.shared
                    .fail(format!("Error opening serial port: {}", reason));
                return Err(LinkError::OpenFailed(reason));
            }
        };

        match port.set_dtr(false) {
            Ok(()) => info!("DTR disabled on {} to keep the node out of reset", path),
            Err(e) => warn!("Failed to disable DTR on {}: {}", path, e),
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let port = Arc::new(port);
        let stop = Arc::new(AtomicBool::new(false));
        let reader = match spawn_reader(
            Arc::clone(&self.shared),
            id,
            Arc::clone(&port),
            Arc::clone(&stop),
            self.config.max_frame_bytes,
        ) {
            Ok(reader) => reader,
            Err(e) => {
                let reason = format!("could not start reader: {}", e);
                if let Err(close_err) = release_port(port) {
                    debug!("Closing {} after failed start: {}", path, close_err);
                }
                self.shared
                    .fail(format!("Error opening serial port: {}", reason));
                return Err(LinkError::OpenFailed(reason));
            }
        };

        self.shared.inner().connection = Some(Connection {
            id,
            path: path.to_owned(),
            baud_rate,
            port,
            stop,
            reader: Some(reader),
        });
        self.shared.enter(
            LinkState::Open,
            format!("Connected to {} at {} baud", path, baud_rate),
        );
        Ok(())
    }

    /// Flushes and closes the open connection. Does nothing, successfully,
    /// when there is none.
    pub fn disconnect(&self) -> Result<(), LinkError> {
        let _guard = self.shared.try_begin().ok_or(LinkError::LinkBusy)?;
        self.shared.close_current()
    }

    /// Like [`disconnect`](Self::disconnect), but waits up to `timeout` for a
    /// transition already in flight to finish instead of failing with
    /// `LinkBusy` straight away.
    pub fn disconnect_within(&self, timeout: Duration) -> Result<(), LinkError> {
        let deadline = Instant::now() + timeout;
        let _guard = loop {
            match self.shared.try_begin() {
                Some(guard) => break guard,
                None if Instant::now() >= deadline => return Err(LinkError::LinkBusy),
                None => thread::sleep(GUARD_RETRY),
            }
        };
        self.shared.close_current()
    }
}

impl<O: PortOpener> Drop for SerialLinkManager<O> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Link dropped without a clean close: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::broadcaster::Subscription;
    use crate::frame_decoder::DecodedBatch;

    fn link() -> (SerialLinkManager<MockOpener>, MockOpener, Subscription) {
        let opener = MockOpener::default();
        let broadcaster = Broadcaster::new();
        let events = broadcaster.subscribe();
        let link = SerialLinkManager::new(opener.clone(), broadcaster, LinkConfig::default());
        (link, opener, events)
    }

    fn statuses(events: &Subscription) -> Vec<String> {
        events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Status { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    fn wait_for(events: &Subscription, pred: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        loop {
            let event = events
                .recv_timeout(Duration::from_secs(5))
                .expect("timed out waiting for event");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn connect_opens_and_deasserts_dtr() {
        let (link, opener, events) = link();
        link.connect("/dev/ttyACM0", 115200).unwrap();

        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(link.connection(), Some(("/dev/ttyACM0".to_owned(), 115200)));
        assert_eq!(
            opener.entries(),
            vec!["open /dev/ttyACM0 115200", "dtr /dev/ttyACM0 false"]
        );
        assert_eq!(
            statuses(&events),
            vec![
                "Opening /dev/ttyACM0 at 115200 baud",
                "Connected to /dev/ttyACM0 at 115200 baud"
            ]
        );
    }

    #[test]
    fn second_connect_closes_first_link_once() {
        let (link, opener, _events) = link();
        link.connect("/dev/a", 9600).unwrap();
        link.connect("/dev/b", 115200).unwrap();

        assert_eq!(
            opener.entries(),
            vec![
                "open /dev/a 9600",
                "dtr /dev/a false",
                "close /dev/a",
                "open /dev/b 115200",
                "dtr /dev/b false",
            ]
        );
        assert_eq!(link.connection(), Some(("/dev/b".to_owned(), 115200)));
        assert_eq!(link.state(), LinkState::Open);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (link, opener, events) = link();
        link.disconnect().unwrap();
        link.disconnect().unwrap();

        assert!(opener.entries().is_empty());
        assert!(events.drain().is_empty());
        assert_eq!(link.state(), LinkState::Closed);

        link.connect("/dev/a", 9600).unwrap();
        events.drain();
        link.disconnect().unwrap();
        assert_eq!(
            statuses(&events),
            vec!["Closing /dev/a", "Serial port successfully closed"]
        );
        link.disconnect().unwrap();
        assert!(events.drain().is_empty());
        assert_eq!(opener.entries().last().unwrap(), "close /dev/a");
    }

    #[test]
    fn rejects_unknown_baud_rate_without_touching_link() {
        let (link, opener, _events) = link();
        link.connect("/dev/a", 9600).unwrap();

        assert_eq!(
            link.connect("/dev/b", 12345),
            Err(LinkError::InvalidBaudRate(12345))
        );
        assert_eq!(link.connection(), Some(("/dev/a".to_owned(), 9600)));
        assert_eq!(opener.entries().len(), 2);
    }

    #[test]
    fn open_failure_reports_and_returns_to_closed() {
        let (link, opener, events) = link();
        opener.behaviour.lock().unwrap().refuse_open = true;

        let err = link.connect("/dev/missing", 9600).unwrap_err();
        assert_eq!(err, LinkError::OpenFailed("no such device".to_owned()));
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.connection(), None);

        let seen = events.drain();
        assert_eq!(
            seen.last(),
            Some(&LinkEvent::error("Error opening serial port: no such device"))
        );
    }

    #[test]
    fn dtr_failure_does_not_fail_connect() {
        let (link, opener, events) = link();
        opener.behaviour.lock().unwrap().refuse_dtr = true;

        link.connect("/dev/a", 57600).unwrap();
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(opener.entries(), vec!["open /dev/a 57600"]);
        assert!(events
            .drain()
            .iter()
            .all(|e| e.kind() != crate::broadcaster::EventKind::Error));
    }

    #[test]
    fn close_failure_is_reported() {
        let (link, opener, _events) = link();
        opener.behaviour.lock().unwrap().refuse_flush = true;
        link.connect("/dev/a", 9600).unwrap();

        assert_eq!(
            link.disconnect(),
            Err(LinkError::CloseFailed("flush refused".to_owned()))
        );
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.connection(), None);
    }

    #[test]
    fn failed_state_is_settled_before_the_error_event() {
        let (link, opener, events) = link();
        opener.behaviour.lock().unwrap().refuse_flush = true;
        link.connect("/dev/a", 9600).unwrap();

        let link = Arc::new(link);
        let watcher = {
            let link = Arc::clone(&link);
            thread::spawn(move || {
                let event = wait_for(&events, |e| matches!(e, LinkEvent::Error { .. }));
                (event, link.state())
            })
        };
        assert!(link.disconnect().is_err());

        let (event, state_at_event) = watcher.join().unwrap();
        assert_eq!(
            event,
            LinkEvent::error("Error closing serial port: flush refused")
        );
        assert_eq!(state_at_event, LinkState::Closed);
    }

    #[test]
    fn disconnect_within_waits_out_a_transition() {
        let (link, opener, _events) = link();
        opener.behaviour.lock().unwrap().open_delay_ms = 200;
        let link = Arc::new(link);

        let first = {
            let link = Arc::clone(&link);
            thread::spawn(move || link.connect("/dev/slow", 9600))
        };
        while link.state() != LinkState::Opening {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(
            link.disconnect_within(Duration::from_millis(1)),
            Err(LinkError::LinkBusy)
        );
        assert_eq!(link.disconnect_within(Duration::from_secs(5)), Ok(()));
        assert_eq!(first.join().unwrap(), Ok(()));
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(opener.entries().last().unwrap(), "close /dev/slow");
    }

    #[test]
    fn busy_while_a_transition_is_in_flight() {
        let (link, opener, _events) = link();
        opener.behaviour.lock().unwrap().open_delay_ms = 300;
        let link = Arc::new(link);

        let first = {
            let link = Arc::clone(&link);
            thread::spawn(move || link.connect("/dev/slow", 9600))
        };
        while link.state() != LinkState::Opening {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(link.connect("/dev/other", 9600), Err(LinkError::LinkBusy));
        assert_eq!(link.disconnect(), Err(LinkError::LinkBusy));
        assert_eq!(first.join().unwrap(), Ok(()));
        assert_eq!(link.connection(), Some(("/dev/slow".to_owned(), 9600)));
    }

    #[test]
    fn bytes_are_decoded_and_broadcast() {
        let (link, opener, events) = link();
        opener.push_chunk(b"Frequency(Hz)\tCoefficient\tQ0\tQ1\tQ2\n662\t15217\t69");
        opener.push_chunk(b"93149\t6993149\t5254142\n");
        link.connect("/dev/a", 115200).unwrap();

        let header = wait_for(&events, |e| matches!(e, LinkEvent::Data(_)));
        assert!(matches!(header, LinkEvent::Data(DecodedBatch::Raw(_))));

        let rows = wait_for(&events, |e| matches!(e, LinkEvent::Data(_)));
        match rows {
            LinkEvent::Data(DecodedBatch::Goertzel(records)) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].q0, 6993149);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unplugged_device_closes_link_with_error() {
        let (link, opener, events) = link();
        link.connect("/dev/a", 9600).unwrap();
        opener.unplugged.store(true, Ordering::Release);

        let error = wait_for(&events, |e| matches!(e, LinkEvent::Error { .. }));
        assert_eq!(
            error,
            LinkEvent::error("Serial Port Error on /dev/a: device unplugged; link closed")
        );
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.connection(), None);
        assert_eq!(opener.entries().last().unwrap(), "close /dev/a");

        // A fresh connect works after the failure.
        opener.unplugged.store(false, Ordering::Release);
        link.connect("/dev/a", 9600).unwrap();
        assert_eq!(link.state(), LinkState::Open);
    }
}
