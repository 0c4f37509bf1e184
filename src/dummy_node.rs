//! A sensor node that lives in a thread instead of on the other end of a
//! cable.
//!
//! Every `interval` the node synthesises one frame of ADC samples (a sum of
//! tones plus uniform noise), runs its integer Goertzel recurrence for each
//! target frequency and prints the table the real firmware prints. The
//! printed bytes come out of [`LinkPort::read`], so a [`DummyOpener`] can
//! stand in for real serial ports anywhere the link manager is used.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};
use rand::prelude::*;
use std::{
    collections::VecDeque,
    f64::consts::PI,
    io,
    sync::{mpsc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use crate::config::SensorConfig;
use crate::frame_decoder::GoertzelRecord;
use crate::goertzel::coefficient;
use crate::serial_link::{LinkPort, PortOpener};

/// One sinusoidal component of the simulated vibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    /// Frequency in Hz
    pub frequency: f64,
    /// Peak amplitude in ADC counts
    pub amplitude: f64,
}

enum Signal {
    Tones(Vec<Tone>),
    Noise(f64),
    Stop,
}

/// One frame of ADC readings: the zero offset plus every tone plus noise in
/// `-noise..noise`, rounded and clipped to the ADC range.
pub fn synthesize_samples(
    sensor: &SensorConfig,
    tones: &[Tone],
    noise: f64,
    rng: &mut impl Rng,
) -> Vec<f64> {
    (0..sensor.frame_len)
        .map(|n| {
            let t = n as f64 / sensor.sample_rate;
            let signal: f64 = tones
                .iter()
                .map(|tone| tone.amplitude * (2.0 * PI * tone.frequency * t).sin())
                .sum();
            let jitter = if noise > 0.0 {
                rng.gen_range(-noise..noise)
            } else {
                0.0
            };
            (sensor.zero_offset + signal + jitter)
                .round()
                .clamp(0.0, sensor.adc_max())
        })
        .collect()
}

fn saturate(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// What the node firmware computes for `frequency` over `samples`.
///
/// Samples are centred on the zero offset and scaled by `2^(shift/2)`, so
/// that the final `>> shift` leaves the power in ADC counts². The
/// coefficient is `2·cos(2πk/N)` in Q`cross_term_shift` format.
pub fn node_goertzel(samples: &[f64], frequency: f64, sensor: &SensorConfig) -> GoertzelRecord {
    let cross_shift = sensor.cross_term_shift.min(62);
    let c = saturate(
        (coefficient(frequency, sensor.sample_rate, samples.len())
            * 2f64.powi(cross_shift as i32))
        .floor() as i64,
    );
    let scale = 1i64 << (sensor.fixed_point_shift / 2).min(31);

    let (mut q1, mut q2) = (0i64, 0i64);
    for &x in samples {
        let x = (x - sensor.zero_offset).round() as i64 * scale;
        let q0 = x + ((i64::from(c) * q1) >> cross_shift) - q2;
        q2 = q1;
        q1 = i64::from(saturate(q0));
    }

    GoertzelRecord {
        frequency,
        coefficient: i64::from(c),
        q0: q1,
        q1,
        q2,
    }
}

/// The text the node prints for one frame.
pub fn format_frame(records: &[GoertzelRecord]) -> String {
    let mut text = String::from("Sending Goertzel results\nFrequency(Hz)\tCoefficient\tQ0\tQ1\tQ2\n");
    for r in records {
        text.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            r.frequency, r.coefficient, r.q0, r.q1, r.q2
        ));
    }
    text
}

/// Configures a [`DummyNode`].
#[derive(Debug, Clone)]
pub struct DummyNodeBuilder {
    sensor: SensorConfig,
    targets: Vec<f64>,
    tones: Vec<Tone>,
    noise: f64,
    interval: Duration,
    read_timeout: Duration,
}

impl Default for DummyNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyNodeBuilder {
    /// The stock node: ten targets from 100 Hz to 1 kHz, tones at 250 Hz
    /// and 662 Hz, a little noise, one frame a second.
    pub fn new() -> Self {
        Self {
            sensor: SensorConfig::default(),
            targets: (1..=10).map(|i| f64::from(i) * 100.0).collect(),
            tones: vec![
                Tone {
                    frequency: 250.0,
                    amplitude: 120.0,
                },
                Tone {
                    frequency: 662.0,
                    amplitude: 60.0,
                },
            ],
            noise: 2.0,
            interval: Duration::from_secs(1),
            read_timeout: Duration::from_millis(100),
        }
    }

    /// Sets the sensor constants.
    pub fn set_sensor(self, sensor: SensorConfig) -> Self {
        Self { sensor, ..self }
    }

    /// Sets the frequencies the node reports on.
    pub fn set_targets(self, targets: &[f64]) -> Self {
        Self {
            targets: targets.to_vec(),
            ..self
        }
    }

    /// Replaces the tones in the simulated signal.
    pub fn set_tones(self, tones: &[Tone]) -> Self {
        Self {
            tones: tones.to_vec(),
            ..self
        }
    }

    /// Sets the peak noise amplitude in ADC counts.
    pub fn set_noise(self, noise: f64) -> Self {
        Self { noise, ..self }
    }

    /// Sets the time between frames.
    pub fn set_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    /// Sets how long a read waits for output.
    pub fn set_read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..self
        }
    }

    /// Starts the node.
    pub fn build(self) -> io::Result<DummyNode> {
        let (tx, rx) = mpsc::channel::<Signal>();
        let (out_tx, out_rx) = unbounded::<Vec<u8>>();
        let read_timeout = self.read_timeout;

        let handle = thread::Builder::new()
            .name("dummy-node".to_owned())
            .spawn(move || self.run(rx, out_tx))?;

        Ok(DummyNode {
            handle: Some(handle),
            tx,
            output: out_rx,
            pending: Mutex::new(VecDeque::new()),
            read_timeout,
        })
    }

    fn run(mut self, rx: mpsc::Receiver<Signal>, output: Sender<Vec<u8>>) {
        let mut rng = thread_rng();
        let mut frames = 0u64;
        loop {
            match rx.recv_timeout(self.interval) {
                Ok(Signal::Tones(tones)) => self.tones = tones,
                Ok(Signal::Noise(noise)) => self.noise = noise,
                Ok(Signal::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let samples = synthesize_samples(&self.sensor, &self.tones, self.noise, &mut rng);
                    let records: Vec<GoertzelRecord> = self
                        .targets
                        .iter()
                        .map(|&f| node_goertzel(&samples, f, &self.sensor))
                        .collect();
                    if output.send(format_frame(&records).into_bytes()).is_err() {
                        break;
                    }
                    frames += 1;
                    trace!("Dummy node sent frame {}", frames);
                }
            }
        }
        debug!("Dummy node stopped after {} frames", frames);
    }
}

/// A running simulated node.
pub struct DummyNode {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    output: Receiver<Vec<u8>>,
    pending: Mutex<VecDeque<u8>>,
    read_timeout: Duration,
}

impl DummyNode {
    /// A builder with the stock settings.
    pub fn builder() -> DummyNodeBuilder {
        DummyNodeBuilder::new()
    }

    /// Replaces the tones from the next frame on.
    pub fn set_tones(&self, tones: &[Tone]) {
        // A send error means the node already stopped; nothing to update.
        let _ = self.tx.send(Signal::Tones(tones.to_vec()));
    }

    /// Sets the noise amplitude from the next frame on.
    pub fn set_noise(&self, noise: f64) {
        let _ = self.tx.send(Signal::Noise(noise));
    }

    /// Stops the node thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                debug!("Dummy node thread panicked");
            }
        }
    }
}

impl Drop for DummyNode {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LinkPort for DummyNode {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_empty() {
            match self.output.recv_timeout(self.read_timeout) {
                Ok(frame) => pending.extend(frame),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no output yet"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "dummy node stopped",
                    ))
                }
            }
        }

        let n = buf.len().min(pending.len());
        for (slot, byte) in buf.iter_mut().zip(pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_dtr(&self, asserted: bool) -> io::Result<()> {
        debug!("Dummy node DTR {}", if asserted { "set" } else { "cleared" });
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(mut self) -> io::Result<()> {
        self.stop();
        Ok(())
    }
}

/// Opens a fresh [`DummyNode`] for every connect, whatever the path.
#[derive(Debug, Clone, Default)]
pub struct DummyOpener {
    template: DummyNodeBuilder,
}

impl DummyOpener {
    /// Opens nodes configured like `template`.
    pub fn new(template: DummyNodeBuilder) -> Self {
        Self { template }
    }
}

impl PortOpener for DummyOpener {
    type Port = DummyNode;

    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<DummyNode> {
        debug!("Simulating a node on {} at {} baud", path, baud_rate);
        self.template.clone().set_read_timeout(read_timeout).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{Broadcaster, LinkEvent};
    use crate::config::LinkConfig;
    use crate::frame_decoder::{decode, DecodedBatch};
    use crate::goertzel::GoertzelEngine;
    use crate::serial_link::{LinkState, SerialLinkManager};
    use std::time::Instant;

    fn quiet() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn silent_signal_sits_on_the_zero_offset() {
        let sensor = SensorConfig::default();
        let samples = synthesize_samples(&sensor, &[], 0.0, &mut quiet());
        assert_eq!(samples.len(), 480);
        assert!(samples.iter().all(|&s| s == 512.0));

        let record = node_goertzel(&samples, 662.0, &sensor);
        assert_eq!(record.coefficient, 15217);
        assert_eq!((record.q0, record.q1, record.q2), (0, 0, 0));
    }

    #[test]
    fn samples_are_clipped_to_the_adc() {
        let sensor = SensorConfig::default();
        let loud = [Tone {
            frequency: 100.0,
            amplitude: 5000.0,
        }];
        let samples = synthesize_samples(&sensor, &loud, 0.0, &mut quiet());
        assert!(samples.iter().all(|&s| (0.0..=1023.0).contains(&s)));
        assert!(samples.contains(&1023.0));
        assert!(samples.contains(&0.0));
    }

    #[test]
    fn node_power_tracks_host_goertzel() {
        let sensor = SensorConfig::default();
        let engine = GoertzelEngine::new(sensor.clone());
        let bin_centre = 44.0 * sensor.sample_rate / sensor.frame_len as f64;
        let tones = [
            Tone {
                frequency: bin_centre,
                amplitude: 150.0,
            },
            Tone {
                frequency: 250.0,
                amplitude: 40.0,
            },
        ];
        let samples = synthesize_samples(&sensor, &tones, 1.0, &mut quiet());

        let record = node_goertzel(&samples, 1000.0, &sensor);
        let node = engine.node_estimate(&record);
        let edge = engine.edge_estimate(&samples, 1000.0).unwrap();
        assert!(edge.power_adc > 150.0 * 150.0 * 0.9);
        assert!(
            (node.power_adc - edge.power_adc).abs() < 0.05 * edge.power_adc,
            "node {} edge {}",
            node.power_adc,
            edge.power_adc
        );
    }

    #[test]
    fn printed_frame_decodes() {
        let sensor = SensorConfig::default();
        let samples = synthesize_samples(
            &sensor,
            &[Tone {
                frequency: 300.0,
                amplitude: 80.0,
            }],
            0.0,
            &mut quiet(),
        );
        let records: Vec<GoertzelRecord> = [100.0, 300.0]
            .iter()
            .map(|&f| node_goertzel(&samples, f, &sensor))
            .collect();

        match decode(format_frame(&records).as_bytes()) {
            DecodedBatch::Goertzel(decoded) => assert_eq!(decoded, records),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn link_streams_from_a_simulated_node() {
        let opener = DummyOpener::new(
            DummyNode::builder()
                .set_targets(&[250.0, 500.0])
                .set_interval(Duration::from_millis(10)),
        );
        let broadcaster = Broadcaster::new();
        let events = broadcaster.subscribe();
        let link = SerialLinkManager::new(opener, broadcaster, LinkConfig::default());

        link.connect("sim0", 115200).unwrap();
        assert_eq!(link.state(), LinkState::Open);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut frequencies = Vec::new();
        while frequencies.len() < 2 && Instant::now() < deadline {
            if let Some(LinkEvent::Data(DecodedBatch::Goertzel(records))) =
                events.recv_timeout(Duration::from_millis(100))
            {
                frequencies.extend(records.iter().map(|r| r.frequency));
            }
        }
        assert_eq!(&frequencies[..2], &[250.0, 500.0]);

        link.disconnect().unwrap();
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[test]
    fn stopped_node_reports_a_broken_pipe() {
        let mut node = DummyNode::builder()
            .set_interval(Duration::from_secs(60))
            .set_read_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            node.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        node.stop();
        assert_eq!(
            node.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
