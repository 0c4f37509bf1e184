//! Turns the text printed by the sensor node into [`GoertzelRecord`]s.
//!
//! The node prints a tab separated table with one row per target frequency:
//!
//! ```text
//! Frequency(Hz)	Coefficient	Q0	Q1	Q2
//! 662	15217	6993149	6993149	5254142
//! ```
//!
//! Anything that does not look like a table row (boot banners, debug prints,
//! half-written lines) is skipped. When a payload contains no usable row at
//! all it is passed through untouched as [`DecodedBatch::Raw`], so nothing the
//! node says is lost on the way to the consumers.

use log::{debug, trace};
use nom::{
    bytes::complete::{take_till1, take_while1},
    character::complete::i64 as int64,
    combinator::all_consuming,
    multi::separated_list0,
    number::complete::double,
    Finish, IResult,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowercased token that marks the header line of the node's table.
pub const HEADER_TOKEN: &str = "frequency(hz)";

/// Number of leading columns that make up one record.
pub const RECORD_COLUMNS: usize = 5;

/// Upper bound on bytes held back while waiting for a newline.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// One row of the node's output: the target frequency, the fixed-point
/// coefficient the node used for it, and the last three recurrence states.
///
/// Serialized with the short field names the consumers expect
/// (`freq`, `c`, `q0`, `q1`, `q2`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoertzelRecord {
    /// Target frequency in Hz
    #[serde(rename = "freq")]
    pub frequency: f64,
    /// Goertzel coefficient in the node's fixed-point format
    #[serde(rename = "c")]
    pub coefficient: i64,
    /// Most recent recurrence state
    pub q0: i64,
    /// State one iteration back
    pub q1: i64,
    /// State two iterations back
    pub q2: i64,
}

/// The result of decoding one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum DecodedBatch {
    /// At least one valid row was found; rows are in payload order.
    Goertzel(Vec<GoertzelRecord>),
    /// No valid row was found; carries the trimmed payload text.
    Raw(String),
}

/// Why a candidate data line did not produce a record. These are logged,
/// never returned to the caller of [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkippedLine {
    /// Fewer than five non-empty columns
    #[error("expected at least {RECORD_COLUMNS} columns, found {0}")]
    TooFewColumns(usize),
    /// A column is not a finite number
    #[error("column {0} is not a finite number")]
    NotANumber(usize),
}

fn tab_run(s: &str) -> IResult<&str, &str> {
    take_while1(|c| c == '\t')(s)
}

fn cell(s: &str) -> IResult<&str, &str> {
    take_till1(|c| c == '\t')(s)
}

/// Splits a line on runs of tabs, trims every cell and drops empty ones.
pub fn split_columns(line: &str) -> Vec<&str> {
    match separated_list0(tab_run, cell)(line) {
        Ok((_rest, cells)) => cells
            .into_iter()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Parses a whole cell as a finite number.
pub(crate) fn parse_number(s: &str) -> Option<f64> {
    all_consuming(double::<&str, nom::error::Error<&str>>)(s)
        .finish()
        .ok()
        .map(|(_, v)| v)
        .filter(|v| v.is_finite())
}

/// Parses a whole cell as an `i64`. Any other finite number is floored,
/// and magnitudes beyond `i64` saturate.
fn parse_integer(s: &str, column: usize) -> Result<i64, SkippedLine> {
    if let Ok((_, v)) = all_consuming(int64::<&str, nom::error::Error<&str>>)(s).finish() {
        return Ok(v);
    }
    let v = parse_number(s).ok_or(SkippedLine::NotANumber(column))?;
    Ok(v.floor() as i64)
}

/// Builds a record from already split columns. Extra columns are ignored.
pub(crate) fn record_from_columns(columns: &[&str]) -> Result<GoertzelRecord, SkippedLine> {
    if columns.len() < RECORD_COLUMNS {
        return Err(SkippedLine::TooFewColumns(columns.len()));
    }

    Ok(GoertzelRecord {
        frequency: parse_number(columns[0]).ok_or(SkippedLine::NotANumber(0))?,
        coefficient: parse_integer(columns[1], 1)?,
        q0: parse_integer(columns[2], 2)?,
        q1: parse_integer(columns[3], 3)?,
        q2: parse_integer(columns[4], 4)?,
    })
}

/// Parses one tab separated data line.
pub fn parse_record(line: &str) -> Result<GoertzelRecord, SkippedLine> {
    record_from_columns(&split_columns(line))
}

/// Decodes one complete payload.
///
/// The first line containing [`HEADER_TOKEN`] (case-insensitive) is dropped
/// together with everything before it. Without a header line every line is a
/// candidate row; a payload that continues a table started in an earlier
/// payload relies on exactly that.
pub fn decode(payload: &[u8]) -> DecodedBatch {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    let lines: Vec<&str> = text
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let rows = match lines
        .iter()
        .position(|l| l.to_lowercase().contains(HEADER_TOKEN))
    {
        Some(header) => {
            if header > 0 {
                debug!("Dropping {} line(s) before the table header", header);
            }
            &lines[header + 1..]
        }
        None => &lines[..],
    };

    let records: Vec<GoertzelRecord> = rows
        .iter()
        .filter_map(|line| match parse_record(line) {
            Ok(record) => Some(record),
            Err(reason) => {
                debug!("Skipping line {:?}: {}", line, reason);
                None
            }
        })
        .collect();

    if records.is_empty() {
        DecodedBatch::Raw(text.to_owned())
    } else {
        DecodedBatch::Goertzel(records)
    }
}

/// Bytes received from the link that have not yet been terminated by a
/// newline.
#[derive(Debug, Default, Clone)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

impl RawFrame {
    /// Appends a chunk as received.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Number of pending bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Removes and returns everything up to and including the last newline,
    /// leaving an unterminated tail behind.
    pub fn take_complete_lines(&mut self) -> Option<Vec<u8>> {
        let end = self.bytes.iter().rposition(|&b| b == b'\n')? + 1;
        let tail = self.bytes.split_off(end);
        Some(std::mem::replace(&mut self.bytes, tail))
    }

    /// Removes and returns everything.
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

/// Accumulates the byte stream from the link and decodes it one batch of
/// complete lines at a time.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    pending: RawFrame,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    /// A decoder that flushes its pending bytes once they exceed
    /// `max_frame_bytes` even without a newline.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            pending: RawFrame::default(),
            max_frame_bytes,
        }
    }

    /// Feeds one chunk from the link. Returns a batch when the chunk
    /// completed at least one line.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<DecodedBatch> {
        self.pending.extend(chunk);

        let payload = match self.pending.take_complete_lines() {
            Some(payload) => payload,
            None if self.pending.len() > self.max_frame_bytes => {
                debug!(
                    "No newline within {} bytes, decoding what we have",
                    self.max_frame_bytes
                );
                self.pending.take_all()
            }
            None => return None,
        };

        Self::decode_payload(&payload)
    }

    /// Decodes whatever is still pending, terminated or not.
    pub fn flush(&mut self) -> Option<DecodedBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let payload = self.pending.take_all();
        Self::decode_payload(&payload)
    }

    /// Number of bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn decode_payload(payload: &[u8]) -> Option<DecodedBatch> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            trace!("Ignoring blank payload of {} bytes", payload.len());
            return None;
        }
        Some(decode(payload))
    }
}
