//! Loading captures from disk: the node's Goertzel table and raw ADC
//! sample buffers.
//!
//! A Goertzel table can be a CSV or tab separated export with a header
//! naming the frequency, coefficient and Q0/Q1/Q2 columns, a JSON array of
//! records, or the JSON lines written by `goertzel-link listen`, in which
//! case the last table in the stream is used.

use log::{debug, warn};
use std::{fs, path::Path};
use thiserror::Error;

use crate::broadcaster::LinkEvent;
use crate::frame_decoder::{parse_number, record_from_columns, DecodedBatch, GoertzelRecord};

/// Delimiters tried when looking for the table header, in order.
const DELIMITERS: [char; 2] = [',', '\t'];

/// Column name fragments the header has to mention.
const REQUIRED_COLUMNS: [&str; 5] = ["freq", "coeff", "q0", "q1", "q2"];

/// Things that go wrong while loading a capture.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON capture
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// No line names all of the table's columns
    #[error("Invalid file format: Missing header with Frequency, Coefficient, Q0, Q1, Q2")]
    MissingHeader,
    /// A header was found but no row under it is valid
    #[error("No valid data rows found in file")]
    NoRows,
}

fn is_header(line: &str, delimiter: char) -> bool {
    let columns: Vec<String> = line
        .split(delimiter)
        .map(|c| c.trim().to_lowercase())
        .collect();
    columns.len() >= REQUIRED_COLUMNS.len()
        && REQUIRED_COLUMNS
            .iter()
            .all(|name| columns.iter().any(|c| c.contains(name)))
}

fn is_noise(line: &str) -> bool {
    line.starts_with("===") || line.to_lowercase().starts_with("sending")
}

fn unquote(cell: &str) -> &str {
    let cell = cell.trim();
    let cell = cell.strip_prefix('"').unwrap_or(cell);
    cell.strip_suffix('"').unwrap_or(cell).trim()
}

fn parse_delimited(text: &str) -> Result<Vec<GoertzelRecord>, RecordingError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let (header, delimiter) = DELIMITERS
        .iter()
        .find_map(|&d| lines.iter().position(|l| is_header(l, d)).map(|i| (i, d)))
        .ok_or(RecordingError::MissingHeader)?;
    debug!("Table header on line {} split by {:?}", header, delimiter);

    let records: Vec<GoertzelRecord> = lines[header + 1..]
        .iter()
        .filter(|l| !is_noise(l))
        .filter_map(|line| {
            let columns: Vec<&str> = line.split(delimiter).map(unquote).collect();
            record_from_columns(&columns)
                .map_err(|reason| debug!("Skipping row {:?}: {}", line, reason))
                .ok()
        })
        .collect();

    if records.is_empty() {
        return Err(RecordingError::NoRows);
    }
    Ok(records)
}

fn parse_json(text: &str) -> Result<Vec<GoertzelRecord>, RecordingError> {
    if text.starts_with('[') {
        let records: Vec<GoertzelRecord> = serde_json::from_str(text)?;
        return if records.is_empty() {
            Err(RecordingError::NoRows)
        } else {
            Ok(records)
        };
    }

    let mut latest = None;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<LinkEvent>(line)? {
            LinkEvent::Data(DecodedBatch::Goertzel(records)) => latest = Some(records),
            other => debug!("Ignoring {:?} event", other.kind()),
        }
    }
    latest.ok_or(RecordingError::NoRows)
}

/// Parses a Goertzel table in any of the supported formats.
pub fn parse_goertzel_table(text: &str) -> Result<Vec<GoertzelRecord>, RecordingError> {
    let text = text.trim();
    if text.starts_with('[') || text.starts_with('{') {
        parse_json(text)
    } else {
        parse_delimited(text)
    }
}

/// Reads a Goertzel table from `path`.
pub fn load_goertzel_table(path: impl AsRef<Path>) -> Result<Vec<GoertzelRecord>, RecordingError> {
    let text = fs::read_to_string(path)?;
    parse_goertzel_table(&text)
}

/// Parses raw ADC samples.
///
/// A single line is a comma separated list; otherwise every line holds one
/// value, or a comma separated run of them. Anything that is not a number
/// is dropped.
pub fn parse_samples(text: &str) -> Vec<f64> {
    let mut dropped = 0;
    let samples: Vec<f64> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .flat_map(|l| l.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .filter_map(|v| {
            let parsed = parse_number(v);
            if parsed.is_none() {
                dropped += 1;
            }
            parsed
        })
        .collect();

    if dropped > 0 {
        warn!("Dropped {} non-numeric sample(s)", dropped);
    }
    samples
}

/// Reads raw ADC samples from `path`.
pub fn load_samples(path: impl AsRef<Path>) -> Result<Vec<f64>, RecordingError> {
    Ok(parse_samples(&fs::read_to_string(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_export_with_noise() {
        let text = "\
=== capture 3 ===
\"Frequency (Hz)\",\"Coefficient\",\"Q0\",\"Q1\",\"Q2\"
\"662\",\"15217\",\"6993149\",\"6993149\",\"5254142\"
Sending frame...
1000,13740,1,2,3,extra
not,a,row,at,all
";
        let records = parse_goertzel_table(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            GoertzelRecord {
                frequency: 662.0,
                coefficient: 15217,
                q0: 6993149,
                q1: 6993149,
                q2: 5254142
            }
        );
        assert_eq!(records[1].frequency, 1000.0);
    }

    #[test]
    fn tab_separated_node_output() {
        let text = "Frequency(Hz)\tCoefficient\tQ0\tQ1\tQ2\r\n250\t16214\t-4\t5\t6\r\n";
        let records = parse_goertzel_table(text).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].q0, -4);
    }

    #[test]
    fn table_errors() {
        assert!(matches!(
            parse_goertzel_table("freq,c,q0,q1,q2\n1,2,3,4,5"),
            Err(RecordingError::MissingHeader)
        ));
        assert!(matches!(
            parse_goertzel_table("freq,coeff,q0,q1,q2\nsending\n1,2,3"),
            Err(RecordingError::NoRows)
        ));
    }

    #[test]
    fn json_captures() {
        let array = r#"[{"freq":100.0,"c":1,"q0":2,"q1":3,"q2":4}]"#;
        assert_eq!(parse_goertzel_table(array).unwrap()[0].q2, 4);

        let stream = r#"{"status":"Connected to /dev/ttyACM0 at 115200 baud"}
{"type":"goertzel","data":[{"freq":100.0,"c":1,"q0":2,"q1":3,"q2":4}]}
{"type":"raw","data":"boot"}
{"type":"goertzel","data":[{"freq":200.0,"c":1,"q0":2,"q1":3,"q2":4},{"freq":300.0,"c":1,"q0":2,"q1":3,"q2":4}]}
"#;
        let records = parse_goertzel_table(stream).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frequency, 200.0);

        assert!(matches!(
            parse_goertzel_table(r#"{"status":"nothing yet"}"#),
            Err(RecordingError::NoRows)
        ));
        assert!(matches!(
            parse_goertzel_table("{broken"),
            Err(RecordingError::Json(_))
        ));
    }

    #[test]
    fn sample_layouts() {
        assert_eq!(parse_samples("512, 513,514 ,x,"), vec![512.0, 513.0, 514.0]);
        assert_eq!(parse_samples("512\n\n513\r\n514,515\n"), vec![512.0, 513.0, 514.0, 515.0]);
        assert!(parse_samples("   ").is_empty());
    }

    #[test]
    fn load_from_files() {
        let mut samples = tempfile::NamedTempFile::new().unwrap();
        let values: Vec<String> = (0..480).map(|i| (512 + i % 7).to_string()).collect();
        writeln!(samples, "{}", values.join(",")).unwrap();
        assert_eq!(load_samples(samples.path()).unwrap().len(), 480);

        let mut table = tempfile::NamedTempFile::new().unwrap();
        write!(table, "Frequency(Hz)\tCoefficient\tQ0\tQ1\tQ2\n662\t15217\t1\t2\t3\n").unwrap();
        assert_eq!(load_goertzel_table(table.path()).unwrap().len(), 1);

        assert!(matches!(
            load_samples("/definitely/not/here.csv"),
            Err(RecordingError::Io(_))
        ));
    }
}
