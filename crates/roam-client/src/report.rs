use std::fs::File;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One measurement record, serialized as a single JSON line tagged by
/// `event` so analysis tooling can parse files without knowing the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Record {
    /// Handover-track sample: adjusted largest received sequence at
    /// `elapsed_ms` since run start.
    TrackSample { elapsed_ms: u64, sequence: u64 },
    /// A request left the client at `offset_ms` since run start.
    RequestStart { index: u32, offset_ms: u64 },
    /// Final run summary. Written on every teardown; a failed run carries
    /// the failure text in `error`.
    RunSummary {
        elapsed_ms: u64,
        requests_succeeded: u32,
        requests_attempted: u32,
        retries: u64,
        network_changes: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        handover_delay_ms: Option<u64>,
        packets_observed: u64,
        acks_sent: u64,
        route_lookups: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Where measurement records go; `-` selects stdout.
#[derive(Debug)]
pub enum ReportWriter {
    Stdout,
    File(File),
}

impl ReportWriter {
    pub fn open(path: &str) -> io::Result<Self> {
        if path == "-" {
            Ok(ReportWriter::Stdout)
        } else {
            Ok(ReportWriter::File(File::create(path)?))
        }
    }

    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        match self {
            ReportWriter::Stdout => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                writeln!(handle, "{}", line)?;
                handle.flush()
            }
            ReportWriter::File(file) => {
                writeln!(file, "{}", line)?;
                file.flush()
            }
        }
    }
}

/// Shared handle the components record through. Write errors are logged and
/// dropped; measurement must not take the run down.
#[derive(Debug, Clone)]
pub struct Reporter {
    inner: Arc<Mutex<ReportWriter>>,
}

impl Reporter {
    pub fn new(writer: ReportWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(ReportWriter::Stdout)
    }

    pub fn record(&self, record: &Record) {
        let mut writer = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(error) = writer.write(record) {
            warn!(%error, "failed to write measurement record");
        }
    }
}

/// Parses records back from a JSON-lines reader. Blank lines are skipped;
/// anything else that does not parse is an error.
pub fn read_records<R: BufRead>(reader: R) -> io::Result<Vec<Record>> {
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
