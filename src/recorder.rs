//! Record/replay tape.
//!
//! In `Write` mode every observed exchange is appended, tagged with the
//! request's tape ID. In `Read` mode requests are answered from the tape and
//! anything without a match is blocked, which makes test runs deterministic.
//! Records are matched FIFO and each one plays back at most once per replay
//! session.

use crate::archive::{ArchivedRequest, ArchivedResponse, RecordedRecord};
use crate::errors::Result;
use crate::message::{Request, Response};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{Read, Write};
use tracing::{debug, info};

/// Recorder behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderMode {
  /// transparent, tape untouched
  Off,
  /// serve from tape, block on miss
  Read,
  /// append observed exchanges
  Write,
}

/// The tape: ordered records plus replay bookkeeping.
///
/// Interior mutability lives with the caller; the proxy wraps the recorder in
/// a `std::sync::RwLock` shared between the pipeline and the control plane.
pub struct Recorder {
  mode: RecorderMode,
  records: Vec<RecordedRecord>,
  // indexes into `records` already served this replay session
  consumed: HashSet<usize>,
}

impl Default for Recorder {
  fn default() -> Self {
    Self::new()
  }
}

impl Recorder {
  /// An empty tape in `Off` mode.
  pub fn new() -> Self {
    Self {
      mode: RecorderMode::Off,
      records: Vec::new(),
      consumed: HashSet::new(),
    }
  }

  /// Current mode.
  pub fn mode(&self) -> RecorderMode {
    self.mode
  }

  /// Switch modes; records are kept.
  pub fn set_mode(&mut self, mode: RecorderMode) {
    self.mode = mode;
  }

  /// Number of records on the tape.
  pub fn len(&self) -> usize {
    self.records.len()
  }

  /// Whether the tape has no records.
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Append one exchange tagged with `tape_id` (empty for untagged traffic).
  pub fn log_pair(&mut self, request: &Request, response: &Response, tape_id: &str) {
    self.records.push(RecordedRecord {
      request: ArchivedRequest::from(request),
      response: ArchivedResponse::from(response),
      tape_id: tape_id.to_string(),
    });
    debug!("recorded {} ({} total)", request.url(), self.records.len());
  }

  /// Find the first unconsumed record matching the request URL and tape ID,
  /// marking it consumed.
  pub fn find_matching_response(&mut self, request: &Request, tape_id: &str) -> Option<Response> {
    let url = request.url();
    for (index, record) in self.records.iter().enumerate() {
      if record.request.url != url || record.tape_id != tape_id {
        continue;
      }
      if self.consumed.contains(&index) {
        debug!("record already played back, continuing: {}", url);
        continue;
      }
      self.consumed.insert(index);
      return record.response.to_response().ok();
    }
    None
  }

  /// Export records for one tape ID as gzipped JSON.
  ///
  /// The export includes untagged records as well, since some clients cannot
  /// attach control headers to every request; an empty ID exports everything.
  pub fn export_data(&self, tape_id: &str) -> Result<Vec<u8>> {
    let selected: Vec<&RecordedRecord> = self
      .records
      .iter()
      .filter(|record| tape_id.is_empty() || record.tape_id == tape_id || record.tape_id.is_empty())
      .collect();
    info!("exporting {} records", selected.len());
    let json = serde_json::to_vec(&selected).map_err(|e| crate::Error::Other(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
  }

  /// Replace all records from a gzipped JSON payload.
  pub fn load_data(&mut self, raw: &[u8]) -> Result<()> {
    let mut decoder = GzDecoder::new(raw);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    let records: Vec<RecordedRecord> =
      serde_json::from_slice(&json).map_err(|e| crate::Error::Config(e.to_string()))?;
    self.clear();
    info!("loaded {} records", records.len());
    self.records = records;
    Ok(())
  }

  /// Drop all records and replay bookkeeping.
  pub fn clear(&mut self) {
    self.records.clear();
    self.consumed.clear();
  }

  /// Drop only the records tagged with `tape_id`.
  pub fn clear_tape_id(&mut self, tape_id: &str) {
    // consumed indexes shift with the removal, rebuild them against the
    // surviving records
    let consumed_records: Vec<RecordedRecord> = self
      .consumed
      .iter()
      .filter_map(|&index| self.records.get(index).cloned())
      .collect();
    self.records.retain(|record| record.tape_id != tape_id);
    self.consumed = self
      .records
      .iter()
      .enumerate()
      .filter(|(_, record)| consumed_records.contains(record))
      .map(|(index, _)| index)
      .collect();
  }
}
