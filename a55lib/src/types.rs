//! Type definitions shared between the daemon and its clients

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LinkResult;

/// Acknowledgment token received from the co-processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken(pub String);

impl AckToken {
    /// The canonical acknowledgment
    pub fn ok() -> Self {
        Self("OK".to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.0.eq_ignore_ascii_case("OK")
    }
}

/// A single co-processor parameter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamRecord {
    /// Parameter address (written as 0xHEX on the wire)
    pub addr: u32,
    /// Parameter value
    pub value: i64,
}

impl ParamRecord {
    pub fn new(addr: u32, value: i64) -> Self {
        Self { addr, value }
    }
}

/// Persisted form of the parameter table, one record per address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamTable {
    pub params: Vec<ParamRecord>,
}

impl ParamTable {
    /// Build a table sorted by address
    pub fn from_map(map: &BTreeMap<u32, i64>) -> Self {
        Self {
            params: map.iter().map(|(&addr, &value)| ParamRecord::new(addr, value)).collect(),
        }
    }

    /// Read a persisted table; a missing file is an empty table
    pub fn load<P: AsRef<Path>>(path: P) -> LinkResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Collapse into a map; later duplicates win
    pub fn into_map(self) -> BTreeMap<u32, i64> {
        self.params.into_iter().map(|r| (r.addr, r.value)).collect()
    }
}

/// Capture mode handed to the capture collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Scheduled capture
    Daily,
    /// Single capture
    Oneshot,
}

impl CaptureMode {
    /// Camera index 4 is the one-shot camera
    pub fn for_index(index: u32) -> Self {
        if index == 4 {
            CaptureMode::Oneshot
        } else {
            CaptureMode::Daily
        }
    }

    pub fn as_flag(&self) -> &'static str {
        match self {
            CaptureMode::Daily => "--daily",
            CaptureMode::Oneshot => "--oneshot",
        }
    }
}

/// Statistics for shared-memory file transfers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferStatistics {
    /// Timestamp when statistics were collected
    pub timestamp: Option<DateTime<Utc>>,
    /// Number of files copied out of the shared region
    pub files_received: u64,
    /// Total bytes copied
    pub total_bytes: u64,
    /// Notifications rejected before any read
    pub rejected: u64,
}

impl TransferStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }
}
