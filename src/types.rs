//! Core types for the durable stream store.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;
use crate::handle_pool::DEFAULT_MAX_FILE_HANDLES;

/// Content type assigned to streams created without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A stream position: `(read_seq, byte_offset)` rendered as
/// `"%016d_%016d"` so that lexicographic string order matches numeric order.
///
/// `read_seq` is reserved for future log rotation and is always zero today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset {
    pub read_seq: u64,
    pub byte_offset: u64,
}

impl Offset {
    pub const ZERO: Offset = Offset {
        read_seq: 0,
        byte_offset: 0,
    };

    pub fn new(read_seq: u64, byte_offset: u64) -> Self {
        Self {
            read_seq,
            byte_offset,
        }
    }

    /// Parse an offset token.
    ///
    /// The empty string and the literal `"-1"` both mean "from the
    /// beginning" (zero). Anything else must be exactly `digits_digits`;
    /// signs, whitespace and extra separators all reject.
    pub fn parse(s: &str) -> Result<Offset, StoreError> {
        if s.is_empty() || s == "-1" {
            return Ok(Offset::ZERO);
        }
        let invalid = || StoreError::InvalidOffset(s.to_string());
        let (seq, byte) = s.split_once('_').ok_or_else(invalid)?;
        if seq.is_empty()
            || byte.is_empty()
            || !seq.bytes().all(|b| b.is_ascii_digit())
            || !byte.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let read_seq = seq.parse::<u64>().map_err(|_| invalid())?;
        let byte_offset = byte.parse::<u64>().map_err(|_| invalid())?;
        Ok(Offset {
            read_seq,
            byte_offset,
        })
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016}_{:016}", self.read_seq, self.byte_offset)
    }
}

impl FromStr for Offset {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Offset::parse(s)
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Offset::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A message read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Raw message bytes.
    pub data: Vec<u8>,
    /// Position *after* this message's framed footprint.
    pub offset: Offset,
}

/// Per-producer idempotence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerState {
    pub epoch: i64,
    pub last_seq: i64,
    /// Unix seconds of the last accepted append.
    pub last_updated: i64,
}

/// Identity of the append that closed a stream, kept so an idempotent
/// producer retry of the close replays as success instead of `StreamClosed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedBy {
    pub producer_id: String,
    pub epoch: i64,
    pub seq: i64,
}

/// Per-stream metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    /// URL path identifying the stream.
    pub path: String,
    /// MIME type of the stream content. Never mutates after create.
    pub content_type: String,
    /// Current tail offset. The segment file is authoritative; this field
    /// is reconciled to file truth on recovery.
    pub current_offset: Offset,
    /// Last accepted `Stream-Seq` value, monotonic per stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<String>,
    /// Time-to-live in seconds, relative to `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    /// Absolute expiration timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp. Never mutates.
    pub created_at: DateTime<Utc>,
    /// Idempotent-producer state keyed by producer id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub producers: HashMap<String, ProducerState>,
    /// If true, appends fail (except idempotent replay of the close).
    #[serde(default)]
    pub closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<ClosedBy>,
}

impl StreamMetadata {
    pub fn new(path: &str, config: &StreamConfig) -> Self {
        Self {
            path: path.to_string(),
            content_type: config
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            current_offset: Offset::ZERO,
            last_seq: None,
            ttl_seconds: config.ttl_seconds,
            expires_at: config.expires_at,
            created_at: Utc::now(),
            producers: HashMap::new(),
            closed: config.closed,
            closed_by: None,
        }
    }

    /// Check whether the stream has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return true;
            }
        }
        if let Some(ttl_seconds) = self.ttl_seconds {
            let deadline = self.created_at + chrono::Duration::seconds(ttl_seconds as i64);
            if now >= deadline {
                return true;
            }
        }
        false
    }

    /// Whether this stream stores JSON values.
    pub fn is_json(&self) -> bool {
        is_json_content_type(&self.content_type)
    }
}

/// Configuration for creating a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Vec<u8>>,
    pub closed: bool,
}

/// Options for a single append.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Optional `Stream-Seq` value; must be strictly greater than the last
    /// accepted one (string comparison).
    pub seq: Option<String>,
    /// If set, must match the stream's content type.
    pub content_type: Option<String>,
    /// Close the stream atomically with this append.
    pub close: bool,
    pub producer_id: Option<String>,
    pub producer_epoch: Option<i64>,
    pub producer_seq: Option<i64>,
}

/// An idempotent-producer claim extracted from [`AppendOptions`].
#[derive(Debug, Clone, Copy)]
pub struct ProducerClaim<'a> {
    pub id: &'a str,
    pub epoch: i64,
    pub seq: i64,
}

impl AppendOptions {
    /// The producer triple, if present. Producer fields are all-or-none.
    pub fn producer_claim(&self) -> Result<Option<ProducerClaim<'_>>, StoreError> {
        match (&self.producer_id, self.producer_epoch, self.producer_seq) {
            (None, None, None) => Ok(None),
            (Some(id), Some(epoch), Some(seq)) => Ok(Some(ProducerClaim { id, epoch, seq })),
            _ => Err(StoreError::PartialProducer),
        }
    }
}

/// How an append interacted with idempotent-producer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// No producer fields were supplied.
    None,
    /// The append was accepted and producer state advanced.
    Accepted,
    /// The append was a replay; nothing was written.
    Duplicate,
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// Tail offset after the append (unchanged for duplicates).
    pub offset: Offset,
    pub producer: ProducerOutcome,
    /// Stream-level `Stream-Seq` after the append.
    pub last_seq: Option<String>,
    /// Whether the stream is closed after this append.
    pub closed: bool,
}

/// Result of closing a stream.
#[derive(Debug, Clone)]
pub struct CloseResult {
    pub offset: Offset,
    pub last_seq: Option<String>,
}

/// Result of reading from a stream.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub messages: Vec<StreamMessage>,
    /// Offset to use for the next read.
    pub next_offset: Offset,
    /// Whether the read caught up to the tail.
    pub up_to_date: bool,
}

/// Result of waiting for messages past an offset.
#[derive(Debug, Clone)]
pub struct WaitResult {
    pub messages: Vec<StreamMessage>,
    pub next_offset: Offset,
    /// True when the wait ended on the timeout with no new data.
    pub timed_out: bool,
    /// True when the stream is closed and no further data will arrive.
    pub closed: bool,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Root directory for segments and metadata.
    pub data_dir: PathBuf,
    /// Capacity of each file-handle cache (writers and readers).
    pub max_file_handles: usize,
    /// Interval between TTL sweeps. `None` disables the sweeper.
    pub cleanup_interval: Option<Duration>,
}

impl StoreOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_file_handles: DEFAULT_MAX_FILE_HANDLES,
            cleanup_interval: None,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on (0 for auto-assign).
    pub port: u16,
    /// Root data directory for the backing store.
    pub data_dir: PathBuf,
    pub max_file_handles: usize,
    pub cleanup_interval: Option<Duration>,
    /// Maximum time a long-poll or SSE wait blocks before reporting
    /// up-to-date.
    pub long_poll_timeout: Duration,
    /// Cursor interval in seconds.
    pub cursor_interval_seconds: u64,
    /// Cursor epoch for interval calculation.
    pub cursor_epoch: DateTime<Utc>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4437,
            data_dir: PathBuf::from("./silt-data"),
            max_file_handles: DEFAULT_MAX_FILE_HANDLES,
            cleanup_interval: None,
            long_poll_timeout: Duration::from_secs(30),
            cursor_interval_seconds: 20,
            // October 9, 2024 as default epoch
            cursor_epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }
}

impl ServerOptions {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            data_dir: self.data_dir.clone(),
            max_file_handles: self.max_file_handles,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

/// Normalize a content type to its media type: strip `;` parameters,
/// trim, lowercase.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Compare two content types on the media type only, case-insensitively.
pub fn content_type_matches(a: &str, b: &str) -> bool {
    normalize_content_type(a) == normalize_content_type(b)
}

/// Whether a content type selects JSON append mode.
pub fn is_json_content_type(content_type: &str) -> bool {
    normalize_content_type(content_type) == "application/json"
}
