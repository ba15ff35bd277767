//! The stream engine.
//!
//! Owns all stream state: metadata (embedded KV plus an in-memory cache),
//! segment files (via the file-handle pool), the long-poll wakeup bus,
//! idempotent-producer bookkeeping, TTL expiry, and crash recovery.
//!
//! Concurrency model: a single reader-writer lock guards the metadata
//! cache. Reads take the read lock; create/append/delete/close and the TTL
//! sweep take the write lock, so appends to one path are linearizable
//! while different paths proceed in parallel. A lazy per-`(path, producer)`
//! mutex is acquired *before* the write lock in `append` so pipelined
//! requests from one producer validate one at a time. No lock is ever held
//! across an `await`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::LongPollBus;
use crate::error::StoreError;
use crate::handle_pool::FileHandlePool;
use crate::meta::{MetadataStore, StreamRecord};
use crate::path_encoding::{deleted_dir_name, generate_stream_dir_name, is_deleted_dir_name};
use crate::segment::{self, MAX_MESSAGE_SIZE, SEGMENT_FILE_NAME};
use crate::types::{
    content_type_matches, is_json_content_type, AppendOptions, AppendResult, CloseResult, ClosedBy,
    Offset, ProducerOutcome, ProducerState, ReadResult, StoreOptions, StreamConfig, StreamMessage,
    StreamMetadata, WaitResult, DEFAULT_CONTENT_TYPE,
};

const STREAMS_DIR: &str = "streams";
const METADATA_DIR: &str = "metadata";

struct StreamEntry {
    metadata: StreamMetadata,
    dir_name: String,
}

struct SweeperHandle {
    stop: CancellationToken,
    done: oneshot::Receiver<()>,
}

/// Durable stream store.
pub struct StreamStore {
    options: StoreOptions,
    meta: MetadataStore,
    pool: FileHandlePool,
    bus: LongPollBus,
    streams: RwLock<HashMap<String, StreamEntry>>,
    producer_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl StreamStore {
    /// Open the store rooted at `options.data_dir`, running recovery.
    ///
    /// Recovery treats each segment file as authoritative: streams whose
    /// segment is missing lose their metadata row, a partial tail left by
    /// a crash is truncated away, and stored offsets that disagree with
    /// the scanned file are rewritten to the scanned value.
    ///
    /// When `cleanup_interval` is set the TTL sweeper is spawned, which
    /// requires a running tokio runtime.
    pub fn open(options: StoreOptions) -> Result<Arc<Self>, StoreError> {
        let streams_dir = options.data_dir.join(STREAMS_DIR);
        std::fs::create_dir_all(&streams_dir)?;
        let meta = MetadataStore::open(&options.data_dir.join(METADATA_DIR))?;

        let mut cache = HashMap::new();
        for mut record in meta.list()? {
            let seg_path = streams_dir.join(&record.dir_name).join(SEGMENT_FILE_NAME);
            let file = match std::fs::File::open(&seg_path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %record.metadata.path, "segment missing, dropping orphaned metadata");
                    meta.delete(&record.metadata.path)?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let scanned = segment::scan(&file)?;
            let file_len = file.metadata()?.len();
            drop(file);

            if file_len > scanned.byte_offset {
                // Partial tail from a crash; reclaim it as writable space.
                let file = OpenOptions::new().write(true).open(&seg_path)?;
                file.set_len(scanned.byte_offset)?;
                file.sync_all()?;
            }
            if scanned.byte_offset != record.metadata.current_offset.byte_offset {
                info!(
                    path = %record.metadata.path,
                    stored = %record.metadata.current_offset,
                    scanned = %scanned,
                    "reconciling offset to segment file"
                );
                let reconciled =
                    Offset::new(record.metadata.current_offset.read_seq, scanned.byte_offset);
                record.metadata.current_offset = reconciled;
                meta.update_offset(
                    &record.metadata.path,
                    reconciled,
                    record.metadata.last_seq.clone(),
                )?;
            }
            cache.insert(
                record.metadata.path.clone(),
                StreamEntry {
                    metadata: record.metadata,
                    dir_name: record.dir_name,
                },
            );
        }

        // Directories renamed aside by Delete but not yet unlinked.
        if let Ok(entries) = std::fs::read_dir(&streams_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_str().is_some_and(is_deleted_dir_name) {
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }

        let store = Arc::new(Self {
            pool: FileHandlePool::new(options.max_file_handles),
            bus: LongPollBus::new(),
            meta,
            streams: RwLock::new(cache),
            producer_locks: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            options,
        });
        if let Some(interval) = store.options.cleanup_interval {
            store.start_sweeper(interval);
        }
        Ok(store)
    }

    /// Create a stream, or return the existing one when the configuration
    /// matches (idempotent). A live stream with a different
    /// `(contentType, ttl, expiresAt, closed)` tuple is a `ConfigMismatch`;
    /// an expired stream is reaped and recreated.
    pub fn create(
        &self,
        path: &str,
        config: StreamConfig,
    ) -> Result<(StreamMetadata, bool), StoreError> {
        if config.ttl_seconds.is_some() && config.expires_at.is_some() {
            return Err(StoreError::TtlConflict);
        }

        let mut streams = self.streams.write();
        if !self.reap_if_expired_locked(&mut streams, path) {
            if let Some(entry) = streams.get(path) {
                let existing = &entry.metadata;
                let requested_ct = config
                    .content_type
                    .as_deref()
                    .unwrap_or(DEFAULT_CONTENT_TYPE);
                if !content_type_matches(&existing.content_type, requested_ct)
                    || existing.ttl_seconds != config.ttl_seconds
                    || existing.expires_at != config.expires_at
                    || existing.closed != config.closed
                {
                    return Err(StoreError::ConfigMismatch);
                }
                return Ok((existing.clone(), false));
            }
        }

        let dir_name = generate_stream_dir_name(path);
        let dir = self.streams_dir().join(&dir_name);
        std::fs::create_dir_all(&dir)?;
        let seg_path = dir.join(SEGMENT_FILE_NAME);

        let mut metadata = StreamMetadata::new(path, &config);
        // Create the segment eagerly so recovery never sees it missing.
        let writer = self.pool.writer(&seg_path)?;
        if let Some(data) = config.initial_data.as_deref() {
            if !data.is_empty() {
                // The empty JSON array is permitted here and yields an
                // empty stream, unlike on append.
                let payloads = split_payload(&metadata.content_type, data, true)?;
                let mut written = 0u64;
                for payload in &payloads {
                    written += segment::write_message(&mut &*writer, payload)?;
                }
                if written > 0 {
                    writer.sync_all()?;
                }
                metadata.current_offset.byte_offset += written;
            }
        }

        self.meta.put(&StreamRecord {
            metadata: metadata.clone(),
            dir_name: dir_name.clone(),
        })?;
        streams.insert(
            path.to_string(),
            StreamEntry {
                metadata: metadata.clone(),
                dir_name,
            },
        );
        info!(path = %path, content_type = %metadata.content_type, "created stream");
        Ok((metadata, true))
    }

    /// Get a defensive copy of a stream's metadata.
    pub fn get(&self, path: &str) -> Result<StreamMetadata, StoreError> {
        Ok(self.snapshot(path)?.0)
    }

    /// Whether a live (non-expired) stream exists at `path`.
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Current tail offset of the stream.
    pub fn current_offset(&self, path: &str) -> Result<Offset, StoreError> {
        Ok(self.snapshot(path)?.0.current_offset)
    }

    /// Paths of all live streams.
    pub fn list(&self) -> Vec<String> {
        let now = Utc::now();
        let streams = self.streams.read();
        streams
            .iter()
            .filter(|(_, entry)| !entry.metadata.is_expired(now))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Delete a stream: drop its metadata and pooled handles, rename the
    /// stream directory aside, and unlink it in the background.
    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut streams = self.streams.write();
        self.teardown_locked(&mut streams, path)
    }

    /// Append to a stream. See the crate docs for the validation pipeline:
    /// producer triple, closed state, content type, idempotent-producer
    /// state, `Stream-Seq` monotonicity, then framed write + fsync,
    /// metadata commit and waiter wakeup.
    pub fn append(
        &self,
        path: &str,
        data: &[u8],
        opts: AppendOptions,
    ) -> Result<AppendResult, StoreError> {
        // Producer fields are all-or-none; reject before any locking.
        let claim = opts.producer_claim()?;
        if data.is_empty() {
            return Err(StoreError::EmptyBody);
        }

        // Serialize in-flight requests from the same producer so pipelined
        // out-of-order retries validate one at a time.
        let producer_lock = claim.as_ref().map(|c| self.producer_lock(path, c.id));
        let _producer_guard = producer_lock.as_ref().map(|lock| lock.lock());

        let mut streams = self.streams.write();
        if self.reap_if_expired_locked(&mut streams, path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let entry = streams
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        if entry.metadata.closed {
            // A replay of the exact append that closed the stream succeeds
            // idempotently; everything else is rejected.
            if let (Some(claim), Some(closed_by)) =
                (claim.as_ref(), entry.metadata.closed_by.as_ref())
            {
                if closed_by.producer_id == claim.id
                    && closed_by.epoch == claim.epoch
                    && closed_by.seq == claim.seq
                {
                    return Ok(AppendResult {
                        offset: entry.metadata.current_offset,
                        producer: ProducerOutcome::Duplicate,
                        last_seq: entry.metadata.last_seq.clone(),
                        closed: true,
                    });
                }
            }
            return Err(StoreError::StreamClosed);
        }

        if let Some(ct) = opts.content_type.as_deref() {
            if !content_type_matches(ct, &entry.metadata.content_type) {
                return Err(StoreError::ContentTypeMismatch {
                    expected: entry.metadata.content_type.clone(),
                    actual: ct.to_string(),
                });
            }
        }

        // Producer validation runs before the Stream-Seq check so producer
        // retries absorb as duplicates instead of tripping the sequence
        // conflict.
        let mut accepted_state = None;
        if let Some(claim) = claim.as_ref() {
            match validate_producer(entry.metadata.producers.get(claim.id), claim.epoch, claim.seq)?
            {
                ProducerCheck::Duplicate => {
                    return Ok(AppendResult {
                        offset: entry.metadata.current_offset,
                        producer: ProducerOutcome::Duplicate,
                        last_seq: entry.metadata.last_seq.clone(),
                        closed: entry.metadata.closed,
                    });
                }
                ProducerCheck::Accepted(state) => accepted_state = Some(state),
            }
        }

        if let (Some(seq), Some(last)) = (opts.seq.as_deref(), entry.metadata.last_seq.as_deref()) {
            if seq <= last {
                return Err(StoreError::SequenceConflict {
                    last: last.to_string(),
                    received: seq.to_string(),
                });
            }
        }

        let payloads = split_payload(&entry.metadata.content_type, data, false)?;
        for payload in &payloads {
            if payload.len() as u64 > MAX_MESSAGE_SIZE {
                return Err(StoreError::MessageTooLarge {
                    size: payload.len() as u64,
                    max: MAX_MESSAGE_SIZE,
                });
            }
        }

        let seg_path = self.segment_path(&entry.dir_name);
        let writer = self.pool.writer(&seg_path)?;
        let mut written = 0u64;
        for payload in &payloads {
            written += segment::write_message(&mut &*writer, payload)?;
        }
        writer.sync_all()?;

        let metadata = &mut entry.metadata;
        metadata.current_offset.byte_offset += written;
        if opts.seq.is_some() {
            metadata.last_seq = opts.seq.clone();
        }
        if let (Some(claim), Some(state)) = (claim.as_ref(), accepted_state) {
            metadata.producers.insert(claim.id.to_string(), state);
        }
        let mut closed_by = None;
        if opts.close {
            metadata.closed = true;
            if let Some(claim) = claim.as_ref() {
                closed_by = Some(ClosedBy {
                    producer_id: claim.id.to_string(),
                    epoch: claim.epoch,
                    seq: claim.seq,
                });
                metadata.closed_by = closed_by.clone();
            }
        }

        // The segment write is the source of truth; a failed metadata
        // commit is reconciled by the next recovery pass.
        if let Err(e) = self.meta.update_append_state(
            path,
            metadata.current_offset,
            metadata.last_seq.clone(),
            claim.as_ref().and_then(|c| accepted_state.map(|s| (c.id, s))),
            opts.close.then_some(true),
            closed_by,
        ) {
            warn!(path = %path, error = %e, "metadata update failed after segment write");
        }

        let result = AppendResult {
            offset: metadata.current_offset,
            producer: if claim.is_some() {
                ProducerOutcome::Accepted
            } else {
                ProducerOutcome::None
            },
            last_seq: metadata.last_seq.clone(),
            closed: metadata.closed,
        };
        debug!(path = %path, offset = %result.offset, messages = payloads.len(), "appended");

        drop(streams);
        self.bus.notify(path);
        Ok(result)
    }

    /// Close a stream to further appends. Idempotent.
    pub fn close_stream(&self, path: &str) -> Result<CloseResult, StoreError> {
        let mut streams = self.streams.write();
        if self.reap_if_expired_locked(&mut streams, path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let entry = streams
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        if !entry.metadata.closed {
            entry.metadata.closed = true;
            self.meta.set_closed(path, true, None)?;
            info!(path = %path, "closed stream");
        }
        let result = CloseResult {
            offset: entry.metadata.current_offset,
            last_seq: entry.metadata.last_seq.clone(),
        };

        drop(streams);
        // Wake waiters so they observe the closed stream.
        self.bus.notify(path);
        Ok(result)
    }

    /// Read messages from `offset` to the end of the segment.
    pub fn read(&self, path: &str, offset: Offset) -> Result<ReadResult, StoreError> {
        let (metadata, dir_name) = self.snapshot(path)?;
        if offset == metadata.current_offset {
            return Ok(ReadResult {
                messages: Vec::new(),
                next_offset: offset,
                up_to_date: true,
            });
        }

        let reader = self.pool.reader(&self.segment_path(&dir_name))?;
        let mut messages = Vec::new();
        let mut pos = offset.byte_offset;
        while let Some((data, end)) = segment::read_message_at(&reader, pos)? {
            messages.push(StreamMessage {
                data,
                offset: Offset::new(offset.read_seq, end),
            });
            pos = end;
        }

        let next_offset = messages.last().map_or(offset, |m| m.offset);
        let up_to_date = messages
            .last()
            .map_or(true, |m| m.offset >= metadata.current_offset);
        Ok(ReadResult {
            messages,
            next_offset,
            up_to_date,
        })
    }

    /// Wait for messages past `offset`, returning as soon as data is
    /// available, the timeout elapses, the stream is closed, or `cancel`
    /// fires. Spurious wakeups may return an empty, non-timed-out result;
    /// callers loop externally.
    pub async fn wait_for_messages(
        &self,
        cancel: &CancellationToken,
        path: &str,
        offset: Offset,
        timeout: Duration,
    ) -> Result<WaitResult, StoreError> {
        let first = self.read(path, offset)?;
        if !first.messages.is_empty() {
            return Ok(wait_result(first, false, false));
        }
        if self.get(path)?.closed {
            return Ok(WaitResult {
                messages: Vec::new(),
                next_offset: first.next_offset,
                timed_out: false,
                closed: true,
            });
        }

        let mut guard = self.bus.register(path);

        // Re-read after registering; an append racing the first read would
        // otherwise go unnoticed until the next notify.
        let second = self.read(path, offset)?;
        if !second.messages.is_empty() {
            return Ok(wait_result(second, false, false));
        }

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            _ = guard.notified() => {
                let result = self.read(path, offset)?;
                let closed = result.messages.is_empty()
                    && self.get(path).map(|m| m.closed).unwrap_or(false);
                Ok(wait_result(result, false, closed))
            }
            _ = &mut sleep => Ok(WaitResult {
                messages: Vec::new(),
                next_offset: offset,
                timed_out: true,
                closed: false,
            }),
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
        }
    }

    /// Tear down every expired stream. The background sweeper calls this on
    /// its interval; it is also callable directly.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let mut streams = self.streams.write();
        let expired: Vec<String> = streams
            .iter()
            .filter(|(_, entry)| entry.metadata.is_expired(now))
            .map(|(path, _)| path.clone())
            .collect();
        for path in expired {
            debug!(path = %path, "sweeping expired stream");
            if let Err(e) = self.teardown_locked(&mut streams, &path) {
                warn!(path = %path, error = %e, "failed to sweep expired stream");
            }
        }
    }

    /// Shut down: stop the sweeper and wait for it, drop pooled file
    /// handles, and flush the metadata store.
    pub async fn close(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            handle.stop.cancel();
            let _ = handle.done.await;
        }
        self.pool.clear();
        if let Err(e) = self.meta.sync() {
            warn!(error = %e, "failed to sync metadata store on close");
        }
    }

    fn streams_dir(&self) -> PathBuf {
        self.options.data_dir.join(STREAMS_DIR)
    }

    fn segment_path(&self, dir_name: &str) -> PathBuf {
        self.streams_dir().join(dir_name).join(SEGMENT_FILE_NAME)
    }

    fn producer_lock(&self, path: &str, producer_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.producer_locks.lock();
        locks
            .entry((path.to_string(), producer_id.to_string()))
            .or_default()
            .clone()
    }

    /// Clone out a stream's metadata and directory name, reaping it first
    /// when expired.
    fn snapshot(&self, path: &str) -> Result<(StreamMetadata, String), StoreError> {
        {
            let streams = self.streams.read();
            match streams.get(path) {
                Some(entry) if !entry.metadata.is_expired(Utc::now()) => {
                    return Ok((entry.metadata.clone(), entry.dir_name.clone()));
                }
                Some(_) => {}
                None => return Err(StoreError::NotFound(path.to_string())),
            }
        }
        // Expired: upgrade to the write lock and re-check.
        let mut streams = self.streams.write();
        if let Some(entry) = streams.get(path) {
            if !entry.metadata.is_expired(Utc::now()) {
                return Ok((entry.metadata.clone(), entry.dir_name.clone()));
            }
            if let Err(e) = self.teardown_locked(&mut streams, path) {
                warn!(path = %path, error = %e, "failed to reap expired stream");
            }
        }
        Err(StoreError::NotFound(path.to_string()))
    }

    /// Reap `path` if its entry has expired. Returns whether it was
    /// expired (and is now gone).
    fn reap_if_expired_locked(
        &self,
        streams: &mut HashMap<String, StreamEntry>,
        path: &str,
    ) -> bool {
        let expired = streams
            .get(path)
            .is_some_and(|entry| entry.metadata.is_expired(Utc::now()));
        if expired {
            if let Err(e) = self.teardown_locked(streams, path) {
                warn!(path = %path, error = %e, "failed to reap expired stream");
            }
        }
        expired
    }

    /// Remove a stream while holding the write lock: cache entry, pooled
    /// handles, metadata row, then rename the directory aside and unlink
    /// it in the background.
    fn teardown_locked(
        &self,
        streams: &mut HashMap<String, StreamEntry>,
        path: &str,
    ) -> Result<(), StoreError> {
        let entry = streams
            .remove(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        self.pool.remove(&self.segment_path(&entry.dir_name));
        self.meta.delete(path)?;

        let dir = self.streams_dir().join(&entry.dir_name);
        let deleted = self.streams_dir().join(deleted_dir_name(&entry.dir_name));
        match std::fs::rename(&dir, &deleted) {
            Ok(()) => spawn_unlink(deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %path, "deleted stream");
        Ok(())
    }

    fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let stop = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let weak = Arc::downgrade(self);
        let token = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else { break };
                        store.sweep_expired();
                    }
                }
            }
            let _ = done_tx.send(());
        });
        *self.sweeper.lock() = Some(SweeperHandle {
            stop,
            done: done_rx,
        });
    }
}

/// Unlink a renamed-aside directory without blocking the caller. The
/// rename already happened, so a failure here only leaks a directory that
/// the next startup reaps.
fn spawn_unlink(dir: PathBuf) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn_blocking(move || {
            let _ = std::fs::remove_dir_all(&dir);
        });
    } else {
        let _ = std::fs::remove_dir_all(&dir);
    }
}

fn wait_result(read: ReadResult, timed_out: bool, closed: bool) -> WaitResult {
    WaitResult {
        messages: read.messages,
        next_offset: read.next_offset,
        timed_out,
        closed,
    }
}

/// Split an append body into the logical messages it frames.
///
/// JSON streams parse the body as one value; a top-level array flattens
/// one level into per-element messages, anything else is a single message.
/// The empty array is only allowed where `allow_empty_array` says so
/// (create, not append). Non-JSON bodies are a single opaque message.
fn split_payload(
    content_type: &str,
    data: &[u8],
    allow_empty_array: bool,
) -> Result<Vec<Vec<u8>>, StoreError> {
    if !is_json_content_type(content_type) {
        return Ok(vec![data.to_vec()]);
    }
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| StoreError::InvalidJson(e.to_string()))?;
    match value {
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                if allow_empty_array {
                    Ok(Vec::new())
                } else {
                    Err(StoreError::EmptyJsonArray)
                }
            } else {
                items
                    .iter()
                    .map(|item| {
                        serde_json::to_vec(item).map_err(|e| StoreError::InvalidJson(e.to_string()))
                    })
                    .collect()
            }
        }
        other => Ok(vec![
            serde_json::to_vec(&other).map_err(|e| StoreError::InvalidJson(e.to_string()))?,
        ]),
    }
}

enum ProducerCheck {
    Accepted(ProducerState),
    Duplicate,
}

/// Kafka-style idempotent-producer validation.
fn validate_producer(
    state: Option<&ProducerState>,
    epoch: i64,
    seq: i64,
) -> Result<ProducerCheck, StoreError> {
    let accepted = |epoch: i64, seq: i64| {
        ProducerCheck::Accepted(ProducerState {
            epoch,
            last_seq: seq,
            last_updated: Utc::now().timestamp(),
        })
    };
    match state {
        None if seq == 0 => Ok(accepted(epoch, 0)),
        None => Err(StoreError::ProducerSeqGap {
            expected: 0,
            received: seq,
        }),
        Some(state) if epoch < state.epoch => Err(StoreError::StaleEpoch {
            current: state.epoch,
            received: epoch,
        }),
        // A new epoch fences all prior instances and must start at 0.
        Some(state) if epoch > state.epoch => {
            if seq == 0 {
                Ok(accepted(epoch, 0))
            } else {
                Err(StoreError::InvalidEpochSeq {
                    epoch,
                    received: seq,
                })
            }
        }
        Some(state) if seq <= state.last_seq => Ok(ProducerCheck::Duplicate),
        Some(state) if seq == state.last_seq + 1 => Ok(accepted(epoch, seq)),
        Some(state) => Err(StoreError::ProducerSeqGap {
            expected: state.last_seq + 1,
            received: seq,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    fn text_config() -> StreamConfig {
        StreamConfig {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        }
    }

    fn json_config() -> StreamConfig {
        StreamConfig {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    fn producer_opts(id: &str, epoch: i64, seq: i64, body_seq: Option<&str>) -> AppendOptions {
        AppendOptions {
            seq: body_seq.map(String::from),
            producer_id: Some(id.to_string()),
            producer_epoch: Some(epoch),
            producer_seq: Some(seq),
            ..Default::default()
        }
    }

    fn read_all(store: &StreamStore, path: &str) -> Vec<Vec<u8>> {
        store
            .read(path, Offset::ZERO)
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.data)
            .collect()
    }

    /// Locate the live segment file for the single stream under `data_dir`.
    fn find_segment(data_dir: &Path) -> PathBuf {
        let streams_dir = data_dir.join(STREAMS_DIR);
        let entry = std::fs::read_dir(&streams_dir)
            .unwrap()
            .flatten()
            .find(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|name| !is_deleted_dir_name(name))
            })
            .expect("live stream directory");
        entry.path().join(SEGMENT_FILE_NAME)
    }

    #[tokio::test]
    async fn create_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();

        let (metadata, created) = store.create("/s", text_config()).unwrap();
        assert!(created);
        assert_eq!(metadata.content_type, "text/plain");
        assert_eq!(metadata.current_offset, Offset::ZERO);

        assert!(store.has("/s"));
        let loaded = store.get("/s").unwrap();
        assert_eq!(loaded.path, "/s");
        assert!(!store.has("/other"));
    }

    #[tokio::test]
    async fn create_is_idempotent_and_detects_config_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();

        let (first, created) = store.create("/s", text_config()).unwrap();
        assert!(created);
        let (second, created) = store.create("/s", text_config()).unwrap();
        assert!(!created);
        assert_eq!(first.created_at, second.created_at);

        // Content type compares on the media type, case-insensitively.
        let (_, created) = store
            .create(
                "/s",
                StreamConfig {
                    content_type: Some("TEXT/PLAIN; charset=utf-8".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!created);

        assert!(matches!(
            store.create("/s", json_config()),
            Err(StoreError::ConfigMismatch)
        ));
        assert!(matches!(
            store.create(
                "/s",
                StreamConfig {
                    content_type: Some("text/plain".to_string()),
                    ttl_seconds: Some(60),
                    ..Default::default()
                }
            ),
            Err(StoreError::ConfigMismatch)
        ));
    }

    #[tokio::test]
    async fn create_rejects_ttl_and_expiry_together() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        assert!(matches!(
            store.create(
                "/s",
                StreamConfig {
                    ttl_seconds: Some(60),
                    expires_at: Some(Utc::now()),
                    ..Default::default()
                }
            ),
            Err(StoreError::TtlConflict)
        ));
    }

    #[tokio::test]
    async fn append_and_read_with_framed_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let result = store
            .append("/s", b"hello", AppendOptions::default())
            .unwrap();
        assert_eq!(result.offset, Offset::new(0, 9));
        assert_eq!(result.producer, ProducerOutcome::None);

        let read = store.read("/s", Offset::ZERO).unwrap();
        assert_eq!(read.messages.len(), 1);
        assert_eq!(read.messages[0].data, b"hello");
        assert_eq!(read.messages[0].offset, Offset::new(0, 9));
        assert!(read.up_to_date);

        let read = store.read("/s", Offset::new(0, 9)).unwrap();
        assert!(read.messages.is_empty());
        assert!(read.up_to_date);
    }

    #[tokio::test]
    async fn read_resumes_from_mid_stream_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store
            .append("/s", b"hello", AppendOptions::default())
            .unwrap();
        store
            .append("/s", b"world", AppendOptions::default())
            .unwrap();

        let read = store.read("/s", Offset::new(0, 9)).unwrap();
        assert_eq!(read.messages.len(), 1);
        assert_eq!(read.messages[0].data, b"world");
        assert_eq!(read.next_offset, Offset::new(0, 18));
        assert!(read.up_to_date);
    }

    #[tokio::test]
    async fn json_arrays_flatten_one_level() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/j", json_config()).unwrap();

        store
            .append("/j", br#"[{"id":1},{"id":2}]"#, AppendOptions::default())
            .unwrap();
        let messages = read_all(&store, "/j");
        assert_eq!(messages, vec![br#"{"id":1}"#.to_vec(), br#"{"id":2}"#.to_vec()]);

        // Nested arrays stay intact: only one level flattens.
        store
            .append("/j", br#"[[1,2],3]"#, AppendOptions::default())
            .unwrap();
        let messages = read_all(&store, "/j");
        assert_eq!(messages[2], b"[1,2]".to_vec());
        assert_eq!(messages[3], b"3".to_vec());

        // A non-array value is a single message.
        store
            .append("/j", br#"{"solo":true}"#, AppendOptions::default())
            .unwrap();
        assert_eq!(read_all(&store, "/j").len(), 5);
    }

    #[tokio::test]
    async fn empty_json_array_rejected_on_append_allowed_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/j", json_config()).unwrap();

        assert!(matches!(
            store.append("/j", b"[]", AppendOptions::default()),
            Err(StoreError::EmptyJsonArray)
        ));

        let (metadata, created) = store
            .create(
                "/j2",
                StreamConfig {
                    initial_data: Some(b"[]".to_vec()),
                    ..json_config()
                },
            )
            .unwrap();
        assert!(created);
        assert_eq!(metadata.current_offset, Offset::ZERO);
        assert!(store.read("/j2", Offset::ZERO).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn invalid_json_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/j", json_config()).unwrap();
        assert!(matches!(
            store.append("/j", b"{not json", AppendOptions::default()),
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[tokio::test]
    async fn create_with_initial_data_appends_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();

        let (metadata, _) = store
            .create(
                "/s",
                StreamConfig {
                    initial_data: Some(b"seed".to_vec()),
                    ..text_config()
                },
            )
            .unwrap();
        assert_eq!(metadata.current_offset, Offset::new(0, 8));
        assert_eq!(read_all(&store, "/s"), vec![b"seed".to_vec()]);
    }

    #[tokio::test]
    async fn append_validates_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let err = store
            .append(
                "/s",
                b"x",
                AppendOptions {
                    content_type: Some("application/json".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ContentTypeMismatch { .. }));

        // Parameters and case are ignored.
        store
            .append(
                "/s",
                b"x",
                AppendOptions {
                    content_type: Some("Text/Plain; charset=utf-8".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn stream_seq_must_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let seq = |s: &str| AppendOptions {
            seq: Some(s.to_string()),
            ..Default::default()
        };
        store.append("/s", b"a", seq("2")).unwrap();
        assert!(matches!(
            store.append("/s", b"b", seq("1")),
            Err(StoreError::SequenceConflict { .. })
        ));
        assert!(matches!(
            store.append("/s", b"b", seq("2")),
            Err(StoreError::SequenceConflict { .. })
        ));
        let result = store.append("/s", b"b", seq("3")).unwrap();
        assert_eq!(result.last_seq.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn producer_exactly_once_under_reorder() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        store.append("/s", b"a", producer_opts("p", 0, 0, None)).unwrap();
        store.append("/s", b"b", producer_opts("p", 0, 1, None)).unwrap();
        store.append("/s", b"c", producer_opts("p", 0, 2, None)).unwrap();
        let tail = store.current_offset("/s").unwrap();

        // Replay is absorbed with no new bytes.
        let replay = store
            .append("/s", b"b", producer_opts("p", 0, 1, None))
            .unwrap();
        assert_eq!(replay.producer, ProducerOutcome::Duplicate);
        assert_eq!(replay.offset, tail);
        assert_eq!(store.current_offset("/s").unwrap(), tail);

        // A gap is rejected with diagnostics.
        let err = store
            .append("/s", b"d", producer_opts("p", 0, 4, None))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ProducerSeqGap {
                expected: 3,
                received: 4
            }
        ));

        store.append("/s", b"d", producer_opts("p", 0, 3, None)).unwrap();
        assert_eq!(
            read_all(&store, "/s"),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[tokio::test]
    async fn epoch_fencing_rejects_zombies() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        for seq in 0..=5 {
            store
                .append("/s", b"x", producer_opts("p", 0, seq, None))
                .unwrap();
        }
        let tail = store.current_offset("/s").unwrap();

        // New instance bumps the epoch and resets the sequence.
        store.append("/s", b"y", producer_opts("p", 1, 0, None)).unwrap();
        let tail_after = store.current_offset("/s").unwrap();

        // The old instance is fenced out.
        let err = store
            .append("/s", b"z", producer_opts("p", 0, 6, None))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StaleEpoch {
                current: 1,
                received: 0
            }
        ));
        assert_eq!(store.current_offset("/s").unwrap(), tail_after);
        assert!(tail_after > tail);
    }

    #[tokio::test]
    async fn new_epoch_must_start_at_seq_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        store.append("/s", b"a", producer_opts("p", 0, 0, None)).unwrap();
        assert!(matches!(
            store.append("/s", b"b", producer_opts("p", 1, 5, None)),
            Err(StoreError::InvalidEpochSeq { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_producer_must_start_at_seq_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        assert!(matches!(
            store.append("/s", b"a", producer_opts("p", 0, 3, None)),
            Err(StoreError::ProducerSeqGap {
                expected: 0,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn partial_producer_triple_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let err = store
            .append(
                "/s",
                b"x",
                AppendOptions {
                    producer_id: Some("p".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::PartialProducer));
    }

    #[tokio::test]
    async fn producer_retry_wins_over_sequence_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        store
            .append("/s", b"a", producer_opts("p", 0, 0, Some("10")))
            .unwrap();
        // The retry reuses a Stream-Seq that would now conflict; producer
        // dedup runs first and absorbs it.
        let replay = store
            .append("/s", b"a", producer_opts("p", 0, 0, Some("10")))
            .unwrap();
        assert_eq!(replay.producer, ProducerOutcome::Duplicate);
    }

    #[tokio::test]
    async fn closed_streams_reject_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store.append("/s", b"a", AppendOptions::default()).unwrap();

        let result = store.close_stream("/s").unwrap();
        assert_eq!(result.offset, Offset::new(0, 5));
        // Idempotent.
        store.close_stream("/s").unwrap();

        assert!(matches!(
            store.append("/s", b"b", AppendOptions::default()),
            Err(StoreError::StreamClosed)
        ));
        assert!(store.get("/s").unwrap().closed);
    }

    #[tokio::test]
    async fn close_via_append_replays_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let mut opts = producer_opts("p", 0, 0, None);
        opts.close = true;
        let result = store.append("/s", b"final", opts.clone()).unwrap();
        assert!(result.closed);
        let tail = result.offset;

        // The same producer retrying the closing append gets a duplicate.
        let replay = store.append("/s", b"final", opts).unwrap();
        assert_eq!(replay.producer, ProducerOutcome::Duplicate);
        assert!(replay.closed);
        assert_eq!(replay.offset, tail);

        // Anyone else hits the closed stream.
        assert!(matches!(
            store.append("/s", b"x", producer_opts("q", 0, 0, None)),
            Err(StoreError::StreamClosed)
        ));
        assert!(matches!(
            store.append("/s", b"x", AppendOptions::default()),
            Err(StoreError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn empty_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        assert!(matches!(
            store.append("/s", b"", AppendOptions::default()),
            Err(StoreError::EmptyBody)
        ));
    }

    #[tokio::test]
    async fn append_to_unknown_stream_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        assert!(matches!(
            store.append("/nope", b"x", AppendOptions::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/q", text_config()).unwrap();
        let tail = store.current_offset("/q").unwrap();

        let appender = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                store.append("/q", b"wakeup", AppendOptions::default()).unwrap();
            })
        };

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let result = store
            .wait_for_messages(&cancel, "/q", tail, Duration::from_secs(5))
            .await
            .unwrap();
        appender.await.unwrap();

        assert!(!result.timed_out);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].data, b"wakeup");
        assert!(started.elapsed() < Duration::from_millis(1500));

        // At the new tail, a short wait times out empty.
        let result = store
            .wait_for_messages(&cancel, "/q", result.next_offset, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(result.messages.is_empty());
        assert_eq!(store.bus.waiter_count("/q"), 0);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store.append("/s", b"already-there", AppendOptions::default()).unwrap();

        let cancel = CancellationToken::new();
        let result = store
            .wait_for_messages(&cancel, "/s", Offset::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.messages.len(), 1);
    }

    #[tokio::test]
    async fn wait_reports_closed_streams() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store.close_stream("/s").unwrap();

        let cancel = CancellationToken::new();
        let tail = store.current_offset("/s").unwrap();
        let result = store
            .wait_for_messages(&cancel, "/s", tail, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.closed);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let err = store
            .wait_for_messages(&cancel, "/s", Offset::ZERO, Duration::from_secs(5))
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(store.bus.waiter_count("/s"), 0);
    }

    #[tokio::test]
    async fn delete_then_recreate_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store.append("/s", b"old", AppendOptions::default()).unwrap();

        store.delete("/s").unwrap();
        assert!(!store.has("/s"));
        assert!(matches!(store.delete("/s"), Err(StoreError::NotFound(_))));

        let (metadata, created) = store.create("/s", text_config()).unwrap();
        assert!(created);
        assert_eq!(metadata.current_offset, Offset::ZERO);
        assert!(store.read("/s", Offset::ZERO).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn expired_streams_surface_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store
            .create(
                "/e",
                StreamConfig {
                    expires_at: Some(Utc::now() + chrono::Duration::milliseconds(100)),
                    ..text_config()
                },
            )
            .unwrap();
        assert!(store.has("/e"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.has("/e"));
        assert!(matches!(store.get("/e"), Err(StoreError::NotFound(_))));

        // An expired stream is recreatable with any configuration.
        let (_, created) = store.create("/e", json_config()).unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn sweeper_reaps_expired_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StoreOptions::new(dir.path());
        options.cleanup_interval = Some(Duration::from_millis(100));
        let store = StreamStore::open(options).unwrap();

        store
            .create(
                "/e",
                StreamConfig {
                    expires_at: Some(Utc::now() + chrono::Duration::milliseconds(200)),
                    ..text_config()
                },
            )
            .unwrap();
        store.append("/e", b"x", AppendOptions::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;

        // Swept without any access to the path.
        assert!(store.streams.read().get("/e").is_none());
        // The stream directory was renamed aside or already unlinked.
        let leftover: Vec<_> = std::fs::read_dir(dir.path().join(STREAMS_DIR))
            .unwrap()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|name| !is_deleted_dir_name(name))
            })
            .collect();
        assert!(leftover.is_empty());

        store.close().await;
    }

    #[tokio::test]
    async fn manual_sweep_tears_down_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store
            .create(
                "/e",
                StreamConfig {
                    expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..text_config()
                },
            )
            .unwrap();
        store.create("/live", text_config()).unwrap();

        store.sweep_expired();
        assert!(store.streams.read().get("/e").is_none());
        assert!(store.has("/live"));
        assert_eq!(store.list(), vec!["/live".to_string()]);
    }

    #[tokio::test]
    async fn recovery_reconciles_offset_after_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        for body in [b"a", b"b", b"c"] {
            store.append("/s", body, AppendOptions::default()).unwrap();
        }
        assert_eq!(store.current_offset("/s").unwrap(), Offset::new(0, 15));
        store.close().await;
        drop(store);

        // Simulate a crash mid-append: a dangling length prefix.
        let seg = find_segment(dir.path());
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&seg).unwrap();
            file.write_all(&10u32.to_be_bytes()).unwrap();
            file.sync_all().unwrap();
        }

        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        assert_eq!(store.current_offset("/s").unwrap(), Offset::new(0, 15));
        // The dangling prefix was reclaimed as writable space.
        assert_eq!(std::fs::metadata(&seg).unwrap().len(), 15);

        store.append("/s", b"d", AppendOptions::default()).unwrap();
        assert_eq!(
            read_all(&store, "/s"),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[tokio::test]
    async fn recovery_reconciles_stale_metadata_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store.append("/s", b"one", AppendOptions::default()).unwrap();
        store.append("/s", b"two", AppendOptions::default()).unwrap();
        store.close().await;
        drop(store);

        // Lose the second frame behind the metadata's back.
        let seg = find_segment(dir.path());
        let file = OpenOptions::new().write(true).open(&seg).unwrap();
        file.set_len(7).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        assert_eq!(store.current_offset("/s").unwrap(), Offset::new(0, 7));
        assert_eq!(read_all(&store, "/s"), vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn recovery_drops_metadata_for_missing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store.close().await;
        drop(store);

        let seg = find_segment(dir.path());
        std::fs::remove_dir_all(seg.parent().unwrap()).unwrap();

        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        assert!(!store.has("/s"));
    }

    #[tokio::test]
    async fn state_survives_clean_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();
        store
            .append("/s", b"keep", producer_opts("p", 2, 0, Some("s-1")))
            .unwrap();
        store.close().await;
        drop(store);

        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        let metadata = store.get("/s").unwrap();
        assert_eq!(metadata.current_offset, Offset::new(0, 8));
        assert_eq!(metadata.last_seq.as_deref(), Some("s-1"));
        let producer = metadata.producers.get("p").unwrap();
        assert_eq!((producer.epoch, producer.last_seq), (2, 0));
        assert_eq!(read_all(&store, "/s"), vec![b"keep".to_vec()]);
    }

    #[tokio::test]
    async fn framed_sizes_sum_to_current_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/j", json_config()).unwrap();

        store.append("/j", br#"{"a":1}"#, AppendOptions::default()).unwrap();
        store
            .append("/j", br#"[true,false,null]"#, AppendOptions::default())
            .unwrap();
        store.append("/j", br#""text""#, AppendOptions::default()).unwrap();

        let read = store.read("/j", Offset::ZERO).unwrap();
        let framed: u64 = read
            .messages
            .iter()
            .map(|m| crate::segment::framed_len(m.data.len()))
            .sum();
        assert_eq!(framed, store.current_offset("/j").unwrap().byte_offset);
        assert_eq!(
            std::fs::metadata(find_segment(dir.path())).unwrap().len(),
            framed
        );
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_stream_linearize() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        let mut tasks = Vec::new();
        for writer in 0..4 {
            let store = store.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                for i in 0..25 {
                    let body = format!("w{writer}-{i}");
                    store
                        .append("/s", body.as_bytes(), AppendOptions::default())
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let read = store.read("/s", Offset::ZERO).unwrap();
        assert_eq!(read.messages.len(), 100);
        let framed: u64 = read
            .messages
            .iter()
            .map(|m| crate::segment::framed_len(m.data.len()))
            .sum();
        assert_eq!(framed, store.current_offset("/s").unwrap().byte_offset);
        // Each message's offset is the running sum up to and including it.
        let mut running = 0;
        for message in &read.messages {
            running += crate::segment::framed_len(message.data.len());
            assert_eq!(message.offset.byte_offset, running);
        }
    }

    #[tokio::test]
    async fn appends_to_different_streams_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/a", text_config()).unwrap();
        store.create("/b", text_config()).unwrap();

        store.append("/a", b"aaaa", AppendOptions::default()).unwrap();
        store.append("/b", b"bb", AppendOptions::default()).unwrap();

        assert_eq!(store.current_offset("/a").unwrap(), Offset::new(0, 8));
        assert_eq!(store.current_offset("/b").unwrap(), Offset::new(0, 6));
        assert_eq!(read_all(&store, "/a"), vec![b"aaaa".to_vec()]);
        assert_eq!(read_all(&store, "/b"), vec![b"bb".to_vec()]);
    }

    #[tokio::test]
    async fn last_seq_stays_monotonic_across_producers() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(StoreOptions::new(dir.path())).unwrap();
        store.create("/s", text_config()).unwrap();

        store
            .append("/s", b"a", producer_opts("p1", 0, 0, Some("001")))
            .unwrap();
        store
            .append("/s", b"b", producer_opts("p2", 0, 0, Some("002")))
            .unwrap();
        // A second producer cannot move the stream sequence backwards.
        assert!(matches!(
            store.append("/s", b"c", producer_opts("p1", 0, 1, Some("001"))),
            Err(StoreError::SequenceConflict { .. })
        ));
        assert_eq!(store.get("/s").unwrap().last_seq.as_deref(), Some("002"));
    }

    #[test]
    fn producer_validation_table() {
        let state = ProducerState {
            epoch: 3,
            last_seq: 7,
            last_updated: 0,
        };

        assert!(matches!(
            validate_producer(None, 0, 0),
            Ok(ProducerCheck::Accepted(s)) if s.epoch == 0 && s.last_seq == 0
        ));
        assert!(matches!(
            validate_producer(None, 0, 1),
            Err(StoreError::ProducerSeqGap { expected: 0, received: 1 })
        ));
        assert!(matches!(
            validate_producer(Some(&state), 2, 0),
            Err(StoreError::StaleEpoch { current: 3, received: 2 })
        ));
        assert!(matches!(
            validate_producer(Some(&state), 4, 0),
            Ok(ProducerCheck::Accepted(s)) if s.epoch == 4 && s.last_seq == 0
        ));
        assert!(matches!(
            validate_producer(Some(&state), 4, 1),
            Err(StoreError::InvalidEpochSeq { epoch: 4, received: 1 })
        ));
        assert!(matches!(
            validate_producer(Some(&state), 3, 7),
            Ok(ProducerCheck::Duplicate)
        ));
        assert!(matches!(
            validate_producer(Some(&state), 3, 2),
            Ok(ProducerCheck::Duplicate)
        ));
        assert!(matches!(
            validate_producer(Some(&state), 3, 8),
            Ok(ProducerCheck::Accepted(s)) if s.last_seq == 8
        ));
        assert!(matches!(
            validate_producer(Some(&state), 3, 9),
            Err(StoreError::ProducerSeqGap { expected: 8, received: 9 })
        ));
    }

    #[test]
    fn split_payload_shapes() {
        // Non-JSON bodies pass through whole.
        let parts = split_payload("text/plain", b"[1,2]", false).unwrap();
        assert_eq!(parts, vec![b"[1,2]".to_vec()]);

        let parts = split_payload("application/json", br#"[1,"two",null]"#, false).unwrap();
        assert_eq!(
            parts,
            vec![b"1".to_vec(), br#""two""#.to_vec(), b"null".to_vec()]
        );

        let parts = split_payload("application/json", b"42", false).unwrap();
        assert_eq!(parts, vec![b"42".to_vec()]);

        assert!(matches!(
            split_payload("application/json", b"[]", false),
            Err(StoreError::EmptyJsonArray)
        ));
        assert!(split_payload("application/json", b"[]", true)
            .unwrap()
            .is_empty());
    }
}
