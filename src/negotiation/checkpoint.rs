//! Checkpointed session state.
//!
//! Every mutation of a [`Session`] is expressed as a [`WriteKind`] and applied
//! through [`Checkpointer::record`], which both mutates the in-memory session
//! and stages a [`CheckpointWrite`] with the next sequence id. Staged writes
//! are made durable by [`Checkpointer::flush`], which then stores a snapshot
//! ([`Checkpoint`]) holding the [`TurnState`](crate::TurnState) and the trailing
//! window of messages.
//!
//! Recovery ([`recover`]) loads the latest snapshot and replays any write with
//! a higher sequence id. Because the live path and the replay path share
//! `Session::apply_write`, a recovered session is indistinguishable from the
//! one that crashed.
//!
//! # Layout
//!
//! ```text
//! thread "s-42"
//!   writes     #1 SessionCreated   #2 StatusChanged(active)   #3 MessageAppended   #4 MessageAppended
//!   snapshots  seq=1 parent=None   seq=3 parent=1             seq=4 parent=3
//!                                                              ▲ latest
//! ```
//!
//! Sequence ids are strictly increasing per thread and snapshots form a single
//! linear parent chain. Re-appending an already applied sequence id is a
//! no-op, not an error.
//!
//! Two backends ship with the crate: [`MemoryCheckpointStore`] and the durable
//! [`JsonlCheckpointStore`], which keeps one append-only, SHA-256 hash-chained
//! `.jsonl` ledger for writes and one for snapshots per thread.

use crate::negotiation::config::NegotiationConfig;
use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::model::{
    AgreementDetails, Message, Participant, Role, Session, SessionStatus, TerminationReason,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Error type at the store boundary.
pub type StoreError = Box<dyn Error + Send + Sync>;

/// One incremental, replayable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteKind {
    SessionCreated {
        property_id: String,
        participants: Vec<Participant>,
        context: serde_json::Map<String, serde_json::Value>,
        created_at: DateTime<Utc>,
        first_speaker: Role,
    },
    ParticipantAdded {
        participant: Participant,
    },
    MessageAppended {
        message: Message,
    },
    StatusChanged {
        status: SessionStatus,
        termination_reason: Option<TerminationReason>,
        agreement: Option<AgreementDetails>,
    },
}

/// A write-log entry keyed by `{thread_id, sequence_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointWrite {
    pub thread_id: String,
    pub sequence_id: u64,
    pub recorded_at: DateTime<Utc>,
    pub write: WriteKind,
}

/// A snapshot record. `snapshot.history` holds only the trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub sequence_id: u64,
    pub parent_sequence_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub snapshot: Session,
}

/// Durable key-value store for checkpoints, keyed by thread (session) id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append to the write log. Returns `Ok(false)` when `sequence_id` was
    /// already applied for this thread.
    async fn append_write(&self, write: CheckpointWrite) -> Result<bool, StoreError>;

    /// Move the "latest" pointer to `checkpoint`, retaining earlier snapshots.
    /// Returns `Ok(false)` when a snapshot at or beyond this sequence exists.
    async fn write_snapshot(&self, checkpoint: Checkpoint) -> Result<bool, StoreError>;

    async fn latest_snapshot(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Writes with `sequence_id > after`, in sequence order.
    async fn writes_after(
        &self,
        thread_id: &str,
        after: u64,
    ) -> Result<Vec<CheckpointWrite>, StoreError>;

    /// Every snapshot ever stored for the thread, oldest first.
    async fn snapshot_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError>;

    /// Threads that have at least one write.
    async fn thread_ids(&self) -> Result<Vec<String>, StoreError>;
}

// ── Replay ───────────────────────────────────────────────────────────────

impl Session {
    /// Apply one write. Shared by the live path and by recovery.
    pub(crate) fn apply_write(&mut self, write: &WriteKind, recorded_at: DateTime<Utc>) {
        match write {
            WriteKind::SessionCreated { .. } => {}
            WriteKind::ParticipantAdded { participant } => {
                if !self.has_participant(&participant.participant_id) {
                    self.participants.push(participant.clone());
                }
                self.updated_at = recorded_at;
                self.refresh_active_participant();
            }
            WriteKind::MessageAppended { message } => {
                self.record_message(message.clone());
            }
            WriteKind::StatusChanged {
                status,
                termination_reason,
                agreement,
            } => {
                self.status = *status;
                if termination_reason.is_some() {
                    self.turn_state.termination_reason = *termination_reason;
                }
                if agreement.is_some() {
                    self.turn_state.agreement = agreement.clone();
                }
                self.updated_at = recorded_at;
                self.refresh_active_participant();
            }
        }
    }

    fn from_created(thread_id: &str, write: &WriteKind, recorded_at: DateTime<Utc>) -> Option<Self> {
        match write {
            WriteKind::SessionCreated {
                property_id,
                participants,
                context,
                created_at,
                first_speaker,
            } => {
                let mut session = Session::new(
                    thread_id,
                    property_id.clone(),
                    participants.clone(),
                    context.clone(),
                    *first_speaker,
                );
                session.created_at = *created_at;
                session.updated_at = recorded_at;
                Some(session)
            }
            _ => None,
        }
    }
}

/// Session state rebuilt from a snapshot plus the writes that followed it.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    pub session: Session,
    /// Highest sequence id folded into `session`.
    pub applied_sequence_id: u64,
    /// Writes replayed on top of the snapshot.
    pub replayed_writes: usize,
}

impl RecoveredState {
    /// Start from a snapshot.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        let mut session = checkpoint.snapshot;
        session.turn_state.last_sequence_id = checkpoint.sequence_id;
        session.turn_state.last_snapshot_sequence_id = Some(checkpoint.sequence_id);
        session.pending_writes.clear();
        session.snapshot_dirty = false;
        Self {
            session,
            applied_sequence_id: checkpoint.sequence_id,
            replayed_writes: 0,
        }
    }

    /// Rebuild from the write log alone; the first write must be
    /// `SessionCreated`.
    pub fn from_writes(writes: &[CheckpointWrite]) -> Option<Self> {
        let first = writes.first()?;
        let session = Session::from_created(&first.thread_id, &first.write, first.recorded_at)?;
        let mut state = Self {
            session,
            applied_sequence_id: first.sequence_id,
            replayed_writes: 1,
        };
        state.session.turn_state.last_sequence_id = first.sequence_id;
        state.apply_all(&writes[1..]);
        Some(state)
    }

    /// Snapshot (if any) plus later writes.
    pub fn replay(base: Option<Checkpoint>, writes: &[CheckpointWrite]) -> Option<Self> {
        match base {
            Some(checkpoint) => {
                let mut state = Self::from_checkpoint(checkpoint);
                state.apply_all(writes);
                Some(state)
            }
            None => Self::from_writes(writes),
        }
    }

    /// Fold one write in. Already applied sequence ids are skipped, which
    /// makes replaying the same log twice a no-op.
    pub fn apply(&mut self, write: &CheckpointWrite) -> bool {
        if write.sequence_id <= self.applied_sequence_id {
            return false;
        }
        self.session.apply_write(&write.write, write.recorded_at);
        self.session.turn_state.last_sequence_id = write.sequence_id;
        self.applied_sequence_id = write.sequence_id;
        self.replayed_writes += 1;
        true
    }

    /// Fold a slice of writes in; returns how many were new.
    pub fn apply_all(&mut self, writes: &[CheckpointWrite]) -> usize {
        writes.iter().filter(|w| self.apply(w)).count()
    }
}

/// Load the latest snapshot for `thread_id` and replay the writes after it.
pub async fn recover(
    store: &dyn CheckpointStore,
    thread_id: &str,
) -> NegotiationResult<Option<RecoveredState>> {
    let base = store.latest_snapshot(thread_id).await.map_err(storage_err)?;
    let after = base.as_ref().map(|c| c.sequence_id).unwrap_or(0);
    let writes = store
        .writes_after(thread_id, after)
        .await
        .map_err(storage_err)?;
    Ok(RecoveredState::replay(base, &writes))
}

fn storage_err(err: StoreError) -> NegotiationError {
    NegotiationError::Storage(err.to_string())
}

// ── Checkpointer ─────────────────────────────────────────────────────────

/// Stages session mutations as writes and makes them durable, with retries.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    window: usize,
    retries: u32,
    backoff: Duration,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, config: &NegotiationConfig) -> Self {
        Self {
            store,
            window: config.checkpoint_window,
            retries: config.checkpoint_retries.max(1),
            backoff: config.retry_backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Stage the creation record of a freshly built session.
    pub fn record_created(&self, session: &mut Session) -> u64 {
        let write = WriteKind::SessionCreated {
            property_id: session.property_id.clone(),
            participants: session.participants.clone(),
            context: session.context.clone(),
            created_at: session.created_at,
            first_speaker: session.turn_state.next_role,
        };
        self.stage(session, write, session.created_at)
    }

    /// Apply `write` to the session and stage it with the next sequence id.
    pub fn record(&self, session: &mut Session, write: WriteKind) -> u64 {
        let recorded_at = Utc::now();
        session.apply_write(&write, recorded_at);
        self.stage(session, write, recorded_at)
    }

    fn stage(&self, session: &mut Session, write: WriteKind, recorded_at: DateTime<Utc>) -> u64 {
        let sequence_id = session.turn_state.last_sequence_id + 1;
        session.turn_state.last_sequence_id = sequence_id;
        session.pending_writes.push_back(CheckpointWrite {
            thread_id: session.session_id.clone(),
            sequence_id,
            recorded_at,
            write,
        });
        sequence_id
    }

    /// Make every staged write durable, in order, then store a snapshot.
    ///
    /// A write that still fails after the retry bound stays staged and the
    /// error is returned; the next flush resumes from it. Snapshot failures
    /// are logged and retried on the next flush, since the write log alone
    /// is enough to recover.
    pub async fn flush(&self, session: &mut Session) -> NegotiationResult<Vec<u64>> {
        let mut flushed = Vec::new();
        while let Some(write) = session.pending_writes.front().cloned() {
            let sequence_id = write.sequence_id;
            let store = self.store.clone();
            let applied = self
                .with_retries("append write", &session.session_id, || {
                    let store = store.clone();
                    let write = write.clone();
                    async move { store.append_write(write).await }
                })
                .await?;
            if !applied {
                log::debug!(
                    "Checkpoint write {} for session {} was already applied",
                    sequence_id,
                    session.session_id
                );
            }
            session.pending_writes.pop_front();
            flushed.push(sequence_id);
        }

        if flushed.is_empty() && !session.snapshot_dirty {
            return Ok(flushed);
        }

        let checkpoint = self.snapshot_of(session);
        let sequence_id = checkpoint.sequence_id;
        let store = self.store.clone();
        let outcome = self
            .with_retries("write snapshot", &session.session_id, || {
                let store = store.clone();
                let checkpoint = checkpoint.clone();
                async move { store.write_snapshot(checkpoint).await }
            })
            .await;
        match outcome {
            Ok(_) => {
                session.turn_state.last_snapshot_sequence_id = Some(sequence_id);
                session.snapshot_dirty = false;
            }
            Err(e) => {
                log::warn!(
                    "Snapshot {} for session {} deferred: {}",
                    sequence_id,
                    session.session_id,
                    e
                );
                session.snapshot_dirty = true;
            }
        }
        Ok(flushed)
    }

    /// Snapshot of the session with only the trailing message window.
    pub fn snapshot_of(&self, session: &mut Session) -> Checkpoint {
        let history = std::mem::take(&mut session.history);
        let mut snapshot = session.clone();
        snapshot.pending_writes.clear();
        snapshot.snapshot_dirty = false;
        let start = history.len().saturating_sub(self.window);
        snapshot.history = history[start..].to_vec();
        session.history = history;

        Checkpoint {
            thread_id: session.session_id.clone(),
            sequence_id: session.turn_state.last_sequence_id,
            parent_sequence_id: session.turn_state.last_snapshot_sequence_id,
            created_at: Utc::now(),
            snapshot,
        }
    }

    async fn with_retries<T, F, Fut>(
        &self,
        what: &str,
        session_id: &str,
        mut op: F,
    ) -> NegotiationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            if attempt > 1 {
                let delay = self.backoff.saturating_mul(1u32 << (attempt - 2).min(16));
                tokio::time::sleep(delay).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!(
                        "Checkpoint {} for session {} failed (attempt {}/{}): {}",
                        what,
                        session_id,
                        attempt,
                        self.retries,
                        last_error
                    );
                }
            }
        }
        Err(NegotiationError::Storage(format!(
            "{} for session {} failed after {} attempts: {}",
            what, session_id, self.retries, last_error
        )))
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

#[derive(Default)]
struct ThreadLog {
    writes: Vec<CheckpointWrite>,
    snapshots: Vec<Checkpoint>,
}

impl ThreadLog {
    fn last_write_sequence(&self) -> u64 {
        self.writes.last().map(|w| w.sequence_id).unwrap_or(0)
    }
}

/// Snapshots must extend the linear chain: `Ok(false)` for a stale or
/// repeated sequence id, an error for a parent that is not the latest.
fn check_snapshot(latest: Option<u64>, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
    if let Some(latest) = latest {
        if checkpoint.sequence_id <= latest {
            return Ok(false);
        }
    }
    if checkpoint.parent_sequence_id != latest {
        return Err(format!(
            "snapshot {} of thread {} names parent {:?} but latest is {:?}",
            checkpoint.sequence_id, checkpoint.thread_id, checkpoint.parent_sequence_id, latest
        )
        .into());
    }
    Ok(true)
}

/// Process-local store. Each thread has its own lock, so sessions never
/// contend with one another.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: Mutex<HashMap<String, Arc<Mutex<ThreadLog>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn thread(&self, thread_id: &str) -> Result<Arc<Mutex<ThreadLog>>, StoreError> {
        let mut threads = self.threads.lock().map_err(|_| "checkpoint map poisoned")?;
        Ok(threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ThreadLog::default())))
            .clone())
    }

    fn existing(&self, thread_id: &str) -> Result<Option<Arc<Mutex<ThreadLog>>>, StoreError> {
        let threads = self.threads.lock().map_err(|_| "checkpoint map poisoned")?;
        Ok(threads.get(thread_id).cloned())
    }

    /// Full write log of a thread; used by tests and audit tooling.
    pub fn writes(&self, thread_id: &str) -> Vec<CheckpointWrite> {
        self.existing(thread_id)
            .ok()
            .flatten()
            .and_then(|t| t.lock().ok().map(|log| log.writes.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append_write(&self, write: CheckpointWrite) -> Result<bool, StoreError> {
        let thread = self.thread(&write.thread_id)?;
        let mut log = thread.lock().map_err(|_| "thread log poisoned")?;
        if write.sequence_id <= log.last_write_sequence() {
            return Ok(false);
        }
        log.writes.push(write);
        Ok(true)
    }

    async fn write_snapshot(&self, checkpoint: Checkpoint) -> Result<bool, StoreError> {
        let thread = self.thread(&checkpoint.thread_id)?;
        let mut log = thread.lock().map_err(|_| "thread log poisoned")?;
        let latest = log.snapshots.last().map(|c| c.sequence_id);
        if !check_snapshot(latest, &checkpoint)? {
            return Ok(false);
        }
        log.snapshots.push(checkpoint);
        Ok(true)
    }

    async fn latest_snapshot(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        match self.existing(thread_id)? {
            Some(thread) => {
                let log = thread.lock().map_err(|_| "thread log poisoned")?;
                Ok(log.snapshots.last().cloned())
            }
            None => Ok(None),
        }
    }

    async fn writes_after(
        &self,
        thread_id: &str,
        after: u64,
    ) -> Result<Vec<CheckpointWrite>, StoreError> {
        match self.existing(thread_id)? {
            Some(thread) => {
                let log = thread.lock().map_err(|_| "thread log poisoned")?;
                Ok(log
                    .writes
                    .iter()
                    .filter(|w| w.sequence_id > after)
                    .cloned()
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn snapshot_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        match self.existing(thread_id)? {
            Some(thread) => {
                let log = thread.lock().map_err(|_| "thread log poisoned")?;
                Ok(log.snapshots.clone())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let threads = self.threads.lock().map_err(|_| "checkpoint map poisoned")?;
        let mut ids: Vec<String> = threads
            .iter()
            .filter(|(_, t)| t.lock().map(|log| !log.writes.is_empty()).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ── JSONL backend ────────────────────────────────────────────────────────

/// One line of a `.jsonl` ledger: the record plus its hash-chain links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry<T> {
    pub index: u64,
    pub prev_hash: String,
    pub hash: String,
    pub record: T,
}

struct Ledger<T> {
    path: PathBuf,
    entries: Vec<LedgerEntry<T>>,
}

impl<T: Serialize + DeserializeOwned> Ledger<T> {
    fn open(path: PathBuf) -> io::Result<Self> {
        let mut entries = Vec::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LedgerEntry<T> = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Failed to parse ledger entry in {}: {}", path.display(), e),
                    )
                })?;
                entries.push(entry);
            }
        }
        Ok(Self { path, entries })
    }

    fn append(&mut self, record: T) -> io::Result<()> {
        let index = self.entries.len() as u64;
        let prev_hash = self
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_default();
        let hash = ledger_hash(index, &prev_hash, &record)?;
        let entry = LedgerEntry {
            index,
            prev_hash,
            hash,
            record,
        };

        let json = serde_json::to_string(&entry)
            .map_err(|e| io::Error::other(format!("Failed to serialize ledger entry: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)?;
        file.sync_data()?;

        self.entries.push(entry);
        Ok(())
    }

    fn verify(&self) -> bool {
        let mut prev_hash = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.index != i as u64 || entry.prev_hash != prev_hash {
                return false;
            }
            match ledger_hash(entry.index, &entry.prev_hash, &entry.record) {
                Ok(expected) if expected == entry.hash => {}
                _ => return false,
            }
            prev_hash = entry.hash.clone();
        }
        true
    }
}

fn ledger_hash<T: Serialize>(index: u64, prev_hash: &str, record: &T) -> io::Result<String> {
    let body = serde_json::to_string(record)
        .map_err(|e| io::Error::other(format!("Failed to serialize record: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", index, prev_hash, body).as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

struct ThreadLedgers {
    writes: Ledger<CheckpointWrite>,
    snapshots: Ledger<Checkpoint>,
}

/// Durable store: two append-only, hash-chained `.jsonl` ledgers per thread.
///
/// ```text
/// <dir>/s-42-1f2e3d4c5b6a7988.writes.jsonl
/// <dir>/s-42-1f2e3d4c5b6a7988.snapshots.jsonl
/// ```
///
/// Ledgers are loaded lazily on first access and cached; each thread has its
/// own lock.
pub struct JsonlCheckpointStore {
    dir: PathBuf,
    threads: Mutex<HashMap<String, Arc<Mutex<ThreadLedgers>>>>,
}

impl JsonlCheckpointStore {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            threads: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn thread(&self, thread_id: &str) -> Result<Arc<Mutex<ThreadLedgers>>, StoreError> {
        let mut threads = self.threads.lock().map_err(|_| "ledger map poisoned")?;
        if let Some(thread) = threads.get(thread_id) {
            return Ok(thread.clone());
        }
        let ledgers = ThreadLedgers {
            writes: Ledger::open(self.dir.join(ledger_filename(thread_id, "writes")))?,
            snapshots: Ledger::open(self.dir.join(ledger_filename(thread_id, "snapshots")))?,
        };
        let thread = Arc::new(Mutex::new(ledgers));
        threads.insert(thread_id.to_string(), thread.clone());
        Ok(thread)
    }

    /// Check both hash chains of a thread.
    pub fn verify_integrity(&self, thread_id: &str) -> NegotiationResult<bool> {
        let thread = self.thread(thread_id).map_err(storage_err)?;
        let ledgers = thread
            .lock()
            .map_err(|_| NegotiationError::Storage("thread ledger poisoned".into()))?;
        Ok(ledgers.writes.verify() && ledgers.snapshots.verify())
    }
}

#[async_trait]
impl CheckpointStore for JsonlCheckpointStore {
    async fn append_write(&self, write: CheckpointWrite) -> Result<bool, StoreError> {
        let thread = self.thread(&write.thread_id)?;
        let mut ledgers = thread.lock().map_err(|_| "thread ledger poisoned")?;
        let last = ledgers
            .writes
            .entries
            .last()
            .map(|e| e.record.sequence_id)
            .unwrap_or(0);
        if write.sequence_id <= last {
            return Ok(false);
        }
        ledgers.writes.append(write)?;
        Ok(true)
    }

    async fn write_snapshot(&self, checkpoint: Checkpoint) -> Result<bool, StoreError> {
        let thread = self.thread(&checkpoint.thread_id)?;
        let mut ledgers = thread.lock().map_err(|_| "thread ledger poisoned")?;
        let latest = ledgers.snapshots.entries.last().map(|e| e.record.sequence_id);
        if !check_snapshot(latest, &checkpoint)? {
            return Ok(false);
        }
        ledgers.snapshots.append(checkpoint)?;
        Ok(true)
    }

    async fn latest_snapshot(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let thread = self.thread(thread_id)?;
        let ledgers = thread.lock().map_err(|_| "thread ledger poisoned")?;
        Ok(ledgers.snapshots.entries.last().map(|e| e.record.clone()))
    }

    async fn writes_after(
        &self,
        thread_id: &str,
        after: u64,
    ) -> Result<Vec<CheckpointWrite>, StoreError> {
        let thread = self.thread(thread_id)?;
        let ledgers = thread.lock().map_err(|_| "thread ledger poisoned")?;
        Ok(ledgers
            .writes
            .entries
            .iter()
            .filter(|e| e.record.sequence_id > after)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn snapshot_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let thread = self.thread(thread_id)?;
        let ledgers = thread.lock().map_err(|_| "thread ledger poisoned")?;
        Ok(ledgers
            .snapshots
            .entries
            .iter()
            .map(|e| e.record.clone())
            .collect())
    }

    async fn thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_write_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".writes.jsonl"))
                .unwrap_or(false);
            if !is_write_log {
                continue;
            }
            let ledger: Ledger<CheckpointWrite> = Ledger::open(path)?;
            if let Some(first) = ledger.entries.first() {
                ids.push(first.record.thread_id.clone());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// `<sanitized id>-<16 hex of sha256(id)>.<kind>.jsonl`.
pub fn ledger_filename(thread_id: &str, kind: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(thread_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let fingerprint = &digest[..16];

    let safe_id: String = thread_id
        .chars()
        .take(48)
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{}-{}.{}.jsonl", safe_id, fingerprint, kind)
}
