//! Transactional state manager
//!
//! Reads of dictionaries are snapshot reads of committed state overlaid with
//! the transaction's own pending writes. Writes and queue operations are
//! buffered in the transaction and applied in order on commit.
//!
//! Isolation comes from exclusive async locks keyed by dictionary entry or by
//! queue name. A transaction keeps every lock it took until it commits, aborts
//! or is dropped. Waiting for a lock is bounded by the configured lock timeout.
//!
//! Lock order inside this module is always transaction state first, committed
//! state second. Neither std mutex is ever held across an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sled_store::{self, DurableOp, SledStore};
use super::{StoreError, StoreResult};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    /// Strict FIFO; dequeue holds the queue exclusively until commit.
    Fifo,
    /// No ordering; concurrent transactions dequeue different items.
    Concurrent,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueItem {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub kind: QueueKind,
    pub items: VecDeque<QueueItem>,
    pub next_seq: u64,
}

impl QueueState {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            items: VecDeque::new(),
            next_seq: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub dictionaries: HashMap<String, BTreeMap<String, Vec<u8>>>,
    pub queues: HashMap<String, QueueState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Entry { dictionary: String, key: String },
    Queue(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Entry { dictionary, key } => write!(f, "{dictionary}/{key}"),
            LockKey::Queue(name) => write!(f, "queue {name}"),
        }
    }
}

struct StoreInner {
    committed: Mutex<Snapshot>,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    durable: Option<SledStore>,
    lock_timeout: Duration,
    next_transaction_id: AtomicU64,
}

impl StoreInner {
    fn committed(&self) -> MutexGuard<'_, Snapshot> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

/// Owner of all dictionaries and queues of one broker partition.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<StoreInner>,
}

impl StateManager {
    /// Volatile state; everything is lost when the last handle is dropped.
    pub fn in_memory(lock_timeout: Duration) -> Self {
        Self::from_parts(Snapshot::default(), None, lock_timeout)
    }

    /// Open (or create) durable state at `path`, reloading what was committed.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> StoreResult<Self> {
        Self::with_store(SledStore::open(path)?, lock_timeout)
    }

    pub fn with_store(store: SledStore, lock_timeout: Duration) -> StoreResult<Self> {
        let snapshot = store.load()?;
        Ok(Self::from_parts(snapshot, Some(store), lock_timeout))
    }

    pub fn from_settings(settings: &crate::config::StorageSettings) -> StoreResult<Self> {
        let lock_timeout = settings.lock_timeout();
        match &settings.path {
            Some(path) => Self::open(path, lock_timeout),
            None => Ok(Self::in_memory(lock_timeout)),
        }
    }

    fn from_parts(snapshot: Snapshot, durable: Option<SledStore>, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                committed: Mutex::new(snapshot),
                locks: Mutex::new(HashMap::new()),
                durable,
                lock_timeout,
                next_transaction_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.durable.is_some()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    pub fn begin(&self) -> Transaction {
        let id = self.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        Transaction {
            inner: Arc::new(TxInner {
                id,
                store: Arc::clone(&self.inner),
                state: Mutex::new(TxState::default()),
            }),
        }
    }

    /// Get or create the FIFO queue `name`.
    pub fn get_or_add_queue<T>(&self, name: &str) -> StoreResult<ReliableQueue<T>> {
        self.ensure_queue(name, QueueKind::Fifo)?;
        Ok(ReliableQueue {
            name: name.to_string(),
            store: Arc::clone(&self.inner),
            _item: PhantomData,
        })
    }

    /// Get or create the concurrent queue `name`.
    pub fn get_or_add_concurrent_queue<T>(
        &self,
        name: &str,
    ) -> StoreResult<ReliableConcurrentQueue<T>> {
        self.ensure_queue(name, QueueKind::Concurrent)?;
        Ok(ReliableConcurrentQueue {
            name: name.to_string(),
            store: Arc::clone(&self.inner),
            _item: PhantomData,
        })
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.committed().queues.contains_key(name)
    }

    pub fn queue_kind(&self, name: &str) -> Option<QueueKind> {
        self.inner.committed().queues.get(name).map(|queue| queue.kind)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.committed().queues.keys().cloned().collect()
    }

    /// Queue creation is its own atomic step: an empty queue left behind by
    /// an aborted transaction is harmless.
    fn ensure_queue(&self, name: &str, kind: QueueKind) -> StoreResult<()> {
        let mut committed = self.inner.committed();
        if let Some(existing) = committed.queues.get(name) {
            if existing.kind != kind {
                return Err(StoreError::QueueKindMismatch {
                    name: name.to_string(),
                    existing: existing.kind,
                });
            }
            return Ok(());
        }

        if let Some(durable) = &self.inner.durable {
            durable.apply(&[DurableOp::Insert {
                key: sled_store::queue_meta_key(name),
                value: serde_json::to_vec(&kind)?,
            }])?;
        }
        committed.queues.insert(name.to_string(), QueueState::new(kind));
        debug!(queue = name, ?kind, "created queue");
        Ok(())
    }
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("durable", &self.inner.durable.is_some())
            .field("lock_timeout", &self.inner.lock_timeout)
            .finish()
    }
}

#[derive(Debug)]
enum PendingOp {
    Set {
        dictionary: String,
        key: String,
        value: Vec<u8>,
    },
    Remove {
        dictionary: String,
        key: String,
    },
    Enqueue {
        queue: String,
        bytes: Vec<u8>,
    },
    Dequeue {
        queue: String,
        seq: u64,
    },
    DropQueue {
        queue: String,
    },
}

#[derive(Default)]
struct TxState {
    completed: bool,
    ops: Vec<PendingOp>,
    guards: HashMap<LockKey, OwnedMutexGuard<()>>,
    /// Items this transaction has read ahead in each FIFO queue.
    fifo_cursor: HashMap<String, usize>,
    /// Items taken out of concurrent queues, restored on rollback.
    taken: Vec<(String, QueueItem)>,
}

struct TxInner {
    id: u64,
    store: Arc<StoreInner>,
    state: Mutex<TxState>,
}

impl TxInner {
    fn rollback(state: &mut TxState, store: &StoreInner) {
        if state.completed {
            return;
        }
        state.completed = true;
        state.ops.clear();
        state.fifo_cursor.clear();

        if !state.taken.is_empty() {
            let mut committed = store.committed();
            for (queue, item) in state.taken.drain(..).rev() {
                // Restored ahead of newer items; a dropped queue discards them.
                if let Some(target) = committed.queues.get_mut(&queue) {
                    target.items.push_front(item);
                }
            }
        }
        state.guards.clear();
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.completed {
            debug!(transaction = self.id, "rolling back dropped transaction");
        }
        TxInner::rollback(state, &self.store);
    }
}

/// A unit of work against a `StateManager`.
///
/// Cloning yields another handle to the same transaction. The transaction is
/// rolled back when the last handle is dropped without a commit.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_completed(&self) -> bool {
        self.raw_state().completed
    }

    fn raw_state(&self) -> MutexGuard<'_, TxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> StoreResult<MutexGuard<'_, TxState>> {
        let state = self.raw_state();
        if state.completed {
            return Err(StoreError::TransactionClosed { id: self.inner.id });
        }
        Ok(state)
    }

    async fn acquire(&self, key: LockKey, cancel: Option<&CancellationToken>) -> StoreResult<()> {
        if self.open_state()?.guards.contains_key(&key) {
            return Ok(());
        }

        let mutex = self.inner.store.lock_for(&key);
        let wait = tokio::time::timeout(self.inner.store.lock_timeout, mutex.lock_owned());
        let acquired = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(StoreError::Cancelled),
                acquired = wait => acquired,
            },
            None => wait.await,
        };
        let guard = acquired.map_err(|_| StoreError::Timeout {
            resource: key.to_string(),
        })?;

        self.open_state()?.guards.insert(key, guard);
        Ok(())
    }

    /// Snapshot read of `key`, including this transaction's own writes.
    pub fn get<T: DeserializeOwned>(&self, dictionary: &str, key: &str) -> StoreResult<Option<T>> {
        let state = self.open_state()?;
        let pending = state.ops.iter().rev().find_map(|op| match op {
            PendingOp::Set {
                dictionary: d,
                key: k,
                value,
            } if d == dictionary && k == key => Some(Some(value.clone())),
            PendingOp::Remove {
                dictionary: d,
                key: k,
            } if d == dictionary && k == key => Some(None),
            _ => None,
        });
        drop(state);

        let bytes = match pending {
            Some(bytes) => bytes,
            None => self
                .inner
                .store
                .committed()
                .dictionaries
                .get(dictionary)
                .and_then(|entries| entries.get(key))
                .cloned(),
        };
        bytes
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Lock `key` exclusively for the rest of the transaction, then read it.
    pub async fn get_for_update<T: DeserializeOwned>(
        &self,
        dictionary: &str,
        key: &str,
    ) -> StoreResult<Option<T>> {
        self.acquire(entry_lock(dictionary, key), None).await?;
        self.get(dictionary, key)
    }

    pub async fn set<T: Serialize>(&self, dictionary: &str, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_vec(value)?;
        self.acquire(entry_lock(dictionary, key), None).await?;
        self.open_state()?.ops.push(PendingOp::Set {
            dictionary: dictionary.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Remove `key`; returns whether it was present.
    pub async fn remove(&self, dictionary: &str, key: &str) -> StoreResult<bool> {
        self.acquire(entry_lock(dictionary, key), None).await?;
        let existed = self.get::<serde_json::Value>(dictionary, key)?.is_some();
        if existed {
            self.open_state()?.ops.push(PendingOp::Remove {
                dictionary: dictionary.to_string(),
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    /// Keys of `dictionary` as this transaction sees them.
    pub fn keys(&self, dictionary: &str) -> StoreResult<Vec<String>> {
        let state = self.open_state()?;
        let mut keys: HashSet<String> = self
            .inner
            .store
            .committed()
            .dictionaries
            .get(dictionary)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();

        for op in &state.ops {
            match op {
                PendingOp::Set { dictionary: d, key, .. } if d == dictionary => {
                    keys.insert(key.clone());
                }
                PendingOp::Remove { dictionary: d, key } if d == dictionary => {
                    keys.remove(key);
                }
                _ => {}
            }
        }

        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete queue `name` and everything in it when the transaction commits.
    pub async fn drop_queue(&self, name: &str) -> StoreResult<()> {
        self.acquire(LockKey::Queue(name.to_string()), None).await?;
        self.open_state()?.ops.push(PendingOp::DropQueue {
            queue: name.to_string(),
        });
        Ok(())
    }

    fn push_enqueue(&self, queue: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let mut state = self.open_state()?;
        if !self.inner.store.committed().queues.contains_key(queue) {
            return Err(StoreError::QueueNotFound {
                name: queue.to_string(),
            });
        }
        state.ops.push(PendingOp::Enqueue {
            queue: queue.to_string(),
            bytes,
        });
        Ok(())
    }

    fn take_fifo(&self, queue: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.open_state()?;
        let committed = self.inner.store.committed();
        let target = committed.queues.get(queue).ok_or_else(|| StoreError::QueueNotFound {
            name: queue.to_string(),
        })?;

        let cursor = state.fifo_cursor.get(queue).copied().unwrap_or(0);
        let Some(item) = target.items.get(cursor) else {
            return Ok(None);
        };
        let (seq, bytes) = (item.seq, item.bytes.clone());
        drop(committed);

        state.fifo_cursor.insert(queue.to_string(), cursor + 1);
        state.ops.push(PendingOp::Dequeue {
            queue: queue.to_string(),
            seq,
        });
        Ok(Some(bytes))
    }

    fn take_concurrent(&self, queue: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.open_state()?;
        let mut committed = self.inner.store.committed();
        let target = committed
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::QueueNotFound {
                name: queue.to_string(),
            })?;

        let Some(item) = target.items.pop_front() else {
            return Ok(None);
        };
        drop(committed);

        let bytes = item.bytes.clone();
        state.ops.push(PendingOp::Dequeue {
            queue: queue.to_string(),
            seq: item.seq,
        });
        state.taken.push((queue.to_string(), item));
        Ok(Some(bytes))
    }

    /// Apply every buffered operation atomically and release all locks.
    pub async fn commit(&self) -> StoreResult<()> {
        let store = Arc::clone(&self.inner.store);
        {
            let mut state = self.open_state()?;
            let ops = std::mem::take(&mut state.ops);
            let mut committed = store.committed();

            let durable_ops = plan_durable(&ops, &committed);
            if let Some(durable) = &store.durable {
                if let Err(err) = durable.apply(&durable_ops) {
                    drop(committed);
                    TxInner::rollback(&mut state, &store);
                    return Err(err);
                }
            }

            apply_ops(ops, &mut committed, self.inner.id);
            drop(committed);

            state.completed = true;
            state.taken.clear();
            state.fifo_cursor.clear();
            state.guards.clear();
        }

        if let Some(durable) = &store.durable {
            durable.flush().await?;
        }
        Ok(())
    }

    /// Discard buffered operations, restore taken items and release locks.
    pub fn abort(&self) {
        let mut state = self.raw_state();
        TxInner::rollback(&mut state, &self.inner.store);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .finish()
    }
}

fn entry_lock(dictionary: &str, key: &str) -> LockKey {
    LockKey::Entry {
        dictionary: dictionary.to_string(),
        key: key.to_string(),
    }
}

/// Translate buffered ops into durable mutations. Enqueue sequence numbers are
/// assigned here exactly as `apply_ops` will assign them.
fn plan_durable(ops: &[PendingOp], committed: &Snapshot) -> Vec<DurableOp> {
    let mut next_seq: HashMap<&str, u64> = HashMap::new();
    let mut dropped: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(ops.len());

    for op in ops {
        match op {
            PendingOp::Set {
                dictionary,
                key,
                value,
            } => out.push(DurableOp::Insert {
                key: sled_store::dictionary_key(dictionary, key),
                value: value.clone(),
            }),
            PendingOp::Remove { dictionary, key } => out.push(DurableOp::Remove {
                key: sled_store::dictionary_key(dictionary, key),
            }),
            PendingOp::Enqueue { queue, bytes } => {
                let Some(state) = committed.queues.get(queue.as_str()) else {
                    continue;
                };
                if dropped.contains(queue.as_str()) {
                    continue;
                }
                let seq = next_seq.entry(queue.as_str()).or_insert(state.next_seq);
                out.push(DurableOp::Insert {
                    key: sled_store::queue_item_key(queue, *seq),
                    value: bytes.clone(),
                });
                *seq += 1;
            }
            PendingOp::Dequeue { queue, seq } => out.push(DurableOp::Remove {
                key: sled_store::queue_item_key(queue, *seq),
            }),
            PendingOp::DropQueue { queue } => {
                if let Some(state) = committed.queues.get(queue.as_str()) {
                    out.extend(state.items.iter().map(|item| DurableOp::Remove {
                        key: sled_store::queue_item_key(queue, item.seq),
                    }));
                    // Items enqueued earlier in this same transaction.
                    let planned_end = next_seq.get(queue.as_str()).copied().unwrap_or(state.next_seq);
                    out.extend((state.next_seq..planned_end).map(|seq| DurableOp::Remove {
                        key: sled_store::queue_item_key(queue, seq),
                    }));
                }
                out.push(DurableOp::Remove {
                    key: sled_store::queue_meta_key(queue),
                });
                dropped.insert(queue.as_str());
            }
        }
    }
    out
}

fn apply_ops(ops: Vec<PendingOp>, committed: &mut Snapshot, transaction: u64) {
    for op in ops {
        match op {
            PendingOp::Set {
                dictionary,
                key,
                value,
            } => {
                committed
                    .dictionaries
                    .entry(dictionary)
                    .or_default()
                    .insert(key, value);
            }
            PendingOp::Remove { dictionary, key } => {
                if let Some(entries) = committed.dictionaries.get_mut(&dictionary) {
                    entries.remove(&key);
                }
            }
            PendingOp::Enqueue { queue, bytes } => match committed.queues.get_mut(&queue) {
                Some(target) => {
                    let seq = target.next_seq;
                    target.next_seq += 1;
                    target.items.push_back(QueueItem { seq, bytes });
                }
                None => warn!(transaction, queue = %queue, "enqueue skipped, queue was removed"),
            },
            PendingOp::Dequeue { queue, seq } => {
                if let Some(target) = committed.queues.get_mut(&queue) {
                    // Concurrent dequeues already left the queue when taken.
                    if let Some(position) = target.items.iter().position(|item| item.seq == seq) {
                        target.items.remove(position);
                    }
                }
            }
            PendingOp::DropQueue { queue } => {
                committed.queues.remove(&queue);
            }
        }
    }
}

/// Strict FIFO queue of `T`.
pub struct ReliableQueue<T> {
    name: String,
    store: Arc<StoreInner>,
    _item: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ReliableQueue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, tx: &Transaction, item: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(item)?;
        tx.acquire(LockKey::Queue(self.name.clone()), None).await?;
        tx.push_enqueue(&self.name, bytes)
    }

    /// Next item in order. It leaves the queue only if `tx` commits.
    pub async fn dequeue(&self, tx: &Transaction, cancel: &CancellationToken) -> StoreResult<Option<T>> {
        tx.acquire(LockKey::Queue(self.name.clone()), Some(cancel)).await?;
        tx.take_fifo(&self.name)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Committed depth of the queue.
    pub fn count(&self) -> StoreResult<usize> {
        queue_count(&self.store, &self.name)
    }
}

impl<T> fmt::Debug for ReliableQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableQueue").field("name", &self.name).finish()
    }
}

/// Unordered queue of `T` that tolerates concurrent producers and consumers.
pub struct ReliableConcurrentQueue<T> {
    name: String,
    store: Arc<StoreInner>,
    _item: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ReliableConcurrentQueue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, tx: &Transaction, item: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(item)?;
        tx.push_enqueue(&self.name, bytes)
    }

    /// Take any available item; it is put back if `tx` does not commit.
    pub async fn dequeue(&self, tx: &Transaction, cancel: &CancellationToken) -> StoreResult<Option<T>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        tx.take_concurrent(&self.name)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Items currently available, excluding those held by open transactions.
    pub fn count(&self) -> StoreResult<usize> {
        queue_count(&self.store, &self.name)
    }
}

impl<T> fmt::Debug for ReliableConcurrentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableConcurrentQueue")
            .field("name", &self.name)
            .finish()
    }
}

fn queue_count(store: &StoreInner, name: &str) -> StoreResult<usize> {
    store
        .committed()
        .queues
        .get(name)
        .map(|queue| queue.items.len())
        .ok_or_else(|| StoreError::QueueNotFound {
            name: name.to_string(),
        })
}
