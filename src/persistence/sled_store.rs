//! Durable backing store on `sled`.
//!
//! Everything lives in the default tree under three key families:
//! - `d\0{dictionary}\0{key}` holds a dictionary value
//! - `m\0{queue}` holds a queue's kind
//! - `q\0{queue}\0{seq}` holds a queue item, `seq` big-endian so a prefix scan
//!   yields items in enqueue order
//!
//! One commit is one `sled::Batch`, which sled applies atomically.

use std::collections::VecDeque;
use std::path::Path;

use sled::{Batch, Db};
use tracing::debug;

use super::state::{QueueItem, QueueKind, QueueState, Snapshot};
use super::{StoreError, StoreResult};

const DICTIONARY_PREFIX: u8 = b'd';
const QUEUE_META_PREFIX: u8 = b'm';
const QUEUE_ITEM_PREFIX: u8 = b'q';
const SEPARATOR: u8 = 0;

/// A single durable mutation produced by a commit.
#[derive(Debug, Clone)]
pub(crate) enum DurableOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A throwaway database removed when dropped.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub(crate) fn apply(&self, ops: &[DurableOp]) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::default();
        for op in ops {
            match op {
                DurableOp::Insert { key, value } => batch.insert(key.as_slice(), value.as_slice()),
                DurableOp::Remove { key } => batch.remove(key.as_slice()),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub(crate) async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Rebuild the in-memory view from disk.
    pub(crate) fn load(&self) -> StoreResult<Snapshot> {
        let mut snapshot = Snapshot::default();

        for entry in self.db.iter() {
            let (key, value) = entry?;
            let Some((&family, rest)) = key.split_first() else {
                continue;
            };
            let Some(rest) = rest.strip_prefix(&[SEPARATOR]) else {
                return Err(corrupt(&key));
            };

            match family {
                DICTIONARY_PREFIX => {
                    let (dictionary, entry_key) = split_pair(rest).ok_or_else(|| corrupt(&key))?;
                    snapshot
                        .dictionaries
                        .entry(dictionary)
                        .or_default()
                        .insert(entry_key, value.to_vec());
                }
                QUEUE_META_PREFIX => {
                    let name = String::from_utf8(rest.to_vec()).map_err(|_| corrupt(&key))?;
                    let kind: QueueKind = serde_json::from_slice(&value)?;
                    snapshot
                        .queues
                        .entry(name)
                        .and_modify(|queue| queue.kind = kind)
                        .or_insert_with(|| QueueState::new(kind));
                }
                QUEUE_ITEM_PREFIX => {
                    if rest.len() < 9 {
                        return Err(corrupt(&key));
                    }
                    let (name_bytes, seq_bytes) = rest.split_at(rest.len() - 9);
                    let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| corrupt(&key))?;
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&seq_bytes[1..]);
                    let seq = u64::from_be_bytes(seq);

                    // Meta keys sort before item keys, so a missing queue here
                    // means the queue was dropped while the item was in flight.
                    let Some(queue) = snapshot.queues.get_mut(&name) else {
                        debug!(queue = %name, seq, "skipping item of dropped queue");
                        continue;
                    };
                    queue.items.push_back(QueueItem {
                        seq,
                        bytes: value.to_vec(),
                    });
                    queue.next_seq = queue.next_seq.max(seq + 1);
                }
                _ => return Err(corrupt(&key)),
            }
        }

        for queue in snapshot.queues.values_mut() {
            sort_items(&mut queue.items);
        }

        debug!(
            dictionaries = snapshot.dictionaries.len(),
            queues = snapshot.queues.len(),
            "loaded durable state"
        );
        Ok(snapshot)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .finish()
    }
}

pub(crate) fn dictionary_key(dictionary: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(dictionary.len() + key.len() + 3);
    out.extend_from_slice(&[DICTIONARY_PREFIX, SEPARATOR]);
    out.extend_from_slice(dictionary.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(key.as_bytes());
    out
}

pub(crate) fn queue_meta_key(queue: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(queue.len() + 2);
    out.extend_from_slice(&[QUEUE_META_PREFIX, SEPARATOR]);
    out.extend_from_slice(queue.as_bytes());
    out
}

pub(crate) fn queue_item_key(queue: &str, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(queue.len() + 11);
    out.extend_from_slice(&[QUEUE_ITEM_PREFIX, SEPARATOR]);
    out.extend_from_slice(queue.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

fn split_pair(bytes: &[u8]) -> Option<(String, String)> {
    let split = bytes.iter().position(|b| *b == SEPARATOR)?;
    let first = String::from_utf8(bytes[..split].to_vec()).ok()?;
    let second = String::from_utf8(bytes[split + 1..].to_vec()).ok()?;
    Some((first, second))
}

fn sort_items(items: &mut VecDeque<QueueItem>) {
    items.make_contiguous().sort_by_key(|item| item.seq);
}

fn corrupt(key: &[u8]) -> StoreError {
    StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
    }
}
