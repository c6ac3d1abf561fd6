// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, append-only per-group log storage.
//!
//! # Reservations
//!
//! ```text
//!   put_log ──> [ unreserved ] ──get_logs──> [ reserved(id) ] ──delete_logs──> gone
//!                     ^                             │
//!                     └──────release_logs/restart───┘
//! ```
//!
//! A log under an outstanding reservation is never returned again until the
//! reservation is released. Reservations live in memory only, so logs that
//! were reserved but never deleted become visible again after a restart. This
//! gives at-least-once delivery; the backend must tolerate duplicates.
//!
//! # Implementations
//!
//! - [`file::FilePersistence`]: one directory per group, one fsync'ed file per log
//! - [`memory::MemoryPersistence`]: volatile, for tests and ephemeral hosts

pub mod file;
pub mod memory;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::log::Log;

/// Lease on a set of logs handed out by [`Persistence::get_logs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log store owned exclusively by the channel service.
#[async_trait]
pub trait Persistence: Send + Sync + Debug {
    /// Appends a log to a group. The log is durable once this returns.
    /// Returns the insertion sequence number.
    async fn put_log(&mut self, group: &str, log: &Log) -> Result<u64, PersistenceError>;

    /// Reserves up to `limit` of the oldest unreserved logs of `group` whose
    /// target key is not in `excluded_target_keys`, appending them to `out`
    /// in insertion order. Returns `None` when nothing is available.
    async fn get_logs(
        &mut self,
        group: &str,
        excluded_target_keys: &HashSet<String>,
        limit: usize,
        out: &mut Vec<Log>,
    ) -> Result<Option<ReservationId>, PersistenceError>;

    /// Permanently removes the logs of a reservation.
    async fn delete_logs(
        &mut self,
        group: &str,
        reservation: &ReservationId,
    ) -> Result<(), PersistenceError>;

    /// Makes the logs of a reservation available again without deleting them.
    fn release_logs(&mut self, group: &str, reservation: &ReservationId);

    /// Removes every log of a group and its reservations. Returns the number of
    /// deleted logs.
    async fn clear_group(&mut self, group: &str) -> Result<usize, PersistenceError>;

    /// Removes every log of every group.
    async fn clear_all(&mut self) -> Result<usize, PersistenceError>;

    /// Releases every outstanding reservation.
    fn clear_pending_state(&mut self);

    /// Number of unreserved logs stored for a group.
    async fn count_logs(&mut self, group: &str) -> Result<usize, PersistenceError>;

    /// Groups that lost logs to eviction since the previous call.
    fn take_evicted_groups(&mut self) -> HashSet<String> {
        HashSet::new()
    }

    /// Bounds the store. Oldest unreserved logs are evicted to honor the limit.
    async fn set_max_storage_size(&mut self, max_bytes: u64) -> Result<(), PersistenceError>;

    /// Best-effort flush of any buffered state to durable storage.
    async fn sync(&mut self) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordMeta {
    pub size: u64,
    pub target_key: Option<String>,
}

/// Ordering, reservation and size bookkeeping shared by the implementations.
#[derive(Debug, Default)]
pub(crate) struct StoreIndex {
    groups: HashMap<String, BTreeMap<u64, RecordMeta>>,
    reserved: HashSet<u64>,
    reservations: HashMap<ReservationId, (String, Vec<u64>)>,
    total_bytes: u64,
    next_seq: u64,
}

impl StoreIndex {
    pub fn next_sequence(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Registers a record. Sequences loaded from disk also advance the counter.
    pub fn insert(&mut self, group: &str, seq: u64, meta: RecordMeta) {
        self.next_seq = self.next_seq.max(seq);
        self.total_bytes += meta.size;
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(seq, meta);
    }

    pub fn remove(&mut self, group: &str, seq: u64) -> Option<RecordMeta> {
        let records = self.groups.get_mut(group)?;
        let meta = records.remove(&seq)?;
        if records.is_empty() {
            self.groups.remove(group);
        }
        self.reserved.remove(&seq);
        self.total_bytes = self.total_bytes.saturating_sub(meta.size);
        Some(meta)
    }

    /// Oldest unreserved sequences of a group, skipping excluded target keys.
    pub fn candidates(
        &self,
        group: &str,
        excluded_target_keys: &HashSet<String>,
        limit: usize,
    ) -> Vec<u64> {
        let Some(records) = self.groups.get(group) else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|(seq, _)| !self.reserved.contains(seq))
            .filter(|(_, meta)| {
                meta.target_key
                    .as_ref()
                    .map_or(true, |key| !excluded_target_keys.contains(key))
            })
            .take(limit)
            .map(|(seq, _)| *seq)
            .collect()
    }

    pub fn reserve(&mut self, group: &str, seqs: Vec<u64>) -> Option<ReservationId> {
        if seqs.is_empty() {
            return None;
        }
        self.reserved.extend(seqs.iter().copied());
        let id = ReservationId::new();
        self.reservations.insert(id, (group.to_string(), seqs));
        Some(id)
    }

    /// Ends a reservation and returns its sequences. The records stay stored.
    pub fn take_reservation(&mut self, group: &str, id: &ReservationId) -> Option<Vec<u64>> {
        match self.reservations.get(id) {
            Some((owner, _)) if owner == group => {}
            _ => return None,
        }
        let (_, seqs) = self.reservations.remove(id)?;
        for seq in &seqs {
            self.reserved.remove(seq);
        }
        Some(seqs)
    }

    /// Forgets a whole group and returns the sequences it held.
    pub fn remove_group(&mut self, group: &str) -> Vec<u64> {
        self.reservations.retain(|_, (owner, _)| owner != group);
        let Some(records) = self.groups.remove(group) else {
            return Vec::new();
        };
        let mut seqs = Vec::with_capacity(records.len());
        for (seq, meta) in records {
            self.reserved.remove(&seq);
            self.total_bytes = self.total_bytes.saturating_sub(meta.size);
            seqs.push(seq);
        }
        seqs
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn release_all(&mut self) {
        self.reservations.clear();
        self.reserved.clear();
    }

    pub fn count_unreserved(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |records| {
            records
                .keys()
                .filter(|seq| !self.reserved.contains(seq))
                .count()
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_reserved(&self, seq: u64) -> bool {
        self.reserved.contains(&seq)
    }
}

/// Records to evict so that `incoming` more bytes fit under `max_bytes`.
pub(crate) fn plan_eviction(
    index: &StoreIndex,
    incoming: u64,
    max_bytes: u64,
) -> Result<Vec<(String, u64)>, PersistenceError> {
    if incoming > max_bytes {
        return Err(PersistenceError::TooLarge {
            size: incoming,
            max: max_bytes,
        });
    }
    let mut victims = Vec::new();
    let mut projected = index.total_bytes() + incoming;
    if projected <= max_bytes {
        return Ok(victims);
    }
    // Walk the unreserved records oldest first across every group.
    let mut ordered: Vec<(u64, String, u64)> = index
        .groups
        .iter()
        .flat_map(|(group, records)| {
            records
                .iter()
                .filter(|(seq, _)| !index.is_reserved(**seq))
                .map(move |(seq, meta)| (*seq, group.clone(), meta.size))
        })
        .collect();
    ordered.sort_unstable_by_key(|(seq, _, _)| *seq);
    for (seq, group, size) in ordered {
        if projected <= max_bytes {
            break;
        }
        projected = projected.saturating_sub(size);
        victims.push((group, seq));
    }
    if projected > max_bytes {
        return Err(PersistenceError::Full);
    }
    Ok(victims)
}
