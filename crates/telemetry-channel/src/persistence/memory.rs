// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{plan_eviction, Persistence, RecordMeta, ReservationId, StoreIndex};
use crate::constants::DEFAULT_MAX_STORAGE_BYTES;
use crate::error::PersistenceError;
use crate::log::Log;
use crate::serializer::{JsonLogSerializer, LogSerializer};

/// Volatile store. Same reservation semantics as the file store, nothing survives
/// the process.
#[derive(Debug)]
pub struct MemoryPersistence {
    index: StoreIndex,
    payloads: HashMap<u64, Vec<u8>>,
    serializer: Arc<dyn LogSerializer>,
    max_bytes: u64,
    evicted: HashSet<String>,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new(serializer: Arc<dyn LogSerializer>) -> Self {
        Self {
            index: StoreIndex::default(),
            payloads: HashMap::new(),
            serializer,
            max_bytes: DEFAULT_MAX_STORAGE_BYTES,
            evicted: HashSet::new(),
        }
    }

    fn evict(&mut self, victims: Vec<(String, u64)>) {
        for (group, seq) in victims {
            warn!("PERSISTENCE | Store full, evicting log {seq} of group {group}");
            self.index.remove(&group, seq);
            self.payloads.remove(&seq);
            self.evicted.insert(group);
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new(Arc::new(JsonLogSerializer))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn put_log(&mut self, group: &str, log: &Log) -> Result<u64, PersistenceError> {
        let payload = self.serializer.serialize(log)?;
        let size = payload.len() as u64;
        let victims = plan_eviction(&self.index, size, self.max_bytes)?;
        self.evict(victims);

        let seq = self.index.next_sequence();
        self.index.insert(
            group,
            seq,
            RecordMeta {
                size,
                target_key: log.target_key().map(str::to_string),
            },
        );
        self.payloads.insert(seq, payload);
        Ok(seq)
    }

    async fn get_logs(
        &mut self,
        group: &str,
        excluded_target_keys: &HashSet<String>,
        limit: usize,
        out: &mut Vec<Log>,
    ) -> Result<Option<ReservationId>, PersistenceError> {
        let mut reserved = Vec::new();
        for seq in self.index.candidates(group, excluded_target_keys, limit) {
            let Some(payload) = self.payloads.get(&seq) else {
                continue;
            };
            match self.serializer.deserialize(payload) {
                Ok(log) => {
                    out.push(log);
                    reserved.push(seq);
                }
                Err(e) => {
                    warn!("PERSISTENCE | Dropping unreadable log {seq}: {e}");
                    self.index.remove(group, seq);
                    self.payloads.remove(&seq);
                }
            }
        }
        Ok(self.index.reserve(group, reserved))
    }

    async fn delete_logs(
        &mut self,
        group: &str,
        reservation: &ReservationId,
    ) -> Result<(), PersistenceError> {
        let Some(seqs) = self.index.take_reservation(group, reservation) else {
            debug!("PERSISTENCE | Unknown reservation {reservation} for group {group}");
            return Ok(());
        };
        for seq in seqs {
            self.index.remove(group, seq);
            self.payloads.remove(&seq);
        }
        Ok(())
    }

    fn release_logs(&mut self, group: &str, reservation: &ReservationId) {
        self.index.take_reservation(group, reservation);
    }

    async fn clear_group(&mut self, group: &str) -> Result<usize, PersistenceError> {
        let seqs = self.index.remove_group(group);
        for seq in &seqs {
            self.payloads.remove(seq);
        }
        Ok(seqs.len())
    }

    async fn clear_all(&mut self) -> Result<usize, PersistenceError> {
        let mut deleted = 0;
        for group in self.index.group_names() {
            deleted += self.clear_group(&group).await?;
        }
        self.index.release_all();
        Ok(deleted)
    }

    fn clear_pending_state(&mut self) {
        self.index.release_all();
    }

    async fn count_logs(&mut self, group: &str) -> Result<usize, PersistenceError> {
        Ok(self.index.count_unreserved(group))
    }

    fn take_evicted_groups(&mut self) -> HashSet<String> {
        std::mem::take(&mut self.evicted)
    }

    async fn set_max_storage_size(&mut self, max_bytes: u64) -> Result<(), PersistenceError> {
        self.max_bytes = max_bytes;
        let victims = plan_eviction(&self.index, 0, max_bytes)?;
        self.evict(victims);
        Ok(())
    }

    async fn sync(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
