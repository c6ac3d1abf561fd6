// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File-backed store.
//!
//! ```text
//!   <root>/
//!     <hex(group name)>/
//!       00000000000000000001.log
//!       00000000000000000002.log
//! ```
//!
//! Every log is written to a temporary file, fsync'ed and renamed into place.
//! The file name is the global insertion sequence, so sorting names restores FIFO
//! order. The index is built lazily by scanning the root on first use.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{plan_eviction, Persistence, RecordMeta, ReservationId, StoreIndex};
use crate::constants::DEFAULT_MAX_STORAGE_BYTES;
use crate::error::PersistenceError;
use crate::log::Log;
use crate::serializer::{JsonLogSerializer, LogSerializer};

const RECORD_EXTENSION: &str = "log";
const PARTIAL_EXTENSION: &str = "tmp";

#[derive(Debug)]
pub struct FilePersistence {
    root: PathBuf,
    index: StoreIndex,
    loaded: bool,
    serializer: Arc<dyn LogSerializer>,
    max_bytes: u64,
    evicted: HashSet<String>,
}

impl FilePersistence {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, Arc::new(JsonLogSerializer))
    }

    #[must_use]
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: Arc<dyn LogSerializer>) -> Self {
        Self {
            root: root.into(),
            index: StoreIndex::default(),
            loaded: false,
            serializer,
            max_bytes: DEFAULT_MAX_STORAGE_BYTES,
            evicted: HashSet::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.root.join(encode_group(group))
    }

    fn record_path(&self, group: &str, seq: u64) -> PathBuf {
        self.group_dir(group)
            .join(format!("{seq:020}.{RECORD_EXTENSION}"))
    }

    async fn ensure_loaded(&mut self) -> Result<(), PersistenceError> {
        if self.loaded {
            return Ok(());
        }
        fs::create_dir_all(&self.root).await?;

        let mut groups = fs::read_dir(&self.root).await?;
        while let Some(entry) = groups.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let Some(group) = dir_name.to_str().and_then(decode_group) else {
                warn!(
                    "PERSISTENCE | Ignoring unknown directory {}",
                    entry.path().display()
                );
                continue;
            };
            self.load_group(&group, &entry.path()).await?;
        }

        self.loaded = true;
        debug!(
            "PERSISTENCE | Loaded {} bytes of logs from {}",
            self.index.total_bytes(),
            self.root.display()
        );
        Ok(())
    }

    async fn load_group(&mut self, group: &str, dir: &Path) -> Result<(), PersistenceError> {
        let mut records = fs::read_dir(dir).await?;
        while let Some(entry) = records.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_EXTENSION) => {}
                Some(PARTIAL_EXTENSION) => {
                    debug!("PERSISTENCE | Removing partial write {}", path.display());
                    remove_file(&path).await?;
                    continue;
                }
                _ => continue,
            }
            let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };

            let bytes = fs::read(&path).await?;
            match self.serializer.deserialize(&bytes) {
                Ok(log) => self.index.insert(
                    group,
                    seq,
                    RecordMeta {
                        size: bytes.len() as u64,
                        target_key: log.target_key().map(str::to_string),
                    },
                ),
                Err(e) => {
                    warn!(
                        "PERSISTENCE | Removing corrupt record {}: {e}",
                        path.display()
                    );
                    remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }

    async fn evict(&mut self, victims: Vec<(String, u64)>) -> Result<(), PersistenceError> {
        for (group, seq) in victims {
            warn!("PERSISTENCE | Store full, evicting log {seq} of group {group}");
            self.index.remove(&group, seq);
            remove_file(&self.record_path(&group, seq)).await?;
            self.evicted.insert(group);
        }
        Ok(())
    }

    async fn read_record(&self, group: &str, seq: u64) -> Result<Log, PersistenceError> {
        let bytes = fs::read(self.record_path(group, seq)).await?;
        self.serializer.deserialize(&bytes)
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn put_log(&mut self, group: &str, log: &Log) -> Result<u64, PersistenceError> {
        self.ensure_loaded().await?;

        let payload = self.serializer.serialize(log)?;
        let size = payload.len() as u64;
        let victims = plan_eviction(&self.index, size, self.max_bytes)?;
        self.evict(victims).await?;

        let seq = self.index.next_sequence();
        let dir = self.group_dir(group);
        fs::create_dir_all(&dir).await?;

        let partial = dir.join(format!("{seq:020}.{PARTIAL_EXTENSION}"));
        let mut file = fs::File::create(&partial).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, self.record_path(group, seq)).await?;

        self.index.insert(
            group,
            seq,
            RecordMeta {
                size,
                target_key: log.target_key().map(str::to_string),
            },
        );
        Ok(seq)
    }

    async fn get_logs(
        &mut self,
        group: &str,
        excluded_target_keys: &HashSet<String>,
        limit: usize,
        out: &mut Vec<Log>,
    ) -> Result<Option<ReservationId>, PersistenceError> {
        self.ensure_loaded().await?;

        let mut reserved = Vec::new();
        for seq in self.index.candidates(group, excluded_target_keys, limit) {
            match self.read_record(group, seq).await {
                Ok(log) => {
                    out.push(log);
                    reserved.push(seq);
                }
                Err(PersistenceError::Io(e)) if e.kind() != ErrorKind::NotFound => {
                    return Err(PersistenceError::Io(e));
                }
                Err(e) => {
                    warn!("PERSISTENCE | Dropping unreadable log {seq} of group {group}: {e}");
                    self.index.remove(group, seq);
                    remove_file(&self.record_path(group, seq)).await?;
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
            remove_file(&self.record_path(group, seq)).await?;
        }
        Ok(())
    }

    fn release_logs(&mut self, group: &str, reservation: &ReservationId) {
        self.index.take_reservation(group, reservation);
    }

    async fn clear_group(&mut self, group: &str) -> Result<usize, PersistenceError> {
        self.ensure_loaded().await?;
        let deleted = self.index.remove_group(group).len();
        match fs::remove_dir_all(self.group_dir(group)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(deleted)
    }

    async fn clear_all(&mut self) -> Result<usize, PersistenceError> {
        self.ensure_loaded().await?;
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
        self.ensure_loaded().await?;
        Ok(self.index.count_unreserved(group))
    }

    fn take_evicted_groups(&mut self) -> HashSet<String> {
        std::mem::take(&mut self.evicted)
    }

    async fn set_max_storage_size(&mut self, max_bytes: u64) -> Result<(), PersistenceError> {
        self.ensure_loaded().await?;
        self.max_bytes = max_bytes;
        let victims = plan_eviction(&self.index, 0, max_bytes)?;
        self.evict(victims).await
    }

    async fn sync(&mut self) -> Result<(), PersistenceError> {
        // Records are fsync'ed on write; only the directory entries may lag behind.
        for group in self.index.group_names() {
            let dir = self.group_dir(&group);
            if let Err(e) = sync_dir(&dir).await {
                debug!("PERSISTENCE | Could not sync {}: {e}", dir.display());
            }
        }
        Ok(())
    }
}

async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

async fn remove_file(path: &Path) -> Result<(), PersistenceError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn encode_group(group: &str) -> String {
    group.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_group(encoded: &str) -> Option<String> {
    if encoded.is_empty() || encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
