//! Backend registry.
//!
//! Holds the live set of backends announced under the watched etcd
//! directory and hands out their addresses in round-robin order.
//!
//! - One entry per announcement key; a re-announcement updates the address
//!   in place so the rotation order is stable across address changes
//! - Removal shifts later entries down and keeps the cursor on the entry
//!   that would have been returned next
//! - Every operation runs under a single lock, so a selector never observes
//!   a half-applied membership change

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Errors rejecting a single announcement.
///
/// These never leave the registry in a modified state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A put arrived without a value.
    #[error("announcement for {key} has no payload")]
    MissingPayload { key: String },

    /// The value is not a `{"host": .., "port": ..}` record.
    #[error("malformed announcement for {key}: {reason}")]
    MalformedPayload { key: String, reason: String },
}

/// Resume point in the change stream (an etcd index).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub u64);

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A consistent point-in-time read of every announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// `(key, raw payload)` pairs.
    pub entries: Vec<(String, String)>,
    /// Where incremental updates continue after this snapshot.
    pub watermark: Watermark,
}

/// Result of a full synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Where incremental updates continue.
    pub watermark: Watermark,
    /// Entries now live in the registry.
    pub loaded: usize,
    /// Keys skipped because their payload did not parse.
    pub rejected: Vec<String>,
}

/// Kind of incremental change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Put,
    Delete,
}

/// What an applied update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Updated { previous: String },
    Unchanged,
    Removed,
    /// Delete for a key that was not registered.
    Absent,
}

/// Announcement payload written by backends.
#[derive(Debug, Deserialize)]
struct Announcement {
    host: String,
    port: u16,
}

/// A live backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendEntry {
    /// Key the backend announced itself under.
    pub key: String,
    /// Dialable `host:port`.
    pub address: String,
}

impl BackendEntry {
    /// Parse an announcement payload into an entry.
    pub fn from_announcement(key: &str, payload: &str) -> Result<Self, RegistryError> {
        let malformed = |reason: String| RegistryError::MalformedPayload {
            key: key.to_string(),
            reason,
        };

        let announcement: Announcement =
            serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;

        let host = announcement.host.trim();
        if host.is_empty() {
            return Err(malformed("empty host".to_string()));
        }

        Ok(Self {
            key: key.to_string(),
            address: join_host_port(host, announcement.port),
        })
    }
}

/// Join host and port, bracketing IPv6 literals.
fn join_host_port(host: &str, port: u16) -> String {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Entries in rotation order.
    entries: Vec<BackendEntry>,
    /// Key -> index into `entries`.
    positions: HashMap<String, usize>,
    /// Index of the entry `next` returns. Zero when empty.
    cursor: usize,
}

impl RegistryState {
    fn upsert(&mut self, entry: BackendEntry) -> UpdateOutcome {
        match self.positions.get(&entry.key) {
            Some(&pos) => {
                let current = &mut self.entries[pos];
                if current.address == entry.address {
                    UpdateOutcome::Unchanged
                } else {
                    let previous = std::mem::replace(&mut current.address, entry.address);
                    UpdateOutcome::Updated { previous }
                }
            }
            None => {
                self.positions.insert(entry.key.clone(), self.entries.len());
                self.entries.push(entry);
                UpdateOutcome::Inserted
            }
        }
    }

    fn remove_at(&mut self, pos: usize) -> BackendEntry {
        let removed = self.entries.remove(pos);
        self.positions.remove(&removed.key);

        for entry in &self.entries[pos..] {
            if let Some(p) = self.positions.get_mut(&entry.key) {
                *p -= 1;
            }
        }

        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }

        removed
    }

    fn next(&mut self) -> Option<String> {
        let entry = self.entries.get(self.cursor)?;
        let address = entry.address.clone();
        self.cursor = (self.cursor + 1) % self.entries.len();
        Some(address)
    }
}

/// The set of live backends plus round-robin state.
pub struct BackendRegistry {
    state: RwLock<RegistryState>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Replace the whole backend set from a snapshot.
    ///
    /// Entries with unparseable payloads are skipped and reported. A key
    /// listed twice keeps its first position and its last address. The
    /// rotation restarts from the first entry.
    pub async fn sync(&self, snapshot: Snapshot) -> SyncReport {
        let mut fresh = RegistryState::default();
        let mut rejected = Vec::new();

        for (key, payload) in snapshot.entries {
            match BackendEntry::from_announcement(&key, &payload) {
                Ok(entry) => {
                    fresh.upsert(entry);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping malformed backend announcement");
                    rejected.push(key);
                }
            }
        }

        let loaded = fresh.entries.len();
        {
            let mut state = self.state.write().await;
            *state = fresh;
            for entry in &state.entries {
                debug!(key = %entry.key, address = %entry.address, "Backend registered");
            }
        }

        info!(
            watermark = %snapshot.watermark,
            loaded,
            rejected = rejected.len(),
            "Backend registry synchronized"
        );

        SyncReport {
            watermark: snapshot.watermark,
            loaded,
            rejected,
        }
    }

    /// Apply one incremental change.
    ///
    /// A put whose payload is missing or malformed is rejected and leaves
    /// the existing entry for `key` untouched. Deleting an unknown key is a
    /// no-op.
    pub async fn apply_update(
        &self,
        key: &str,
        payload: Option<&str>,
        kind: UpdateKind,
    ) -> Result<UpdateOutcome, RegistryError> {
        match kind {
            UpdateKind::Put => {
                let payload = payload.ok_or_else(|| RegistryError::MissingPayload {
                    key: key.to_string(),
                })?;
                let entry = BackendEntry::from_announcement(key, payload)?;
                let address = entry.address.clone();

                let outcome = self.state.write().await.upsert(entry);
                match &outcome {
                    UpdateOutcome::Inserted => {
                        info!(key, address = %address, "Backend added");
                    }
                    UpdateOutcome::Updated { previous } => {
                        info!(
                            key,
                            address = %address,
                            previous = %previous,
                            "Backend address changed"
                        );
                    }
                    _ => {
                        debug!(key, address = %address, "Backend re-announced unchanged");
                    }
                }
                Ok(outcome)
            }
            UpdateKind::Delete => {
                let mut state = self.state.write().await;
                let Some(pos) = state.positions.get(key).copied() else {
                    debug!(key, "Delete for unknown backend");
                    return Ok(UpdateOutcome::Absent);
                };

                let removed = state.remove_at(pos);
                info!(
                    key,
                    address = %removed.address,
                    remaining = state.entries.len(),
                    "Backend removed"
                );
                Ok(UpdateOutcome::Removed)
            }
        }
    }

    /// Remove `prefix` and every key below `prefix/`.
    ///
    /// Returns the number of entries removed.
    pub async fn remove_subtree(&self, prefix: &str) -> usize {
        let prefix = prefix.trim_end_matches('/');
        let mut state = self.state.write().await;

        let mut doomed: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.key == prefix
                    || e.key
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|(pos, _)| pos)
            .collect();

        // Highest first so earlier positions stay valid.
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for &pos in &doomed {
            let removed = state.remove_at(pos);
            debug!(
                key = %removed.key,
                address = %removed.address,
                "Backend removed with directory"
            );
        }

        if !doomed.is_empty() {
            info!(
                prefix,
                removed = doomed.len(),
                remaining = state.entries.len(),
                "Backend directory removed"
            );
        }

        doomed.len()
    }

    /// Next backend address in rotation, or `None` when no backend is live.
    pub async fn next(&self) -> Option<String> {
        self.state.write().await.next()
    }

    /// Number of live backends.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Check if no backend is live.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Live entries in rotation order.
    pub async fn entries(&self) -> Vec<BackendEntry> {
        self.state.read().await.entries.clone()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
