//! Change feed consumer.
//!
//! Keeps the backend registry in step with the announcement store: one full
//! sync at startup, then an endless watch loop applying each change in
//! order. Every registry write happens on the task running this consumer,
//! so a full sync can never interleave with an incremental update.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::registry::{BackendRegistry, Snapshot, UpdateKind, Watermark};

/// A change to the announced backend set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A key was written. The payload may be missing (rejected on apply).
    Put { key: String, payload: Option<String> },
    /// A key was deleted or expired.
    Delete { key: String },
    /// A directory was deleted or expired, taking every key below it.
    DeleteTree { prefix: String },
}

/// Result of one watch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watched {
    /// Apply `change`, then continue from `next`.
    Change { change: Change, next: Watermark },
    /// An event with nothing to apply; continue from `next`.
    Skip { next: Watermark },
    /// The watch ended without an event; retry from the same watermark.
    Idle,
    /// The watermark is older than the store's retained history.
    Outdated,
}

/// Source of backend announcements.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Read every announcement consistently, with the watermark to resume from.
    async fn snapshot(&self) -> Result<Snapshot>;

    /// Block until the next change at or after `from`.
    async fn watch(&self, from: Watermark) -> Result<Watched>;
}

/// What to do with an announcement whose payload does not parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadPolicy {
    /// Log it and keep the previous state for that key.
    #[default]
    Reject,
    /// Stop the consumer; the process exits.
    Abort,
}

/// Drives the registry from a [`ChangeSource`].
pub struct FeedConsumer<S> {
    source: S,
    registry: Arc<BackendRegistry>,
    policy: PayloadPolicy,
}

impl<S: ChangeSource> FeedConsumer<S> {
    /// Create a consumer writing into `registry`.
    pub fn new(source: S, registry: Arc<BackendRegistry>, policy: PayloadPolicy) -> Self {
        Self {
            source,
            registry,
            policy,
        }
    }

    /// Populate the registry from a full snapshot.
    ///
    /// Returns the watermark [`follow`](Self::follow) should start from.
    pub async fn bootstrap(&self) -> Result<Watermark> {
        let snapshot = self
            .source
            .snapshot()
            .await
            .context("initial backend sync failed")?;
        self.sync(snapshot).await
    }

    /// Apply changes from `watermark` onwards, forever.
    ///
    /// Returns only when the watch fails or, under [`PayloadPolicy::Abort`],
    /// on a malformed announcement.
    pub async fn follow(&self, mut watermark: Watermark) -> Result<()> {
        info!(watermark = %watermark, "Watching for backend changes");

        loop {
            let watched = self
                .source
                .watch(watermark)
                .await
                .with_context(|| format!("backend watch from index {watermark} failed"))?;

            match watched {
                Watched::Change { change, next } => {
                    self.apply(change).await?;
                    watermark = next;
                }
                Watched::Skip { next } => {
                    debug!(next = %next, "Skipping event without backend changes");
                    watermark = next;
                }
                Watched::Idle => {
                    debug!(watermark = %watermark, "Watch expired, re-watching");
                }
                Watched::Outdated => {
                    warn!(
                        watermark = %watermark,
                        "Watch index cleared from history, resynchronizing"
                    );
                    let snapshot = self
                        .source
                        .snapshot()
                        .await
                        .context("backend resync failed")?;
                    watermark = self.sync(snapshot).await?;
                }
            }
        }
    }

    async fn sync(&self, snapshot: Snapshot) -> Result<Watermark> {
        let report = self.registry.sync(snapshot).await;

        if self.policy == PayloadPolicy::Abort && !report.rejected.is_empty() {
            bail!(
                "malformed backend announcements: {}",
                report.rejected.join(", ")
            );
        }

        Ok(report.watermark)
    }

    async fn apply(&self, change: Change) -> Result<()> {
        let result = match change {
            Change::Put { key, payload } => {
                self.registry
                    .apply_update(&key, payload.as_deref(), UpdateKind::Put)
                    .await
            }
            Change::Delete { key } => {
                self.registry
                    .apply_update(&key, None, UpdateKind::Delete)
                    .await
            }
            Change::DeleteTree { prefix } => {
                self.registry.remove_subtree(&prefix).await;
                return Ok(());
            }
        };

        match (result, self.policy) {
            (Ok(_), _) => Ok(()),
            (Err(e), PayloadPolicy::Reject) => {
                warn!(error = %e, "Rejected backend announcement");
                Ok(())
            }
            (Err(e), PayloadPolicy::Abort) => {
                Err(e).context("malformed backend announcement")
            }
        }
    }
}
