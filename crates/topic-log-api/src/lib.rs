use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use topic_log_core::{ChannelId, ChannelInfo, ChannelKind, TopicRecord};
use topic_log_store_sqlite::{ChangeOutcome, IntegrityReport, SchemaStatus, SqliteStore, StoreStats};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Which channels the tracker is allowed to record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackingPolicy {
    pub ignored_channels: BTreeSet<ChannelId>,
}

impl TrackingPolicy {
    #[must_use]
    pub fn new(ignored_channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self { ignored_channels: ignored_channels.into_iter().collect() }
    }

    #[must_use]
    pub fn is_ignored(&self, channel_id: &ChannelId) -> bool {
        self.ignored_channels.contains(channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ObserveOutcome {
    /// The channel is on the ignore list.
    Ignored,
    /// The channel type does not carry a topic.
    Unsupported { kind: ChannelKind },
    /// The observed text already is the channel's latest record.
    Unchanged,
    Recorded { record: TopicRecord, closed_previous: Option<TopicRecord> },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub recorded: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct TopicLogApi {
    db_path: PathBuf,
    policy: TrackingPolicy,
}

impl TopicLogApi {
    #[must_use]
    pub fn new(db_path: PathBuf, policy: TrackingPolicy) -> Self {
        Self { db_path, policy }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect the schema version of the configured database.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Create the schema if needed.
    ///
    /// # Errors
    /// Returns an error when schema creation fails.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Run storage integrity checks.
    ///
    /// # Errors
    /// Returns an error when the checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        self.open_store()?.stats()
    }

    /// Record the channel's current topic if it differs from the latest stored record.
    ///
    /// Ignored channels and channels that do not carry a topic are skipped without touching the
    /// store.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or written.
    pub fn observe(&self, channel: &ChannelInfo) -> Result<ObserveOutcome> {
        if self.policy.is_ignored(&channel.id) {
            tracing::debug!("skipping ignored channel {}", channel.id);
            return Ok(ObserveOutcome::Ignored);
        }
        if !channel.kind.is_topic_bearing() {
            tracing::debug!("skipping {} channel {}", channel.kind.as_str(), channel.id);
            return Ok(ObserveOutcome::Unsupported { kind: channel.kind });
        }

        let mut store = self.open_store()?;
        match store.record_change(&channel.id, channel.topic_text())? {
            ChangeOutcome::Unchanged { .. } => {
                tracing::debug!("topic unchanged for channel {}", channel.id);
                Ok(ObserveOutcome::Unchanged)
            }
            ChangeOutcome::Opened { record, closed } => {
                tracing::info!(
                    "recorded topic for channel {} (closed previous: {})",
                    channel.id,
                    closed.is_some()
                );
                Ok(ObserveOutcome::Recorded { record, closed_previous: closed })
            }
        }
    }

    /// Handle an explicit before/after change notification.
    ///
    /// The claimed previous topic is only logged. Whether anything changed, and which record
    /// gets closed, is always derived from stored history, so a missed earlier change is
    /// repaired by the next event that carries the current topic.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or written.
    pub fn observe_change_event(
        &self,
        old_topic: Option<&str>,
        channel: &ChannelInfo,
    ) -> Result<ObserveOutcome> {
        tracing::debug!("channel update for {} claims previous topic {:?}", channel.id, old_topic);
        self.observe(channel)
    }

    /// Observe every channel once, e.g. when joining a group.
    ///
    /// # Errors
    /// Returns the first store error; channels after the failing one are not observed.
    pub fn seed_channels<'a>(
        &self,
        channels: impl IntoIterator<Item = &'a ChannelInfo>,
    ) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();
        for channel in channels {
            match self.observe(channel)? {
                ObserveOutcome::Recorded { .. } => summary.recorded += 1,
                ObserveOutcome::Unchanged => summary.unchanged += 1,
                ObserveOutcome::Ignored | ObserveOutcome::Unsupported { .. } => {
                    summary.skipped += 1;
                }
            }
        }
        tracing::info!(
            "seeded channels: {} recorded, {} unchanged, {} skipped",
            summary.recorded,
            summary.unchanged,
            summary.skipped
        );
        Ok(summary)
    }

    /// Full history for the channel, most recent first. Empty history is `Ok(vec![])`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn history(&self, channel_id: &ChannelId) -> Result<Vec<TopicRecord>> {
        self.open_store()?.history(channel_id)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn latest(&self, channel_id: &ChannelId) -> Result<Option<TopicRecord>> {
        self.open_store()?.latest(channel_id)
    }
}
