use std::sync::Arc;

use anyhow::{Context, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use topic_log_core::{
    build_export_document, build_history_view, ChannelId, ChannelInfo, HistoryView,
};

use crate::handle::TopicLogHandle;
use crate::platform::Platform;
use crate::publisher::{PastePublisher, SnapshotAction};

pub const NO_SUCH_CHANNEL_MESSAGE: &str = "No such channel found.";
pub const INVALID_CHANNEL_MESSAGE: &str =
    "Invalid channel provided. Make sure you link to the channel.";
pub const PERMISSION_DENIED_MESSAGE: &str = "You do not have permission to view that channel";

#[must_use]
pub fn no_history_message(channel_id: &ChannelId) -> String {
    format!("No topic history for {}", channel_id.mention())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    /// Bare invocation: the channel the command was sent in.
    CurrentChannel,
    Mentioned(ChannelId),
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandReply {
    Text { content: String },
    History { view: HistoryView },
}

impl CommandReply {
    fn text(content: impl Into<String>) -> Self {
        Self::Text { content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSettings {
    pub topics_per_page: usize,
    pub navigation_timeout_ms: u64,
}

/// Turns prefixed chat messages into history replies and serves snapshot exports.
#[derive(Debug)]
pub struct CommandDispatcher<P> {
    platform: Arc<P>,
    topics: TopicLogHandle,
    publisher: PastePublisher,
    prefix: String,
    mention: Regex,
    settings: ViewSettings,
}

impl<P: Platform> CommandDispatcher<P> {
    /// # Errors
    /// Returns an error when the channel mention pattern fails to compile.
    pub fn new(
        platform: Arc<P>,
        topics: TopicLogHandle,
        publisher: PastePublisher,
        prefix: impl Into<String>,
        settings: ViewSettings,
    ) -> Result<Self> {
        let mention =
            Regex::new(r"^<#(\d+)>$").context("failed to compile channel mention pattern")?;
        Ok(Self { platform, topics, publisher, prefix: prefix.into(), mention, settings })
    }

    /// Classify a message; `None` when it does not start with the command prefix.
    #[must_use]
    pub fn parse(&self, content: &str) -> Option<CommandTarget> {
        let args = content.strip_prefix(self.prefix.as_str())?.trim();
        if args.is_empty() {
            return Some(CommandTarget::CurrentChannel);
        }

        let target = match self.mention.captures(args).and_then(|caps| caps.get(1)) {
            Some(id) => CommandTarget::Mentioned(ChannelId::new(id.as_str())),
            None => CommandTarget::Invalid,
        };
        Some(target)
    }

    /// Handle one chat message.
    ///
    /// Returns `Ok(None)` for messages that are not commands. Resolution failures, permission
    /// denials, malformed arguments, and empty history all become text replies.
    ///
    /// # Errors
    /// Returns an error when history cannot be read from the store.
    pub async fn dispatch(
        &self,
        author_id: &str,
        channel: &ChannelInfo,
        content: &str,
    ) -> Result<Option<CommandReply>> {
        let Some(target) = self.parse(content) else {
            return Ok(None);
        };

        let target_channel = match target {
            CommandTarget::CurrentChannel => channel.clone(),
            CommandTarget::Invalid => return Ok(Some(CommandReply::text(INVALID_CHANNEL_MESSAGE))),
            CommandTarget::Mentioned(channel_id) => {
                match self.platform.resolve_channel(&channel_id).await {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        tracing::warn!("failed to resolve channel {}: {}", channel_id, err);
                        return Ok(Some(CommandReply::text(NO_SUCH_CHANNEL_MESSAGE)));
                    }
                }
            }
        };

        if !self.may_view(author_id, &target_channel).await {
            return Ok(Some(CommandReply::text(PERMISSION_DENIED_MESSAGE)));
        }

        let records = self.topics.history(target_channel.id.clone()).await?;
        let view = build_history_view(
            &target_channel,
            author_id,
            &records,
            self.settings.topics_per_page,
            self.settings.navigation_timeout_ms,
        )?;

        Ok(Some(match view {
            Some(view) => CommandReply::History { view },
            None => CommandReply::text(no_history_message(&target_channel.id)),
        }))
    }

    /// Export a channel's history to the paste host on behalf of `requester_id`.
    ///
    /// Access is checked again before any history is read. Every recoverable failure yields an
    /// action without a URL.
    ///
    /// # Errors
    /// Returns an error when history cannot be read or the export document cannot be built.
    pub async fn snapshot(
        &self,
        requester_id: &str,
        channel_id: &ChannelId,
    ) -> Result<SnapshotAction> {
        let channel = match self.platform.resolve_channel(channel_id).await {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!("snapshot for unresolvable channel {}: {}", channel_id, err);
                return Ok(SnapshotAction::default());
            }
        };
        if !self.may_view(requester_id, &channel).await {
            return Ok(SnapshotAction::default());
        }

        let records = self.topics.history(channel.id.clone()).await?;
        if records.is_empty() {
            tracing::debug!("no history to export for channel {}", channel.id);
            return Ok(SnapshotAction::default());
        }

        let document = build_export_document(&channel, &records, OffsetDateTime::now_utc())?;
        Ok(self.publisher.snapshot_action(&document).await)
    }

    async fn may_view(&self, user_id: &str, channel: &ChannelInfo) -> bool {
        if channel.guild.is_none() {
            return true;
        }
        match self.platform.can_view_channel(user_id, channel).await {
            Ok(allowed) => {
                if !allowed {
                    tracing::info!("user {} denied history of channel {}", user_id, channel.id);
                }
                allowed
            }
            Err(err) => {
                tracing::warn!("permission check failed for channel {}: {}", channel.id, err);
                false
            }
        }
    }
}
