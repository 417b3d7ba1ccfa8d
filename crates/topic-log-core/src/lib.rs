use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Rendered in place of an empty topic on history pages.
pub const NO_TOPIC_PLACEHOLDER: &str = "*No topic*";
pub const FIELD_TIMESTAMP_SUFFIX: &str = " UTC";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TopicLogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Platform mention markup for this channel, e.g. `<#1234>`.
    #[must_use]
    pub fn mention(&self) -> String {
        format!("<#{}>", self.0)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    News,
    Voice,
    Category,
    Thread,
    Other,
}

impl ChannelKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::News => "news",
            Self::Voice => "voice",
            Self::Category => "category",
            Self::Thread => "thread",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "news" => Some(Self::News),
            "voice" => Some(Self::Voice),
            "category" => Some(Self::Category),
            "thread" => Some(Self::Thread),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Only standard text and news channels carry a tracked topic.
    #[must_use]
    pub fn is_topic_bearing(self) -> bool {
        matches!(self, Self::Text | Self::News)
    }
}

/// A timestamp in the store's native `YYYY-MM-DD HH:MM:SS` form (UTC, no zone marker).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StoreTimestamp(pub String);

impl StoreTimestamp {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn to_iso8601(&self) -> String {
        iso8601_from_store(&self.0)
    }
}

impl Display for StoreTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert a store timestamp into the export format.
///
/// The date is taken from characters `0..10` and the time from `11..19`, joined by `T` and
/// suffixed with `Z`. Out-of-range slices are truncated rather than rejected, so malformed input
/// produces a short string instead of an error.
#[must_use]
pub fn iso8601_from_store(raw: &str) -> String {
    let date = raw.chars().take(10).collect::<String>();
    let time = raw.chars().skip(11).take(8).collect::<String>();
    format!("{date}T{time}Z")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TopicRecord {
    /// Store-assigned insertion sequence; breaks ties between equal `first_seen` values.
    pub seq: i64,
    pub channel_id: ChannelId,
    pub text: String,
    pub first_seen: StoreTimestamp,
    pub unset: Option<StoreTimestamp>,
}

impl TopicRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.unset.is_none()
    }
}

/// Decide whether an observed topic must open a new record.
///
/// A record is needed when the channel has no history yet or when the text differs from the
/// most recent record. Repeated observations of the current text are no-ops.
#[must_use]
pub fn needs_new_record(latest: Option<&TopicRecord>, observed_text: &str) -> bool {
    match latest {
        Some(record) => record.text != observed_text,
        None => true,
    }
}

/// Platforms report a missing topic as null; the store records it as the empty string.
#[must_use]
pub fn normalize_topic(topic: Option<&str>) -> &str {
    topic.unwrap_or("")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GuildInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub guild: Option<GuildInfo>,
}

impl ChannelInfo {
    #[must_use]
    pub fn topic_text(&self) -> &str {
        normalize_topic(self.topic.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryPage {
    pub number: usize,
    pub total: usize,
    pub footer: String,
    pub fields: Vec<PageField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryView {
    pub title: String,
    pub channel_id: ChannelId,
    pub authorized_user_id: String,
    pub navigation_timeout_ms: u64,
    pub pages: Vec<HistoryPage>,
}

fn page_field(record: &TopicRecord) -> PageField {
    let value =
        if record.text.is_empty() { NO_TOPIC_PLACEHOLDER.to_string() } else { record.text.clone() };
    PageField {
        name: format!("{}{FIELD_TIMESTAMP_SUFFIX}", record.first_seen.as_str()),
        value,
        inline: true,
    }
}

/// Split ordered history into fixed-size pages labeled `Page i of N`.
///
/// Record order is preserved. Empty history yields no pages.
///
/// # Errors
/// Returns [`TopicLogError::Validation`] when `page_size` is zero.
pub fn paginate(
    records: &[TopicRecord],
    page_size: usize,
) -> Result<Vec<HistoryPage>, TopicLogError> {
    if page_size == 0 {
        return Err(TopicLogError::Validation("page size MUST be >= 1".to_string()));
    }

    let chunks = records.chunks(page_size);
    let total = chunks.len();

    Ok(chunks
        .enumerate()
        .map(|(index, chunk)| {
            let number = index + 1;
            HistoryPage {
                number,
                total,
                footer: format!("Page {number} of {total}"),
                fields: chunk.iter().map(page_field).collect(),
            }
        })
        .collect())
}

#[must_use]
pub fn history_title(channel_name: &str) -> String {
    format!("Topic history for #{channel_name}")
}

/// Build the paginated view for a channel, or `None` when there is no history to show.
///
/// # Errors
/// Returns [`TopicLogError::Validation`] when `page_size` is zero.
pub fn build_history_view(
    channel: &ChannelInfo,
    requester_id: &str,
    records: &[TopicRecord],
    page_size: usize,
    navigation_timeout_ms: u64,
) -> Result<Option<HistoryView>, TopicLogError> {
    let pages = paginate(records, page_size)?;
    if pages.is_empty() {
        return Ok(None);
    }

    Ok(Some(HistoryView {
        title: history_title(&channel.name),
        channel_id: channel.id.clone(),
        authorized_user_id: requester_id.to_string(),
        navigation_timeout_ms,
        pages,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportEntry {
    pub text: String,
    pub first_seen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unset: Option<String>,
}

impl From<&TopicRecord> for ExportEntry {
    fn from(record: &TopicRecord) -> Self {
        Self {
            text: record.text.clone(),
            first_seen: record.first_seen.to_iso8601(),
            unset: record.unset.as_ref().map(StoreTimestamp::to_iso8601),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportDocument {
    pub updated: String,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub guild_id: Option<String>,
    pub guild_name: Option<String>,
    pub topics: Vec<ExportEntry>,
}

impl ExportDocument {
    /// Compact serialization, no insignificant whitespace.
    ///
    /// # Errors
    /// Returns [`TopicLogError::Serialization`] when JSON encoding fails.
    pub fn to_compact_json(&self) -> Result<String, TopicLogError> {
        serde_json::to_string(self).map_err(|err| TopicLogError::Serialization(err.to_string()))
    }

    /// Pretty serialization indented by two spaces.
    ///
    /// # Errors
    /// Returns [`TopicLogError::Serialization`] when JSON encoding fails.
    pub fn to_pretty_json(&self) -> Result<String, TopicLogError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| TopicLogError::Serialization(err.to_string()))
    }
}

/// Render the export timestamp as `YYYY-MM-DDTHH:MM:SS.sssZ` in UTC.
///
/// # Errors
/// Returns [`TopicLogError::Serialization`] when the timestamp cannot be formatted.
pub fn export_timestamp(value: OffsetDateTime) -> Result<String, TopicLogError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        ))
        .map_err(|err| TopicLogError::Serialization(format!("invalid export timestamp: {err}")))
}

/// Project a channel's ordered history into a point-in-time export document.
///
/// # Errors
/// Returns [`TopicLogError::Serialization`] when `exported_at` cannot be rendered.
pub fn build_export_document(
    channel: &ChannelInfo,
    records: &[TopicRecord],
    exported_at: OffsetDateTime,
) -> Result<ExportDocument, TopicLogError> {
    Ok(ExportDocument {
        updated: export_timestamp(exported_at)?,
        channel_id: channel.id.clone(),
        channel_name: channel.name.clone(),
        guild_id: channel.guild.as_ref().map(|guild| guild.id.clone()),
        guild_name: channel.guild.as_ref().map(|guild| guild.name.clone()),
        topics: records.iter().map(ExportEntry::from).collect(),
    })
}
