//! Chat-platform adapter: channel resolution and view-permission checks.

use std::future::Future;
use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use topic_log_core::{ChannelId, ChannelInfo, ChannelKind, GuildInfo};

pub const VIEW_CHANNEL: u64 = 1 << 10;
pub const ADMINISTRATOR: u64 = 1 << 3;
const ALL_PERMISSIONS: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
}

pub trait Platform: Send + Sync + 'static {
    /// Look up a channel by id.
    fn resolve_channel(
        &self,
        channel_id: &ChannelId,
    ) -> impl Future<Output = Result<ChannelInfo, PlatformError>> + Send;

    /// Whether `user_id` may view `channel`.
    fn can_view_channel(
        &self,
        user_id: &str,
        channel: &ChannelInfo,
    ) -> impl Future<Output = Result<bool, PlatformError>> + Send;
}

/// Map a Discord channel type code.
#[must_use]
pub fn channel_kind_from_code(code: u8) -> ChannelKind {
    match code {
        0 => ChannelKind::Text,
        5 => ChannelKind::News,
        2 | 13 => ChannelKind::Voice,
        4 => ChannelKind::Category,
        10..=12 => ChannelKind::Thread,
        _ => ChannelKind::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteKind {
    Role,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionOverwrite {
    pub id: String,
    pub kind: OverwriteKind,
    pub allow: u64,
    pub deny: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRoles {
    pub guild_id: String,
    pub owner_id: String,
    /// `(role id, permission bits)`; the `@everyone` role shares the guild id.
    pub roles: Vec<(String, u64)>,
}

/// Effective channel permissions of a member.
///
/// The guild owner and holders of `ADMINISTRATOR` get everything. Otherwise the base role
/// permissions are adjusted by the `@everyone` overwrite, then by the union of the member's role
/// overwrites, then by the member-specific overwrite.
#[must_use]
pub fn compute_channel_permissions(
    guild: &GuildRoles,
    user_id: &str,
    member_roles: &[String],
    overwrites: &[PermissionOverwrite],
) -> u64 {
    if guild.owner_id == user_id {
        return ALL_PERMISSIONS;
    }

    let mut permissions = guild
        .roles
        .iter()
        .filter(|(id, _)| *id == guild.guild_id || member_roles.contains(id))
        .fold(0_u64, |acc, (_, bits)| acc | bits);
    if permissions & ADMINISTRATOR != 0 {
        return ALL_PERMISSIONS;
    }

    if let Some(everyone) = overwrites
        .iter()
        .find(|overwrite| overwrite.kind == OverwriteKind::Role && overwrite.id == guild.guild_id)
    {
        permissions = (permissions & !everyone.deny) | everyone.allow;
    }

    let (role_allow, role_deny) = overwrites
        .iter()
        .filter(|overwrite| {
            overwrite.kind == OverwriteKind::Role && member_roles.contains(&overwrite.id)
        })
        .fold((0_u64, 0_u64), |(allow, deny), overwrite| {
            (allow | overwrite.allow, deny | overwrite.deny)
        });
    permissions = (permissions & !role_deny) | role_allow;

    if let Some(member) = overwrites
        .iter()
        .find(|overwrite| overwrite.kind == OverwriteKind::Member && overwrite.id == user_id)
    {
        permissions = (permissions & !member.deny) | member.allow;
    }

    permissions
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    permission_overwrites: Vec<RawOverwrite>,
}

#[derive(Debug, Deserialize)]
struct RawOverwrite {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

#[derive(Debug, Deserialize)]
struct RawGuild {
    id: String,
    name: String,
    owner_id: String,
    #[serde(default)]
    roles: Vec<RawRole>,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    id: String,
    permissions: String,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    #[serde(default)]
    roles: Vec<String>,
}

fn parse_bits(raw: &str) -> Result<u64, PlatformError> {
    raw.parse::<u64>().map_err(|_| PlatformError::Api(format!("invalid permission bitset: {raw}")))
}

impl RawOverwrite {
    fn parse(&self) -> Result<PermissionOverwrite, PlatformError> {
        Ok(PermissionOverwrite {
            id: self.id.clone(),
            kind: if self.kind == 1 { OverwriteKind::Member } else { OverwriteKind::Role },
            allow: parse_bits(&self.allow)?,
            deny: parse_bits(&self.deny)?,
        })
    }
}

impl RawGuild {
    fn roles(&self) -> Result<GuildRoles, PlatformError> {
        let roles = self
            .roles
            .iter()
            .map(|role| Ok((role.id.clone(), parse_bits(&role.permissions)?)))
            .collect::<Result<Vec<_>, PlatformError>>()?;
        Ok(GuildRoles { guild_id: self.id.clone(), owner_id: self.owner_id.clone(), roles })
    }
}

/// Platform adapter backed by a Discord-compatible REST API.
#[derive(Debug, Clone)]
pub struct RestPlatform {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl RestPlatform {
    /// # Errors
    /// Returns [`PlatformError::Request`] when the HTTP client cannot be built.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Bot {token}"),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, &self.auth_header)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
            return Err(PlatformError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(PlatformError::Api(format!("GET {path} returned {status}")));
        }
        Ok(resp.json::<T>().await?)
    }
}

impl Platform for RestPlatform {
    async fn resolve_channel(&self, channel_id: &ChannelId) -> Result<ChannelInfo, PlatformError> {
        let raw: RawChannel = self.get_json(&format!("/channels/{channel_id}")).await?;
        let guild = match &raw.guild_id {
            Some(guild_id) => {
                let guild: RawGuild = self.get_json(&format!("/guilds/{guild_id}")).await?;
                Some(GuildInfo { id: guild.id, name: guild.name })
            }
            None => None,
        };

        Ok(ChannelInfo {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: ChannelId::new(raw.id),
            kind: channel_kind_from_code(raw.kind),
            topic: raw.topic,
            guild,
        })
    }

    async fn can_view_channel(
        &self,
        user_id: &str,
        channel: &ChannelInfo,
    ) -> Result<bool, PlatformError> {
        let Some(guild_info) = &channel.guild else {
            return Ok(true);
        };

        let raw_channel: RawChannel = self.get_json(&format!("/channels/{}", channel.id)).await?;
        let guild: RawGuild = self.get_json(&format!("/guilds/{}", guild_info.id)).await?;
        let member: RawMember =
            self.get_json(&format!("/guilds/{}/members/{user_id}", guild_info.id)).await?;

        let overwrites = raw_channel
            .permission_overwrites
            .iter()
            .map(RawOverwrite::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let permissions =
            compute_channel_permissions(&guild.roles()?, user_id, &member.roles, &overwrites);
        Ok(permissions & VIEW_CHANNEL != 0)
    }
}
