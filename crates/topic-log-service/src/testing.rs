//! Shared fixtures for service tests.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use topic_log_core::{ChannelId, ChannelInfo, ChannelKind, GuildInfo};

use crate::platform::{Platform, PlatformError};

pub type Captured = Arc<Mutex<Vec<Value>>>;
/// Request path and `Authorization` header of every call a loopback REST host saw.
pub type SeenRequests = Arc<Mutex<Vec<(String, Option<String>)>>>;

pub fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("topic-log-service-{}.sqlite3", ulid::Ulid::new()))
}

pub fn guild_channel(id: &str, name: &str, topic: Option<&str>) -> ChannelInfo {
    ChannelInfo {
        id: ChannelId::new(id),
        name: name.to_string(),
        kind: ChannelKind::Text,
        topic: topic.map(str::to_string),
        guild: Some(GuildInfo { id: "900".to_string(), name: "Rustaceans".to_string() }),
    }
}

pub fn direct_channel(id: &str) -> ChannelInfo {
    ChannelInfo {
        id: ChannelId::new(id),
        name: id.to_string(),
        kind: ChannelKind::Other,
        topic: None,
        guild: None,
    }
}

/// In-memory platform: known channels, plus channels hidden from everyone but `"admin"`.
#[derive(Debug, Default)]
pub struct FakePlatform {
    pub channels: BTreeMap<String, ChannelInfo>,
    pub hidden: BTreeSet<String>,
    pub permission_lookup_fails: bool,
}

impl FakePlatform {
    pub fn with_channels(channels: impl IntoIterator<Item = ChannelInfo>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|channel| (channel.id.as_str().to_string(), channel))
                .collect(),
            ..Self::default()
        }
    }

    pub fn hide(mut self, channel_id: &str) -> Self {
        self.hidden.insert(channel_id.to_string());
        self
    }
}

impl Platform for FakePlatform {
    async fn resolve_channel(&self, channel_id: &ChannelId) -> Result<ChannelInfo, PlatformError> {
        self.channels
            .get(channel_id.as_str())
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(channel_id.to_string()))
    }

    async fn can_view_channel(
        &self,
        user_id: &str,
        channel: &ChannelInfo,
    ) -> Result<bool, PlatformError> {
        if self.permission_lookup_fails {
            return Err(PlatformError::Api("member lookup failed".to_string()));
        }
        Ok(user_id == "admin" || !self.hidden.contains(channel.id.as_str()))
    }
}

/// Loopback paste host answering `POST /v1/pastes` with a fixed reply and recording bodies.
pub async fn spawn_paste_server(
    status: StatusCode,
    reply: Value,
) -> Result<(SocketAddr, Captured)> {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route(
            "/v1/pastes",
            post(move |State(captured): State<Captured>, Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    if let Ok(mut seen) = captured.lock() {
                        seen.push(body);
                    }
                    (status, Json(reply))
                }
            }),
        )
        .with_state(Arc::clone(&captured));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, captured))
}

/// Loopback chat REST host serving fixed JSON bodies by path. Unknown paths answer 404.
pub async fn spawn_platform_server(
    routes: BTreeMap<String, Value>,
) -> Result<(SocketAddr, SeenRequests)> {
    let seen: SeenRequests = Arc::new(Mutex::new(Vec::new()));
    let routes = Arc::new(routes);
    let recorder = Arc::clone(&seen);
    let router = Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
        let routes = Arc::clone(&routes);
        let recorder = Arc::clone(&recorder);
        async move {
            let auth = headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            if let Ok(mut seen) = recorder.lock() {
                seen.push((uri.path().to_string(), auth));
            }
            match routes.get(uri.path()) {
                Some(body) => (StatusCode::OK, Json(body.clone())),
                None => (StatusCode::NOT_FOUND, Json(json!({"message": "Unknown Channel"}))),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, seen))
}
