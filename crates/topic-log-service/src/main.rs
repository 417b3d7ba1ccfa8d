use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use topic_log_api::{ObserveOutcome, SeedSummary, TopicLogApi, TrackingPolicy, API_CONTRACT_VERSION};
use topic_log_core::{ChannelId, ChannelInfo, GuildInfo};
use topic_log_store_sqlite::StoreStats;
use tracing_subscriber::EnvFilter;

mod config;
mod dispatch;
mod handle;
mod platform;
mod publisher;
#[cfg(test)]
mod testing;

use config::Config;
use dispatch::{CommandDispatcher, CommandReply, ViewSettings};
use handle::TopicLogHandle;
use platform::{Platform, RestPlatform};
use publisher::{PastePublisher, SnapshotAction};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const PLATFORM_TIMEOUT: Duration = Duration::from_secs(10);

struct ServiceState<P> {
    topics: TopicLogHandle,
    dispatcher: Arc<CommandDispatcher<P>>,
}

impl<P> Clone for ServiceState<P> {
    fn clone(&self) -> Self {
        Self { topics: self.topics.clone(), dispatcher: Arc::clone(&self.dispatcher) }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelUpdateEvent {
    #[serde(default)]
    old_topic: Option<String>,
    channel: ChannelInfo,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelCreateEvent {
    channel: ChannelInfo,
}

#[derive(Debug, Clone, Deserialize)]
struct GuildCreateEvent {
    guild: GuildInfo,
    channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageEvent {
    author_id: String,
    channel: ChannelInfo,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotRequest {
    requester_id: String,
    channel_id: ChannelId,
}

#[derive(Debug, Parser)]
#[command(name = "topic-log-service")]
#[command(about = "Tracks channel topic history and serves it on request")]
struct Args {
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,
    /// Overrides `http.bind` from the config file.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

fn service_error(context: &str, err: &anyhow::Error) -> ServiceError {
    tracing::error!("{}: {:#}", context, err);
    ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: format!("{err:#}") }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app<P: Platform>(state: ServiceState<P>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stats", get(stats::<P>))
        .route("/v1/events/channel-update", post(channel_update::<P>))
        .route("/v1/events/channel-create", post(channel_create::<P>))
        .route("/v1/events/guild-create", post(guild_create::<P>))
        .route("/v1/events/message", post(message::<P>))
        .route("/v1/snapshots", post(snapshot::<P>))
        .with_state(state)
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn build_state(config: &Config) -> Result<ServiceState<RestPlatform>> {
    let api = TopicLogApi::new(
        config.db.path.clone(),
        TrackingPolicy::new(config.bot.ignored_channels.iter().cloned()),
    );
    let status = api.migrate()?;
    tracing::info!(
        "opened topic store {} at schema version {}",
        config.db.path.display(),
        status.current_version
    );

    let platform =
        RestPlatform::new(&config.bot.api_base_url, &config.bot.token, PLATFORM_TIMEOUT)?;
    let publisher = PastePublisher::new(
        &config.bot.paste_api_base(),
        &config.bot.paste_url,
        Duration::from_secs(config.bot.paste_timeout_secs),
    )?;
    let topics = TopicLogHandle::new(api);
    let dispatcher = CommandDispatcher::new(
        Arc::new(platform),
        topics.clone(),
        publisher,
        config.bot.command.clone(),
        ViewSettings {
            topics_per_page: config.bot.topics_per_page,
            navigation_timeout_ms: config.bot.navigation_timeout,
        },
    )?;

    Ok(ServiceState { topics, dispatcher: Arc::new(dispatcher) })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    init_tracing(&config.log.filter);

    let state = build_state(&config)?;
    let bind = args.bind.unwrap_or(config.http.bind);
    tracing::info!("listening on {}", bind);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn stats<P: Platform>(
    State(state): State<ServiceState<P>>,
) -> Result<Json<ServiceEnvelope<StoreStats>>, ServiceError> {
    let stats = state.topics.stats().await.map_err(|err| service_error("stats failed", &err))?;
    Ok(Json(envelope(stats)))
}

async fn channel_update<P: Platform>(
    State(state): State<ServiceState<P>>,
    Json(event): Json<ChannelUpdateEvent>,
) -> Result<Json<ServiceEnvelope<ObserveOutcome>>, ServiceError> {
    let outcome = state
        .topics
        .observe_change_event(event.old_topic, event.channel)
        .await
        .map_err(|err| service_error("channel update failed", &err))?;
    Ok(Json(envelope(outcome)))
}

async fn channel_create<P: Platform>(
    State(state): State<ServiceState<P>>,
    Json(event): Json<ChannelCreateEvent>,
) -> Result<Json<ServiceEnvelope<ObserveOutcome>>, ServiceError> {
    let outcome = state
        .topics
        .observe(event.channel)
        .await
        .map_err(|err| service_error("channel create failed", &err))?;
    Ok(Json(envelope(outcome)))
}

async fn guild_create<P: Platform>(
    State(state): State<ServiceState<P>>,
    Json(event): Json<GuildCreateEvent>,
) -> Result<Json<ServiceEnvelope<SeedSummary>>, ServiceError> {
    let guild = event.guild;
    let channels = event
        .channels
        .into_iter()
        .map(|mut channel| {
            if channel.guild.is_none() {
                channel.guild = Some(guild.clone());
            }
            channel
        })
        .collect::<Vec<_>>();
    tracing::info!("seeding {} channels of guild {}", channels.len(), guild.id);

    let summary = state
        .topics
        .seed_channels(channels)
        .await
        .map_err(|err| service_error("guild seed failed", &err))?;
    Ok(Json(envelope(summary)))
}

async fn message<P: Platform>(
    State(state): State<ServiceState<P>>,
    Json(event): Json<MessageEvent>,
) -> Result<Json<ServiceEnvelope<Option<CommandReply>>>, ServiceError> {
    let reply = state
        .dispatcher
        .dispatch(&event.author_id, &event.channel, &event.content)
        .await
        .map_err(|err| service_error("command failed", &err))?;
    Ok(Json(envelope(reply)))
}

async fn snapshot<P: Platform>(
    State(state): State<ServiceState<P>>,
    Json(request): Json<SnapshotRequest>,
) -> Result<Json<ServiceEnvelope<SnapshotAction>>, ServiceError> {
    let action = state
        .dispatcher
        .snapshot(&request.requester_id, &request.channel_id)
        .await
        .map_err(|err| service_error("snapshot failed", &err))?;
    Ok(Json(envelope(action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    use crate::testing::{guild_channel, unique_temp_db_path, FakePlatform};

    fn test_state(db_path: PathBuf, platform: FakePlatform) -> ServiceState<FakePlatform> {
        let policy = TrackingPolicy::new([ChannelId::new("13")]);
        let topics = TopicLogHandle::new(TopicLogApi::new(db_path, policy));
        let publisher =
            PastePublisher::new("http://127.0.0.1:9", "paste.gg", Duration::from_secs(2))
                .unwrap_or_else(|err| panic!("failed to build publisher: {err}"));
        let dispatcher = CommandDispatcher::new(
            Arc::new(platform),
            topics.clone(),
            publisher,
            "!topics",
            ViewSettings { topics_per_page: 5, navigation_timeout_ms: 60_000 },
        )
        .unwrap_or_else(|err| panic!("failed to build dispatcher: {err}"));
        ServiceState { topics, dispatcher: Arc::new(dispatcher) }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(
        router: Router,
        uri: &str,
        payload: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    fn channel_json(id: &str, kind: &str, topic: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("channel-{id}"),
            "kind": kind,
            "topic": topic,
            "guild": {"id": "900", "name": "Rustaceans"},
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(unique_temp_db_path(), FakePlatform::default()));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn channel_events_record_dedup_and_skip() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), FakePlatform::default()));

        let (status, value) = post_json(
            router.clone(),
            "/v1/events/channel-create",
            &serde_json::json!({"channel": channel_json("1", "text", Some("hello"))}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["outcome"], "recorded");
        assert_eq!(value["data"]["record"]["text"], "hello");

        let (_, value) = post_json(
            router.clone(),
            "/v1/events/channel-update",
            &serde_json::json!({
                "old_topic": "hello",
                "channel": channel_json("1", "text", Some("world"))
            }),
        )
        .await;
        assert_eq!(value["data"]["outcome"], "recorded");
        assert_eq!(value["data"]["closed_previous"]["text"], "hello");

        let (_, value) = post_json(
            router.clone(),
            "/v1/events/channel-update",
            &serde_json::json!({
                "old_topic": "world",
                "channel": channel_json("1", "text", Some("world"))
            }),
        )
        .await;
        assert_eq!(value["data"]["outcome"], "unchanged");

        let (_, value) = post_json(
            router.clone(),
            "/v1/events/channel-create",
            &serde_json::json!({"channel": channel_json("13", "text", Some("nope"))}),
        )
        .await;
        assert_eq!(value["data"]["outcome"], "ignored");

        let (_, value) = post_json(
            router,
            "/v1/events/channel-create",
            &serde_json::json!({"channel": channel_json("5", "voice", None)}),
        )
        .await;
        assert_eq!(value["data"]["outcome"], "unsupported");

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn guild_create_seeds_channels_and_commands_read_them_back() {
        let db_path = unique_temp_db_path();
        let platform = FakePlatform::with_channels([guild_channel("2", "channel-2", None)]);
        let router = app(test_state(db_path.clone(), platform));

        let (status, value) = post_json(
            router.clone(),
            "/v1/events/guild-create",
            &serde_json::json!({
                "guild": {"id": "900", "name": "Rustaceans"},
                "channels": [
                    {"id": "1", "name": "general", "kind": "text", "topic": "welcome"},
                    {"id": "2", "name": "channel-2", "kind": "news", "topic": null},
                    {"id": "3", "name": "lounge", "kind": "voice"},
                ],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"], serde_json::json!({"recorded": 2, "unchanged": 0, "skipped": 1}));

        let (_, value) = post_json(
            router.clone(),
            "/v1/events/message",
            &serde_json::json!({
                "author_id": "user",
                "channel": channel_json("1", "text", Some("welcome")),
                "content": "!topics <#2>",
            }),
        )
        .await;
        assert_eq!(value["data"]["kind"], "history");
        assert_eq!(value["data"]["view"]["title"], "Topic history for #channel-2");
        assert_eq!(value["data"]["view"]["pages"][0]["fields"][0]["value"], "*No topic*");

        let (_, value) = post_json(
            router,
            "/v1/events/message",
            &serde_json::json!({
                "author_id": "user",
                "channel": channel_json("1", "text", Some("welcome")),
                "content": "good morning",
            }),
        )
        .await;
        assert!(value["data"].is_null());

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn snapshot_without_reachable_paste_host_returns_null_url() {
        let db_path = unique_temp_db_path();
        let platform = FakePlatform::with_channels([guild_channel("1", "general", Some("x"))]);
        let router = app(test_state(db_path.clone(), platform));

        let _ = post_json(
            router.clone(),
            "/v1/events/channel-create",
            &serde_json::json!({"channel": channel_json("1", "text", Some("x"))}),
        )
        .await;
        let (status, value) = post_json(
            router,
            "/v1/snapshots",
            &serde_json::json!({"requester_id": "user", "channel_id": "1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(value["data"]["url"].is_null());

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn store_failures_surface_as_server_errors() {
        let db_path = std::env::temp_dir()
            .join(format!("topic-log-missing-{}", ulid::Ulid::new()))
            .join("topics.sqlite3");
        let router = app(test_state(db_path, FakePlatform::default()));

        let (status, value) = post_json(
            router.clone(),
            "/v1/events/channel-create",
            &serde_json::json!({"channel": channel_json("1", "text", Some("x"))}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert!(value["error"].as_str().is_some_and(|error| error.contains("failed to open")));

        let (status, _) = post_json(
            router,
            "/v1/events/message",
            &serde_json::json!({
                "author_id": "user",
                "channel": channel_json("1", "text", Some("x")),
                "content": "!topics",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn stats_endpoint_counts_channels_and_open_records() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), FakePlatform::default()));

        for (id, topic) in [("1", "hello"), ("1", "world"), ("2", "other")] {
            let (status, _) = post_json(
                router.clone(),
                "/v1/events/channel-create",
                &serde_json::json!({"channel": channel_json(id, "text", Some(topic))}),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/stats")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(value["data"]["channels"], 2);
        assert_eq!(value["data"]["records"], 3);
        assert_eq!(value["data"]["open_records"], 2);

        let _ = std::fs::remove_file(&db_path);
    }
}
