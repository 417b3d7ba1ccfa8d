use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use topic_log_api::{ObserveOutcome, SeedSummary, TopicLogApi};
use topic_log_core::{ChannelId, ChannelInfo, TopicRecord};
use topic_log_store_sqlite::StoreStats;

/// Async front of [`TopicLogApi`].
///
/// Store calls run on the blocking pool. Tracker writes queue on one FIFO lock so events are
/// applied in arrival order; reads go straight through.
#[derive(Debug, Clone)]
pub struct TopicLogHandle {
    api: TopicLogApi,
    writer: Arc<Mutex<()>>,
}

async fn run_blocking<T, F>(api: &TopicLogApi, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&TopicLogApi) -> Result<T> + Send + 'static,
{
    let api = api.clone();
    match tokio::task::spawn_blocking(move || task(&api)).await {
        Ok(inner) => inner,
        Err(err) => Err(anyhow!("store task join error: {err}")),
    }
}

impl TopicLogHandle {
    #[must_use]
    pub fn new(api: TopicLogApi) -> Self {
        Self { api, writer: Arc::new(Mutex::new(())) }
    }

    /// # Errors
    /// Propagates store failures.
    pub async fn observe(&self, channel: ChannelInfo) -> Result<ObserveOutcome> {
        let _guard = self.writer.lock().await;
        run_blocking(&self.api, move |api| api.observe(&channel)).await
    }

    /// # Errors
    /// Propagates store failures.
    pub async fn observe_change_event(
        &self,
        old_topic: Option<String>,
        channel: ChannelInfo,
    ) -> Result<ObserveOutcome> {
        let _guard = self.writer.lock().await;
        run_blocking(&self.api, move |api| api.observe_change_event(old_topic.as_deref(), &channel))
            .await
    }

    /// # Errors
    /// Propagates the first store failure.
    pub async fn seed_channels(&self, channels: Vec<ChannelInfo>) -> Result<SeedSummary> {
        let _guard = self.writer.lock().await;
        run_blocking(&self.api, move |api| api.seed_channels(&channels)).await
    }

    /// # Errors
    /// Propagates store failures.
    pub async fn history(&self, channel_id: ChannelId) -> Result<Vec<TopicRecord>> {
        run_blocking(&self.api, move |api| api.history(&channel_id)).await
    }

    /// # Errors
    /// Propagates store failures.
    pub async fn stats(&self) -> Result<StoreStats> {
        run_blocking(&self.api, TopicLogApi::stats).await
    }
}
