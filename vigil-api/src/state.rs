//! Shared application state.
//!
//! [`AppState`] wires the stores, the bus and the services together once at
//! startup. [`AppState::start_background_tasks`] spawns the long-running
//! loops that keep user state in sync.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_events::{EventBus, KeyValueStore};

use crate::config::AppConfig;
use crate::db::{NotificationStore, UserStore};
use crate::error::ApiResult;
use crate::poller::{run_marker_janitor, Poller};
use crate::stream::NotificationStreamer;
use crate::userinfo::{run_change_subscriber, UserInfoRetriever};

/// Application-wide state shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub user_store: Arc<dyn UserStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub bus: Arc<dyn EventBus>,
    pub kv: Arc<dyn KeyValueStore>,
    pub retriever: Arc<UserInfoRetriever>,
    pub streamer: NotificationStreamer,
    pub start_time: Instant,
}

impl AppState {
    /// Validate `config` and build every service on top of the given
    /// collaborators.
    pub fn build(
        config: AppConfig,
        user_store: Arc<dyn UserStore>,
        notifications: Arc<dyn NotificationStore>,
        bus: Arc<dyn EventBus>,
        kv: Arc<dyn KeyValueStore>,
    ) -> ApiResult<Self> {
        config.validate()?;
        config
            .auth
            .validate_for_environment(&config.telemetry.environment)?;

        let retriever = Arc::new(UserInfoRetriever::new(
            user_store.clone(),
            &config.userinfo,
            &config.cache,
        )?);
        let streamer = NotificationStreamer::new(
            retriever.clone(),
            notifications.clone(),
            bus.clone(),
            config.auth.clone(),
            config.stream.clone(),
        );

        Ok(Self {
            config,
            user_store,
            notifications,
            bus,
            kv,
            retriever,
            streamer,
            start_time: Instant::now(),
        })
    }

    /// Spawn the poller and the change subscriber, plus the cache and dedup
    /// marker janitors unless their interval is zero.
    pub fn start_background_tasks(&self, shutdown: CancellationToken) -> ApiResult<BackgroundTasks> {
        let poller = Poller::new(
            self.user_store.clone(),
            self.bus.clone(),
            self.kv.clone(),
            self.config.poller.clone(),
        )?;

        let mut handles = vec![
            ("poller", tokio::spawn(poller.run(shutdown.clone()))),
            (
                "change_subscriber",
                tokio::spawn(run_change_subscriber(
                    self.retriever.clone(),
                    self.bus.clone(),
                    self.config.userinfo.clone(),
                    shutdown.clone(),
                )),
            ),
        ];

        if let Some(janitor) = self
            .retriever
            .cache()
            .start_janitor(self.config.cache.janitor_interval, shutdown.clone())
        {
            handles.push(("cache_janitor", janitor));
        }

        let sweep = self.config.poller.marker_sweep_interval;
        if !sweep.is_zero() {
            handles.push((
                "marker_janitor",
                tokio::spawn(run_marker_janitor(self.kv.clone(), sweep, shutdown)),
            ));
        }

        info!(tasks = handles.len(), "Background tasks started");
        Ok(BackgroundTasks { handles })
    }
}

/// Handles of the spawned background loops.
pub struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task to finish. Call after cancelling the shutdown token.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task panicked");
            }
        }
        info!("Background tasks stopped");
    }
}
