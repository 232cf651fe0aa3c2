//! # Realtime Sync Manager
//!
//! Keeps a change-feed subscription alive and hands every notification to a
//! [`ChangeHandler`], which re-merges just the affected entity (or its whole
//! collection when the notification names no id).
//!
//! ## Subscription Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌──────┐ subscribe() ┌────────────┐  connected  ┌────────────┐         │
//! │  │ Idle │ ──────────► │ Connecting │ ──────────► │ Subscribed │ ◄──┐    │
//! │  └──────┘             └─────┬──────┘             └─────┬──────┘    │    │
//! │     ▲                       │ failed            closed │ │ error   │    │
//! │     │                       ▼                          ▼ ▼         │    │
//! │     │                 ┌────────────┐          ┌──────────────┐     │    │
//! │     │                 │   Error    │          │ Disconnected │     │    │
//! │     │                 └─────┬──────┘          └──────┬───────┘     │    │
//! │     │                       │     backoff elapsed    │             │    │
//! │     │                       └──────────┬─────────────┘             │    │
//! │     │                                  ▼                           │    │
//! │     │                           ┌──────────────┐   connected       │    │
//! │     │                           │ Reconnecting │ ──────────────────┘    │
//! │     │                           └──────────────┘                        │
//! │     │                                                                   │
//! │     └──────────────── unsubscribe() / handle dropped ─────────────────  │
//! │                                                                         │
//! │  Reconnects forever; the delay doubles from `initial_backoff` up to     │
//! │  `max_backoff` and resets after every successful connect.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod ws;

pub use ws::WsChangeFeed;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use inventra_core::{EntityKind, EntityRef};

// =============================================================================
// State & Events
// =============================================================================

/// Realtime subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RealtimeState {
    Idle,
    Connecting,
    Subscribed,
    Error,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for RealtimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RealtimeState::Idle => "idle",
            RealtimeState::Connecting => "connecting",
            RealtimeState::Subscribed => "subscribed",
            RealtimeState::Error => "error",
            RealtimeState::Disconnected => "disconnected",
            RealtimeState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// One entity-change event from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChangeNotification {
    /// Remote collection name, e.g. `"products"`.
    #[serde(alias = "table")]
    pub collection: String,
    #[serde(default, alias = "id")]
    pub entity_id: Option<String>,
    #[serde(default, alias = "commit_timestamp")]
    #[ts(type = "string | null")]
    pub changed_at: Option<DateTime<Utc>>,
}

impl ChangeNotification {
    pub fn new(kind: EntityKind) -> Self {
        ChangeNotification {
            collection: kind.collection().to_string(),
            entity_id: None,
            changed_at: None,
        }
    }

    /// Notification for one changed row.
    pub fn for_entity(kind: EntityKind, id: impl Into<String>) -> Self {
        ChangeNotification {
            entity_id: Some(id.into()),
            ..Self::new(kind)
        }
    }

    /// The entity kind, if the collection is one the engine syncs.
    pub fn kind(&self) -> Option<EntityKind> {
        EntityKind::from_collection(&self.collection)
    }

    /// The changed row, when the notification names one.
    pub fn target(&self) -> Option<EntityRef> {
        let id = self.entity_id.as_deref().filter(|id| !id.is_empty())?;
        Some(EntityRef::new(self.kind()?, id))
    }
}

// =============================================================================
// Feed Traits
// =============================================================================

/// Source of change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn connect(&self) -> SyncResult<Box<dyn ChangeStream>>;
}

/// One live connection to a [`ChangeFeed`].
#[async_trait]
pub trait ChangeStream: Send {
    /// Next notification; `None` once the connection closed cleanly.
    async fn next(&mut self) -> Option<SyncResult<ChangeNotification>>;
}

/// Receives notifications while subscribed.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(&self, notification: &ChangeNotification) -> SyncResult<()>;
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        RealtimeOptions {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RealtimeOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        RealtimeOptions {
            connect_timeout: Duration::from_secs(config.realtime.connect_timeout_secs),
            initial_backoff: Duration::from_millis(config.realtime.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.realtime.max_backoff_secs),
        }
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// A live subscription. Dropping it also tears the subscription down.
pub struct Subscription {
    state: watch::Receiver<RealtimeState>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn state(&self) -> RealtimeState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<RealtimeState> {
        self.state.clone()
    }

    /// Stops the subscription and waits for it to wind down to `Idle`.
    pub async fn unsubscribe(self) -> SyncResult<()> {
        // The task may already be gone; a closed channel is fine.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("realtime task failed: {e}")))
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Drives a [`ChangeFeed`] into a [`ChangeHandler`].
#[derive(Clone)]
pub struct RealtimeManager {
    feed: Arc<dyn ChangeFeed>,
    handler: Arc<dyn ChangeHandler>,
    options: RealtimeOptions,
}

enum StreamEnd {
    Shutdown,
    Closed,
    Failed(SyncError),
}

impl RealtimeManager {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        handler: Arc<dyn ChangeHandler>,
        options: RealtimeOptions,
    ) -> Self {
        RealtimeManager {
            feed,
            handler,
            options,
        }
    }

    /// Starts the subscription in a background task.
    pub fn subscribe(&self) -> Subscription {
        let (state_tx, state_rx) = watch::channel(RealtimeState::Idle);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(self.clone().run(state_tx, shutdown_rx));

        Subscription {
            state: state_rx,
            shutdown_tx,
            task,
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.options.initial_backoff,
            initial_interval: self.options.initial_backoff,
            max_interval: self.options.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    async fn run(self, state: watch::Sender<RealtimeState>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Realtime subscription starting");

        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            state.send_replace(if attempt == 0 {
                RealtimeState::Connecting
            } else {
                RealtimeState::Reconnecting
            });
            attempt += 1;

            let connected = tokio::select! {
                result = timeout(self.options.connect_timeout, self.feed.connect()) => result,
                _ = shutdown_rx.recv() => break,
            };

            let next = match connected {
                Ok(Ok(stream)) => {
                    info!(attempt, "Realtime feed subscribed");
                    state.send_replace(RealtimeState::Subscribed);
                    backoff.reset();

                    match self.pump(stream, &mut shutdown_rx).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Closed => {
                            info!("Realtime feed closed");
                            RealtimeState::Disconnected
                        }
                        StreamEnd::Failed(e) => {
                            warn!(error = %e, "Realtime feed failed");
                            RealtimeState::Error
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, attempt, "Realtime connect failed");
                    RealtimeState::Error
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.options.connect_timeout.as_secs(),
                        "Realtime connect timed out"
                    );
                    RealtimeState::Error
                }
            };
            state.send_replace(next);

            let delay = backoff.next_backoff().unwrap_or(self.options.max_backoff);
            debug!(?delay, attempt, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        state.send_replace(RealtimeState::Idle);
        info!("Realtime subscription stopped");
    }

    async fn pump(
        &self,
        mut stream: Box<dyn ChangeStream>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> StreamEnd {
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown_rx.recv() => return StreamEnd::Shutdown,
            };

            match item {
                Some(Ok(notification)) => {
                    debug!(collection = %notification.collection, "Change notification");
                    if let Err(e) = self.handler.on_change(&notification).await {
                        warn!(
                            collection = %notification.collection,
                            error = %e,
                            "Change handler failed"
                        );
                    }
                }
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Closed,
            }
        }
    }
}
