use crate::error::{EngineError, MarkReadError, PollError, RemoteWriteError};
use crate::scheduler::{self, ScheduleConfig, SchedulerHandle};
use crate::store::StoreChange;
use crate::synchronizer::{PollReport, SyncSettings, Synchronizer};
use crate::writes::MarkReadOutcome;
use klapp_client::RemoteClient;
use klapp_core::{Credentials, MessageSnapshot, PendingWrite};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub backoff_cap_factor: u32,
    pub removal_grace_polls: u32,
    pub max_write_attempts: u32,
    pub refresh_after_write: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            backoff_cap_factor: 4,
            removal_grace_polls: 0,
            max_write_attempts: 3,
            refresh_after_write: true,
        }
    }
}

/// Keeps a local mirror of the KLAPP inbox in sync and exposes it to consumers.
///
/// Consumers read [`KlappEngine::snapshot`] or subscribe; they never block on
/// the backend.
pub struct KlappEngine {
    sync: Arc<Synchronizer>,
    config: EngineConfig,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl KlappEngine {
    pub fn new(client: Arc<dyn RemoteClient>, credentials: Credentials, config: EngineConfig) -> Self {
        let settings = SyncSettings {
            request_timeout: config.request_timeout,
            removal_grace_polls: config.removal_grace_polls,
            max_write_attempts: config.max_write_attempts,
            refresh_after_write: config.refresh_after_write,
        };

        Self {
            sync: Arc::new(Synchronizer::new(client, credentials, settings)),
            config,
            scheduler: Mutex::new(None),
        }
    }

    /// Starts periodic polling. The first poll runs immediately.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        *scheduler = Some(scheduler::spawn(
            self.sync.clone(),
            ScheduleConfig {
                interval: self.config.poll_interval,
                backoff_cap_factor: self.config.backoff_cap_factor,
            },
        ));
        Ok(())
    }

    /// Stops polling after any in-flight poll completes.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let handle = self
            .scheduler
            .lock()
            .await
            .take()
            .ok_or(EngineError::NotRunning)?;
        handle.stop().await;
        info!("engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    pub fn snapshot(&self) -> Arc<MessageSnapshot> {
        self.sync.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MessageSnapshot>> {
        self.sync.store.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.sync.store.subscribe_changes()
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<MarkReadOutcome, MarkReadError> {
        self.sync.mark_as_read(id).await
    }

    /// Marks every currently unread message read. Returns how many changed.
    pub async fn mark_all_read(&self) -> Result<usize, RemoteWriteError> {
        self.sync.mark_all_read().await
    }

    /// Polls right now, outside the schedule.
    pub async fn refresh_now(&self) -> Result<PollReport, PollError> {
        self.sync.poll_once().await
    }

    /// Asks the running scheduler for an extra poll without waiting for it.
    pub fn request_refresh(&self) {
        self.sync.refresh.notify_one();
    }

    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.sync.pending.list()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.sync.session.is_authenticated().await
    }
}
