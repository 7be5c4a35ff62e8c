use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::SingleflightCache;
use crate::config::Settings;
use crate::engine::BuildEngine;
use crate::params::Fingerprint;

/// Shared state for the web server: the build cache, the engine seam, the
/// per-observer stream knobs, and client-liveness bookkeeping.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SingleflightCache<Fingerprint, Value>>,
    pub engine: Arc<dyn BuildEngine>,
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub allowed_groups: Arc<Vec<String>>,
    client_timeout: Duration,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    last_heartbeat: Arc<Mutex<Instant>>,
    pending_shutdown: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn BuildEngine>,
        settings: &Settings,
        shutdown_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            cache: Arc::new(SingleflightCache::new()),
            engine,
            queue_capacity: settings.stream_progress_queue_capacity(),
            poll_interval: settings.stream_disconnect_poll_interval(),
            allowed_groups: Arc::new(settings.params_allowed_groups()),
            client_timeout: settings.web_client_timeout(),
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            pending_shutdown: Arc::new(Mutex::new(None)),
        }
    }

    pub fn keep_alive(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn is_dead(&self) -> bool {
        let elapsed: Duration = self.last_heartbeat.lock().unwrap().elapsed();
        if elapsed > self.client_timeout {
            log::debug!("no heartbeat");
            if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            true
        } else {
            false
        }
    }

    pub fn request_shutdown(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let handle = tokio::spawn(async move {
            // grace period to allow reloads
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(tx) = shutdown_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });

        *self.pending_shutdown.lock().unwrap() = Some(handle);
        log::debug!("shutdown requested, waiting...");
    }

    pub fn cancel_shutdown(&self) {
        if let Some(handle) = self.pending_shutdown.lock().unwrap().take() {
            handle.abort();
            log::debug!("shutdown cancelled");
        }
    }
}
