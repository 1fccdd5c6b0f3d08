use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use guildnet_db::DbManager;
use guildnet_kvstore::KvStore;
use kube::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::mesh::MeshDialer;

pub const DEFAULT_RDB_PING_INTERVAL: Duration = Duration::from_secs(5);
const ENSURE_RDB_ATTEMPTS: usize = 5;
const ENSURE_RDB_BASE_DELAY: Duration = Duration::from_millis(100);
const MONITOR_RECONNECT_ATTEMPTS: usize = 3;
const MONITOR_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(200);

pub type DialError = guildnet_db::Error;
/// Captured once at Instance construction time — never re-read from a
/// global — so a test overriding the dialer for one Instance never races
/// with a monitor loop started by a previous test's Instance.
pub type DbDialer = Arc<
    dyn Fn(String, String, String) -> Pin<Box<dyn Future<Output = Result<DbManager, DialError>> + Send>>
        + Send
        + Sync,
>;

pub const KV_BUCKETS: &[&str] = &[
    "settings",
    "cluster-settings",
    "credentials",
    "jobs",
    "joblogs",
    "audit",
];

/// The per-cluster bundle of resources (§4.5): a normalized-ID keyed
/// Kubernetes client, local KV store, optional mesh connector, and a lazily
/// connected, monitored database manager.
pub struct Instance {
    pub id: String,
    pub client: Client,
    pub kv: KvStore,
    pub mesh: Option<Arc<dyn MeshDialer>>,
    rdb: Mutex<Option<Arc<DbManager>>>,
    dialer: DbDialer,
    ping_interval: Duration,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    monitor_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Instance {
    pub fn new(
        id: String,
        client: Client,
        kv: KvStore,
        mesh: Option<Arc<dyn MeshDialer>>,
        dialer: DbDialer,
        ping_interval: Duration,
    ) -> Self {
        Self {
            id,
            client,
            kv,
            mesh,
            rdb: Mutex::new(None),
            dialer,
            ping_interval,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Records the [`tokio::task::JoinHandle`] for the task driving
    /// [`Instance::run_monitor`], so [`Instance::close`] can wait for it to
    /// actually exit instead of merely signalling cancellation.
    pub async fn set_monitor_handle(&self, handle: tokio::task::JoinHandle<()>) {
        *self.monitor_handle.lock().await = Some(handle);
    }

    pub async fn rdb(&self) -> Option<Arc<DbManager>> {
        self.rdb.lock().await.clone()
    }

    /// Lazy, idempotent RDB connection. Retries up to 5 attempts with
    /// exponential backoff (100ms, 200ms, 400ms, 800ms, 1600ms). Returns
    /// immediately if already connected.
    pub async fn ensure_rdb(&self, addr: &str, user: &str, pass: &str) -> Result<(), DialError> {
        let mut guard = self.rdb.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let dialer = self.dialer.clone();
        let (addr, user, pass) = (addr.to_string(), user.to_string(), pass.to_string());
        let manager = (move || {
            let dialer = dialer.clone();
            let (addr, user, pass) = (addr.clone(), user.clone(), pass.clone());
            async move { (dialer)(addr, user, pass).await }
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(ENSURE_RDB_BASE_DELAY)
                .with_factor(2.0)
                .with_max_times(ENSURE_RDB_ATTEMPTS),
        )
        .await?;

        info!(msg = "connected to database", cluster = %self.id);
        *guard = Some(Arc::new(manager));
        Ok(())
    }

    /// Background health-check loop: owns the Instance's cancellation
    /// token, so `Close` stops it deterministically.
    pub async fn run_monitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ping_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(msg = "monitor exiting on cancellation", cluster = %self.id);
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let current = self.rdb().await;
        match current {
            None => {
                if let Err(e) = self.ensure_rdb("", "", "").await {
                    trace!(msg = "rdb not yet available", cluster = %self.id, error = %e);
                }
            }
            Some(rdb) => {
                if let Err(e) = rdb.ping().await {
                    if e.class() == guildnet_db::ErrorClass::Transient {
                        self.reconnect().await;
                    } else {
                        warn!(msg = "rdb ping failed (non-transient)", cluster = %self.id, error = %e);
                    }
                }
            }
        }
    }

    async fn reconnect(&self) {
        let dialer = self.dialer.clone();
        let result = (move || {
            let dialer = dialer.clone();
            async move { (dialer)(String::new(), String::new(), String::new()).await }
        })
        .retry(
            backon::ConstantBuilder::default()
                .with_delay(MONITOR_RECONNECT_BASE_DELAY)
                .with_max_times(MONITOR_RECONNECT_ATTEMPTS),
        )
        .await;

        match result {
            Ok(manager) => {
                let mut guard = self.rdb.lock().await;
                if let Some(old) = guard.take() {
                    let _ = old.close().await;
                }
                *guard = Some(Arc::new(manager));
                info!(msg = "reconnected to database", cluster = %self.id);
            }
            Err(e) => {
                warn!(msg = "database reconnect failed", cluster = %self.id, error = %e);
            }
        }
    }

    /// Cancel background work, close the DB and the local KV store. Waits
    /// for the monitor task to actually exit before returning. Safe to call
    /// once; the Registry guarantees it is only invoked once per id.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(msg = "monitor task panicked during close", cluster = %self.id, error = %e);
            }
        }
        if let Some(rdb) = self.rdb.lock().await.take() {
            let _ = rdb.close().await;
        }
        let _ = self.kv.close().await;
    }
}
