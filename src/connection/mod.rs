//! Connection manager: establish, pool, retry and tear down backend connections

mod pool;
mod retry;

pub use pool::{ArenaPool, Checkout, ConnectionPool, PoolKey, PoolLimits, PoolStats, SlotId};
pub use retry::{RetryPolicy, with_retry};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::protocol::JsonRpcResponse;
use crate::store::{BackendServer, TransportDescriptor};
use crate::transport::{HttpMode, HttpTransport, OutboundHeaders, StdioTransport, Transport};
use crate::{Error, Result};

/// Opens a live, initialized connection to a backend
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect and run the MCP handshake.
    ///
    /// Implementations bound each transport attempt themselves; the caller
    /// bounds the whole request.
    async fn connect(
        &self,
        backend: &BackendServer,
        headers: &OutboundHeaders,
    ) -> Result<Arc<dyn Transport>>;
}

/// Connector for the real transports.
///
/// Every transport attempt (including the SSE fallback) gets its own
/// `connect_timeout` budget for connect plus handshake.
pub struct DefaultConnector {
    connect_timeout: Duration,
}

impl DefaultConnector {
    /// Connector bounding each transport attempt by `connect_timeout`
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn bounded<F>(&self, backend: &BackendServer, kind: &str, attempt: F) -> Result<Arc<dyn Transport>>
    where
        F: Future<Output = Result<Arc<dyn Transport>>>,
    {
        tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "{kind} connect to backend {} exceeded {}ms",
                    backend.id,
                    self.connect_timeout.as_millis()
                )))
            })
    }

    async fn http(
        &self,
        backend: &BackendServer,
        url: &str,
        mode: HttpMode,
        headers: &OutboundHeaders,
    ) -> Result<Arc<dyn Transport>> {
        self.bounded(backend, mode.as_str(), async {
            let transport = HttpTransport::new(&backend.id, url, mode, headers.clone(), self.connect_timeout)?;
            transport.initialize().await?;
            Ok::<Arc<dyn Transport>, Error>(transport)
        })
        .await
    }
}

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn connect(
        &self,
        backend: &BackendServer,
        headers: &OutboundHeaders,
    ) -> Result<Arc<dyn Transport>> {
        match &backend.transport {
            TransportDescriptor::StreamableHttp { url } => {
                match self.http(backend, url, HttpMode::Streamable, headers).await {
                    Err(e @ (Error::BackendUnreachable { .. } | Error::BackendProtocol { .. } | Error::Timeout(_))) => {
                        // Older servers only speak SSE on the same URL
                        info!(backend = %backend.id, error = ?e, "Streamable HTTP connect failed, trying SSE");
                        self.http(backend, url, HttpMode::Sse, headers).await
                    }
                    other => other,
                }
            }
            TransportDescriptor::Sse { url } => self.http(backend, url, HttpMode::Sse, headers).await,
            TransportDescriptor::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                self.bounded(backend, "stdio", async {
                    let transport =
                        StdioTransport::spawn(&backend.id, command, args, env, cwd.as_deref()).await?;
                    Ok::<Arc<dyn Transport>, Error>(transport)
                })
                .await
            }
        }
    }
}

/// A connection checked out of the pool.
///
/// Dropping it returns the connection for reuse. After a failed call use
/// [`PooledConnection::discard`] instead so the connection is never reused.
pub struct PooledConnection {
    pool: Arc<dyn ConnectionPool>,
    slot: SlotId,
    transport: Arc<dyn Transport>,
    released: bool,
}

impl PooledConnection {
    /// Transport kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.transport.kind()
    }

    /// Send a request over the connection
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &OutboundHeaders,
    ) -> Result<JsonRpcResponse> {
        self.transport.request(method, params, headers).await
    }

    /// Stop reusing the connection after a failed call.
    ///
    /// Closes it now when this caller is its only holder; otherwise the
    /// slot is poisoned and closes when the last sibling returns it.
    pub async fn discard(mut self) {
        self.released = true;
        if let Some(transport) = self.pool.discard(self.slot) {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Close after discard failed");
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(transport) = self.pool.check_in(self.slot) else {
            return;
        };
        // Last holder of a poisoned slot
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "Close of poisoned connection failed");
                }
            });
        }
    }
}

/// Abandons a reserved slot unless the connect completed
struct Reservation<'a> {
    pool: &'a dyn ConnectionPool,
    slot: Option<SlotId>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.abandon(slot);
        }
    }
}

/// Owns every pooled backend connection
pub struct ConnectionManager {
    pool: Arc<dyn ConnectionPool>,
    connector: Arc<dyn TransportConnector>,
    retry: RetryPolicy,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl ConnectionManager {
    /// Manager over an [`ArenaPool`] sized from config
    #[must_use]
    pub fn new(config: &ConnectionConfig, connector: Arc<dyn TransportConnector>) -> Self {
        let pool = Arc::new(ArenaPool::new(PoolLimits {
            max_per_session: config.max_per_session,
            max_per_backend: config.max_per_backend,
            max_callers_per_connection: config.max_callers_per_connection,
        }));
        Self::with_pool(config, pool, connector)
    }

    /// Manager over a caller-supplied pool
    #[must_use]
    pub fn with_pool(
        config: &ConnectionConfig,
        pool: Arc<dyn ConnectionPool>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            pool,
            connector,
            retry: RetryPolicy::new(config),
            idle_timeout: config.idle_timeout,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Check out a connection for `(user session, backend)`.
    ///
    /// Shares a pooled connection when one has caller capacity, otherwise
    /// connects (with retry) into a reserved slot. A full pool fails at once
    /// with [`Error::CapacityExceeded`]. Dropping the future mid-connect
    /// releases the reserved slot.
    pub async fn acquire(
        &self,
        user_id: &str,
        session_id: &str,
        backend: &BackendServer,
        headers: &OutboundHeaders,
    ) -> Result<PooledConnection> {
        let key = PoolKey::new(user_id, session_id, &backend.id);
        let slot = match self.pool.try_checkout(&key)? {
            Checkout::Shared { slot, transport } => {
                debug!(backend = %backend.id, "Reusing pooled connection");
                return Ok(self.lease(slot, transport));
            }
            Checkout::Reserved { slot } => slot,
        };

        let mut reservation = Reservation {
            pool: self.pool.as_ref(),
            slot: Some(slot),
        };
        let transport = self.connect(backend, headers).await?;
        reservation.slot = None;
        self.pool.install(slot, Arc::clone(&transport));
        debug!(backend = %backend.id, kind = transport.kind(), "Connection established");
        Ok(self.lease(slot, transport))
    }

    fn lease(&self, slot: SlotId, transport: Arc<dyn Transport>) -> PooledConnection {
        PooledConnection {
            pool: Arc::clone(&self.pool),
            slot,
            transport,
            released: false,
        }
    }

    /// Connect, retried while the backend is unreachable
    async fn connect(
        &self,
        backend: &BackendServer,
        headers: &OutboundHeaders,
    ) -> Result<Arc<dyn Transport>> {
        with_retry(self.retry, &backend.id, move || self.connector.connect(backend, headers)).await
    }

    /// Close idle connections. Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        // take_idle releases the pool lock before anything is awaited
        let idle = self.pool.take_idle(self.idle_timeout);
        let count = idle.len();
        close_all_transports(idle).await;
        if count > 0 {
            debug!(closed = count, "Swept idle connections");
        }
        count
    }

    /// Run [`Self::sweep_idle`] periodically until shutdown
    pub fn spawn_idle_sweeper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sweep_idle().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Idle sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Close every pooled connection
    pub async fn close_all(&self) {
        let all = self.pool.drain();
        info!(count = all.len(), "Closing pooled connections");
        close_all_transports(all).await;
    }

    /// Pool occupancy
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

async fn close_all_transports(transports: Vec<Arc<dyn Transport>>) {
    let results = join_all(transports.iter().map(|t| t.close())).await;
    for err in results.into_iter().filter_map(Result::err) {
        warn!(error = %err, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BackendAuth, BackendStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fake(AtomicBool);

    #[async_trait]
    impl Transport for Fake {
        async fn request(
            &self,
            _method: &str,
            _params: Option<Value>,
            _headers: &OutboundHeaders,
        ) -> Result<JsonRpcResponse> {
            Err(Error::Internal("unused".into()))
        }
        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
        fn kind(&self) -> &'static str {
            "fake"
        }
        async fn close(&self) -> Result<()> {
            self.0.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails the first `failures` connects with the given error kind
    struct FlakyConnector {
        failures: usize,
        timeout: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransportConnector for FlakyConnector {
        async fn connect(
            &self,
            backend: &BackendServer,
            _headers: &OutboundHeaders,
        ) -> Result<Arc<dyn Transport>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.timeout {
                    return Err(Error::Timeout(format!("connect to {} exceeded 50ms", backend.id)));
                }
                return Err(Error::unreachable(&backend.id, "refused"));
            }
            Ok(Arc::new(Fake(AtomicBool::new(true))))
        }
    }

    fn backend() -> BackendServer {
        BackendServer {
            id: "srv".into(),
            name: "srv".into(),
            transport: TransportDescriptor::Sse {
                url: "http://localhost:1/sse".into(),
            },
            auth: BackendAuth::None,
            status: BackendStatus::Running,
            deleted: false,
            tool_search: false,
            template_id: None,
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(50),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(1),
            max_per_session: 1,
            max_per_backend: 8,
            max_callers_per_connection: 1,
            ..ConnectionConfig::default()
        }
    }

    fn manager(failures: usize, timeout: bool) -> (ConnectionManager, Arc<FlakyConnector>) {
        let connector = Arc::new(FlakyConnector {
            failures,
            timeout,
            calls: AtomicUsize::new(0),
        });
        (ConnectionManager::new(&config(), connector.clone()), connector)
    }

    #[tokio::test]
    async fn unreachable_connect_is_retried() {
        let (manager, connector) = manager(2, false);
        let conn = manager
            .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
            .await
            .unwrap();
        assert_eq!(conn.kind(), "fake");
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_is_not_retried_and_frees_the_slot() {
        let (manager, connector) = manager(1, true);
        let err = manager
            .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().slots, 0);
    }

    #[tokio::test]
    async fn drop_returns_and_discard_removes() {
        let (manager, _) = manager(0, false);
        let conn = manager
            .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
            .await
            .unwrap();

        // Session holds its one slot; a second concurrent caller is rejected
        let second = manager
            .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
            .await;
        assert!(matches!(second, Err(Error::CapacityExceeded(_))));

        drop(conn);
        assert_eq!(manager.stats().idle, 1);

        let conn = manager
            .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
            .await
            .unwrap();
        conn.discard().await;
        assert_eq!(manager.stats().slots, 0);
    }

    /// Never finishes connecting
    struct HangingConnector;

    #[async_trait]
    impl TransportConnector for HangingConnector {
        async fn connect(
            &self,
            _backend: &BackendServer,
            _headers: &OutboundHeaders,
        ) -> Result<Arc<dyn Transport>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn abandoned_connect_frees_the_slot() {
        let manager = ConnectionManager::new(&config(), Arc::new(HangingConnector));
        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            manager.acquire("u1", "s1", &backend(), &OutboundHeaders::new()),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(manager.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn sibling_keeps_a_connection_another_caller_discarded() {
        let config = ConnectionConfig {
            max_callers_per_connection: 2,
            ..config()
        };
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            timeout: false,
            calls: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(&config, connector.clone());
        let headers = OutboundHeaders::new();

        let failing = manager.acquire("u1", "s1", &backend(), &headers).await.unwrap();
        let sibling = manager.acquire("u1", "s1", &backend(), &headers).await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        failing.discard().await;
        assert!(sibling.transport.is_connected());
        assert_eq!(manager.stats().active_callers, 1);

        drop(sibling);
        assert_eq!(manager.stats(), PoolStats::default());
    }

    /// Pool that never has room
    struct FullPool;

    impl ConnectionPool for FullPool {
        fn try_checkout(&self, key: &PoolKey) -> Result<Checkout> {
            Err(Error::CapacityExceeded(format!("no slot for {}", key.backend_id)))
        }
        fn install(&self, _slot: SlotId, _transport: Arc<dyn Transport>) {}
        fn abandon(&self, _slot: SlotId) {}
        fn check_in(&self, _slot: SlotId) -> Option<Arc<dyn Transport>> {
            None
        }
        fn discard(&self, _slot: SlotId) -> Option<Arc<dyn Transport>> {
            None
        }
        fn take_idle(&self, _idle_for: Duration) -> Vec<Arc<dyn Transport>> {
            Vec::new()
        }
        fn drain(&self) -> Vec<Arc<dyn Transport>> {
            Vec::new()
        }
        fn stats(&self) -> PoolStats {
            PoolStats::default()
        }
    }

    #[tokio::test]
    async fn full_pool_fails_without_connecting() {
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            timeout: false,
            calls: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::with_pool(&config(), Arc::new(FullPool), connector.clone());
        let err = manager
            .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_all_empties_pool() {
        let (manager, _) = manager(0, false);
        drop(
            manager
                .acquire("u1", "s1", &backend(), &OutboundHeaders::new())
                .await
                .unwrap(),
        );
        manager.close_all().await;
        assert_eq!(manager.stats(), PoolStats::default());
    }
}
