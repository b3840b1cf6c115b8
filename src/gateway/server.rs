//! Gateway server: wiring and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::auth::{AuthGate, AuthResolver};
use crate::config::Config;
use crate::connection::{ConnectionManager, DefaultConnector, TransportConnector};
use crate::credentials::{
    CredentialInjector, HttpTokenExchanger, OAuthRefresher, PlatformSigner, TokenExchanger,
};
use crate::routing::ToolRouter;
use crate::scheduler::{LogSink, TriggerRegistry};
use crate::search::ToolSearch;
use crate::store::{CredentialStore, MemoryStore};
use crate::transform::TransformPipeline;
use crate::{Error, Result};

/// The hub gateway
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    gate: Arc<AuthGate>,
}

impl Gateway {
    /// Build from config with the real transports and token endpoint client
    pub async fn new(config: Config) -> Result<Self> {
        let connector = Arc::new(DefaultConnector::new(config.connection.connect_timeout));
        let exchanger = Arc::new(HttpTokenExchanger::new(config.oauth.http_timeout)?);
        Self::with_parts(config, connector, exchanger)
    }

    /// Build with caller-supplied backend connector and token exchanger
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn TransportConnector>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn CredentialStore> =
            Arc::new(MemoryStore::from_seed(config.store.clone())?);

        let connections = Arc::new(ConnectionManager::new(&config.connection, connector));

        let refresher = OAuthRefresher::new(
            Arc::clone(&store),
            exchanger,
            config.oauth.refresh_margin,
        );
        let platform = PlatformSigner::from_config(&config.oauth);
        if platform.is_none() {
            info!("No platform secret configured, platform-token backends will be refused");
        }
        let injector = Arc::new(CredentialInjector::new(
            Arc::clone(&store),
            refresher,
            platform,
        ));

        let search = Arc::new(ToolSearch::from_config(&config.tool_search)?);
        let router = Arc::new(ToolRouter::new(
            Arc::clone(&store),
            Arc::clone(&connections),
            injector,
            search,
            config.catalog.cache_ttl,
            config.server.call_timeout,
        ));

        let transform = Arc::new(
            TransformPipeline::from_config(&config.transform)
                .map_err(|e| Error::Config(e.to_string()))?,
        );

        let resolver = Arc::new(AuthResolver::new(config.auth.clone(), Arc::clone(&store)));
        let gate = Arc::new(AuthGate::new(
            resolver,
            config.auth.rate_limit,
            config.auth.public_paths.clone(),
        ));

        let state = Arc::new(AppState {
            router,
            transform,
            triggers: Arc::new(TriggerRegistry::new()),
            connections,
            store,
            base_url: config.server.base_url(),
        });

        Ok(Self {
            config,
            state,
            gate,
        })
    }

    /// The HTTP application
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(
            Arc::clone(&self.state),
            Arc::clone(&self.gate),
            self.config.server.max_body_size,
        )
    }

    /// Shared state
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until SIGINT/SIGTERM, then drain
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {e}")))?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let listener = TcpListener::bind(addr).await?;
        let app = self.router();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            base_url = %self.state.base_url,
            backends = self.config.store.backends.len(),
            endpoints = self.config.store.endpoints.len(),
            issuers = self.config.auth.issuers.len(),
            "MCP hub listening"
        );

        let sweeper = self
            .state
            .connections
            .spawn_idle_sweeper(shutdown_tx.subscribe());

        let trigger_loop = if self.config.scheduler.enabled {
            Some(self.state.triggers.spawn(
                self.config.scheduler.poll_interval,
                Arc::new(LogSink),
                shutdown_tx.subscribe(),
            ))
        } else {
            info!("Scheduler disabled, triggers are stored but never fire");
            None
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let drain = async {
            let _ = sweeper.await;
            if let Some(handle) = trigger_loop {
                let _ = handle.await;
            }
            self.state.connections.close_all().await;
        };
        if tokio::time::timeout(self.config.server.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.server.shutdown_timeout.as_millis(),
                "Shutdown drain timed out"
            );
        }

        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM, then broadcast shutdown
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
