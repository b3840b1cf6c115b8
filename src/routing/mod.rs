//! Tool namespace routing: aggregate catalogs and dispatch calls

mod cache;

pub use cache::{CacheToken, CatalogCache, CatalogCacheStats};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gateway_core::NamespacedToolName;
use serde_json::{Value, json};
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, Span, debug, field, info_span, warn};

use crate::auth::{Principal, ensure_same_org};
use crate::connection::ConnectionManager;
use crate::credentials::CredentialInjector;
use crate::protocol::{Tool, ToolsListResult};
use crate::search::{ExecuteRequest, MetaTool, ToolSearch, call_result};
use crate::store::{BackendServer, ChildRef, CredentialStore, UnifiedEndpoint};
use crate::transport::into_result;
use crate::{Error, Result};

/// Upper bound on `tools/list` pages fetched from one backend
const MAX_LIST_PAGES: usize = 32;

/// Who is calling, from which session
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Authorized caller
    pub principal: Principal,
    /// Client session (pool partition)
    pub session_id: String,
    /// Request correlation id
    pub correlation_id: String,
}

/// Per-call execution context, recorded into a tracing span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Caller organization
    pub org_id: String,
    /// Caller user
    pub user_id: String,
    /// Target backend
    pub backend_id: String,
    /// Raw tool name
    pub tool_name: String,
    /// Correlation id
    pub correlation_id: String,
}

impl ExecutionContext {
    /// Span carrying every field; `transport` is recorded once connected
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!(
            "tool_call",
            org_id = %self.org_id,
            user_id = %self.user_id,
            backend_id = %self.backend_id,
            tool_name = %self.tool_name,
            transport = field::Empty,
            correlation_id = %self.correlation_id,
        )
    }
}

/// Routes namespaced tool traffic for unified endpoints
pub struct ToolRouter {
    store: Arc<dyn CredentialStore>,
    connections: Arc<ConnectionManager>,
    injector: Arc<CredentialInjector>,
    search: Arc<ToolSearch>,
    cache: CatalogCache,
    call_timeout: Duration,
}

impl ToolRouter {
    /// Router over its collaborators
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connections: Arc<ConnectionManager>,
        injector: Arc<CredentialInjector>,
        search: Arc<ToolSearch>,
        cache_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            connections,
            injector,
            search,
            cache: CatalogCache::new(cache_ttl),
            call_timeout,
        }
    }

    /// Catalog cache
    #[must_use]
    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    /// Drop cached catalogs involving a backend
    pub fn invalidate_backend(&self, backend_id: &str) {
        let dropped = self.cache.invalidate_backend(backend_id);
        debug!(backend = backend_id, dropped, "Invalidated catalog cache");
    }

    /// Endpoint owned by the caller's organization
    pub async fn endpoint(&self, endpoint_id: &str, principal: &Principal) -> Result<UnifiedEndpoint> {
        let endpoint = self
            .store
            .endpoint(endpoint_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("endpoint '{endpoint_id}'")))?;
        ensure_same_org(&principal.org_id, &endpoint.org_id)?;
        Ok(endpoint)
    }

    /// Aggregated, namespaced catalog of an endpoint as visible to the caller
    pub async fn aggregate(&self, endpoint_id: &str, ctx: &CallContext) -> Result<Vec<Tool>> {
        let endpoint = self.endpoint(endpoint_id, &ctx.principal).await?;

        let tools = match self.cache.endpoint(endpoint_id) {
            Some(tools) => tools,
            None => self.aggregate_uncached(&endpoint, ctx).await?,
        };

        Ok(tools
            .iter()
            .filter(|tool| {
                NamespacedToolName::parse(&tool.name)
                    .is_ok_and(|n| ctx.principal.can_use(n.backend_id(), n.tool_name()))
            })
            .cloned()
            .collect())
    }

    async fn aggregate_uncached(
        &self,
        endpoint: &UnifiedEndpoint,
        ctx: &CallContext,
    ) -> Result<Arc<Vec<Tool>>> {
        let token = self.cache.token();

        let mut active: Vec<(&ChildRef, BackendServer)> = Vec::new();
        for child in &endpoint.children {
            match self.store.backend(&child.backend_id).await? {
                Some(backend) if !backend.deleted => active.push((child, backend)),
                Some(_) => debug!(backend = %child.backend_id, "Skipping deleted child"),
                None => warn!(endpoint = %endpoint.id, backend = %child.backend_id, "Child references a missing backend"),
            }
        }

        let unhealthy: Vec<String> = active
            .iter()
            .filter(|(_, b)| b.status.is_unhealthy())
            .map(|(_, b)| b.id.clone())
            .collect();
        if !unhealthy.is_empty() {
            return Err(Error::BackendUnhealthy {
                backends: unhealthy,
            });
        }

        // Siblings run to completion even when one fails
        let results = join_all(
            active
                .iter()
                .map(|(child, backend)| self.child_tools(child, backend, ctx)),
        )
        .await;

        let mut tools = Vec::new();
        for result in results {
            tools.extend(result?);
        }
        let tools = Arc::new(tools);

        self.cache.insert_endpoint(
            token,
            &endpoint.id,
            active.iter().map(|(_, b)| b.id.clone()),
            Arc::clone(&tools),
        );
        debug!(endpoint = %endpoint.id, tools = tools.len(), children = active.len(), "Aggregated catalog");
        Ok(tools)
    }

    /// Namespaced tools one child contributes
    async fn child_tools(
        &self,
        child: &ChildRef,
        backend: &BackendServer,
        ctx: &CallContext,
    ) -> Result<Vec<Tool>> {
        let raw = if backend.tool_search {
            Arc::new(self.search.meta_tools())
        } else {
            self.backend_catalog(backend, ctx).await?
        };

        // Upstream names are third-party data: one bad name must not sink the list
        Ok(raw
            .iter()
            .filter_map(|tool| {
                match NamespacedToolName::new(&child.backend_id, &child.instance_name, &tool.name) {
                    Ok(name) => Some(tool.renamed(name.to_string())),
                    Err(e) => {
                        warn!(backend = %child.backend_id, tool = %tool.name, error = %e, "Skipping tool that cannot be namespaced");
                        None
                    }
                }
            })
            .collect())
    }

    /// Declared catalog of a backend (cached)
    pub async fn backend_catalog(
        &self,
        backend: &BackendServer,
        ctx: &CallContext,
    ) -> Result<Arc<Vec<Tool>>> {
        self.backend_catalog_until(backend, ctx, self.deadline()).await
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.call_timeout
    }

    fn deadline_exceeded(&self, what: &str) -> Error {
        Error::Timeout(format!("{what} exceeded {}ms", self.call_timeout.as_millis()))
    }

    /// Catalog fetch with connect and every page bounded by `deadline`
    async fn backend_catalog_until(
        &self,
        backend: &BackendServer,
        ctx: &CallContext,
        deadline: Instant,
    ) -> Result<Arc<Vec<Tool>>> {
        if let Some(tools) = self.cache.backend(&backend.id) {
            return Ok(tools);
        }
        let token = self.cache.token();

        let headers = self.injector.headers_for(backend, &ctx.principal).await?;
        let acquire = self
            .connections
            .acquire(&ctx.principal.user_id, &ctx.session_id, backend, &headers);
        let conn = timeout_at(deadline, acquire)
            .await
            .map_err(|_| self.deadline_exceeded("tools/list"))??;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = match timeout_at(deadline, conn.request("tools/list", params, &headers)).await {
                Ok(Ok(response)) => into_result(response).and_then(|v| {
                    serde_json::from_value::<ToolsListResult>(v)
                        .map_err(|e| Error::backend_protocol(&backend.id, format!("Invalid tools/list result: {e}")))
                }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(self.deadline_exceeded("tools/list")),
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    conn.discard().await;
                    return Err(e);
                }
            };
            tools.extend(page.tools);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        drop(conn);

        let tools = Arc::new(tools);
        self.cache
            .insert_backend(token, &backend.id, Arc::clone(&tools));
        Ok(tools)
    }

    /// Resolve and execute a namespaced tool call; returns the raw `tools/call` result
    pub async fn dispatch(
        &self,
        endpoint_id: &str,
        name: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<Value> {
        let name = NamespacedToolName::parse(name)?;
        let endpoint = self.endpoint(endpoint_id, &ctx.principal).await?;

        if endpoint
            .child(name.backend_id(), name.instance_name())
            .is_none()
        {
            return Err(Error::ToolNotFound(format!(
                "'{name}': backend '{}' instance '{}' is not part of this endpoint",
                name.backend_id(),
                name.instance_name()
            )));
        }

        let backend = self
            .store
            .backend(name.backend_id())
            .await?
            .filter(|b| !b.deleted)
            .ok_or_else(|| Error::NotFound(format!("backend '{}'", name.backend_id())))?;
        if backend.status.is_unhealthy() {
            return Err(Error::BackendUnhealthy {
                backends: vec![backend.id.clone()],
            });
        }

        if backend.tool_search {
            if let Some(meta) = MetaTool::from_name(name.tool_name()) {
                return self.dispatch_meta(meta, &backend, arguments, ctx).await;
            }
        }

        self.call_declared(&backend, name.tool_name(), arguments, ctx)
            .await
    }

    async fn dispatch_meta(
        &self,
        meta: MetaTool,
        backend: &BackendServer,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<Value> {
        match meta {
            MetaTool::Search => {
                let catalog = self.backend_catalog(backend, ctx).await?;
                let allowed = visible(backend, &catalog, &ctx.principal);
                let hits = self.search.search_tools(arguments, &allowed).await?;
                call_result(&json!({ "results": hits }))
            }
            MetaTool::Describe => {
                let catalog = self.backend_catalog(backend, ctx).await?;
                let allowed = visible(backend, &catalog, &ctx.principal);
                call_result(&self.search.describe_tools(arguments, &allowed)?)
            }
            MetaTool::Execute => {
                let request = ExecuteRequest::from_args(arguments)?;
                self.call_declared(backend, &request.name, request.arguments, ctx)
                    .await
            }
        }
    }

    /// Scope check, catalog check, then the backend call, all under one
    /// `call_timeout` deadline
    async fn call_declared(
        &self,
        backend: &BackendServer,
        tool: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<Value> {
        ctx.principal.check_tool_scope(&backend.id, tool)?;

        let deadline = self.deadline();
        let catalog = self.backend_catalog_until(backend, ctx, deadline).await?;
        if !catalog.iter().any(|t| t.name == tool) {
            return Err(Error::ToolNotFound(format!(
                "'{tool}' is not declared by backend '{}' ({} tools available)",
                backend.id,
                catalog.len()
            )));
        }

        let exec = ExecutionContext {
            org_id: ctx.principal.org_id.clone(),
            user_id: ctx.principal.user_id.clone(),
            backend_id: backend.id.clone(),
            tool_name: tool.to_string(),
            correlation_id: ctx.correlation_id.clone(),
        };
        let span = exec.span();
        self.call_backend(backend, tool, arguments, ctx, deadline)
            .instrument(span)
            .await
    }

    /// Credential headers are resolved outside the deadline so a token
    /// refresh is never cut off halfway; connect and call share it.
    async fn call_backend(
        &self,
        backend: &BackendServer,
        tool: &str,
        arguments: Value,
        ctx: &CallContext,
        deadline: Instant,
    ) -> Result<Value> {
        let headers = self.injector.headers_for(backend, &ctx.principal).await?;
        let acquire = self
            .connections
            .acquire(&ctx.principal.user_id, &ctx.session_id, backend, &headers);
        let conn = timeout_at(deadline, acquire)
            .await
            .map_err(|_| self.deadline_exceeded("tool call"))??;
        Span::current().record("transport", conn.kind());

        let params = json!({ "name": tool, "arguments": arguments });
        let outcome = timeout_at(deadline, conn.request("tools/call", Some(params), &headers)).await;

        let result = match outcome {
            Ok(Ok(response)) => into_result(response),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.deadline_exceeded("tool call")),
        };

        match result {
            Ok(value) => {
                debug!("Tool call succeeded");
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "Tool call failed, discarding connection");
                conn.discard().await;
                Err(e)
            }
        }
    }
}

/// Catalog entries the caller's tool scopes allow
fn visible(backend: &BackendServer, catalog: &[Tool], principal: &Principal) -> Vec<Tool> {
    catalog
        .iter()
        .filter(|t| principal.can_use(&backend.id, &t.name))
        .cloned()
        .collect()
}
