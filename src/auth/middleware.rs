//! Axum middleware: public paths, principal resolution, rate limiting

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde_json::json;
use tracing::{debug, error, warn};

use super::AuthResolver;
use crate::Error;
use crate::error::{AuthError, rpc_codes};

type BucketLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One token bucket per principal, created on first use
pub struct PrincipalRateLimiter {
    quota: Option<Quota>,
    buckets: DashMap<String, Arc<BucketLimiter>>,
}

impl PrincipalRateLimiter {
    /// `per_minute == 0` disables limiting
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        Self {
            quota: NonZeroU32::new(per_minute).map(Quota::per_minute),
            buckets: DashMap::new(),
        }
    }

    /// Take one request from the caller's bucket
    pub fn check(&self, key: &str) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        let limiter = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)))
            .clone();
        limiter.check().is_ok()
    }
}

/// Middleware state
pub struct AuthGate {
    resolver: Arc<AuthResolver>,
    limiter: PrincipalRateLimiter,
    public_paths: Vec<String>,
}

impl AuthGate {
    /// Gate over a resolver
    #[must_use]
    pub fn new(resolver: Arc<AuthResolver>, rate_limit: u32, public_paths: Vec<String>) -> Self {
        Self {
            resolver,
            limiter: PrincipalRateLimiter::new(rate_limit),
            public_paths,
        }
    }

    /// Exact match, or prefix match for entries ending in `/`
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| {
            if p.ends_with('/') {
                path.starts_with(p.as_str())
            } else {
                path == p
            }
        })
    }
}

/// Resolve the caller and attach the [`super::Principal`] to the request
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if gate.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    match gate.resolver.resolve(request.headers()).await {
        Ok(principal) => {
            if !gate.limiter.check(&principal.limiter_key()) {
                warn!(org_id = %principal.org_id, user_id = %principal.user_id, path = %path, "Rate limit exceeded");
                return rate_limited_response();
            }
            debug!(org_id = %principal.org_id, user_id = %principal.user_id, path = %path, "Authenticated request");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(Error::AuthRejected(reason)) => {
            warn!(path = %path, code = reason.code(), "Authentication failed");
            unauthorized_response(&reason)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Authentication backend failure");
            (
                e.http_status(),
                Json(json!({
                    "jsonrpc": "2.0",
                    "error": {"code": e.to_rpc_code(), "message": e.public_message()},
                    "id": null
                })),
            )
                .into_response()
        }
    }
}

/// 401 with a JSON-RPC body carrying the diagnostic code
pub fn unauthorized_response(reason: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": rpc_codes::UNAUTHORIZED,
                "message": reason.to_string(),
                "data": {"code": reason.code()}
            },
            "id": null
        })),
    )
        .into_response()
}

fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "60")],
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": rpc_codes::CAPACITY_EXCEEDED,
                "message": "Rate limit exceeded. Try again later."
            },
            "id": null
        })),
    )
        .into_response()
}
