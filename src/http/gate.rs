//! Admission gate middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde_json::json;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Decision, DecisionEngine, RateIdentity};

/// Header carrying the caller's API token.
pub const API_KEY_HEADER: &str = "api_key";
/// Proxy-supplied client address, honoured only when configured.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Body message of every rejection.
pub const BLOCKED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// The fixed rejection response: 429 with a JSON `error` body.
pub fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": BLOCKED_MESSAGE })),
    )
        .into_response()
}

/// Extracts the rate identity from an inbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver {
    trust_proxy_headers: bool,
}

impl IdentityResolver {
    pub fn new(trust_proxy_headers: bool) -> Self {
        Self {
            trust_proxy_headers,
        }
    }

    /// Resolve a request to its identity: the API token if present, else the origin address.
    ///
    /// The origin is the peer address from axum's `ConnectInfo`, or `X-Real-IP` when
    /// proxy headers are trusted. A request with neither a token nor an origin is
    /// malformed.
    pub fn resolve<B>(&self, req: &Request<B>) -> Result<RateIdentity> {
        let api_key = req
            .headers()
            .get(API_KEY_HEADER)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        let origin = self.origin(req).unwrap_or_default();

        if api_key.as_deref().map_or(true, str::is_empty) && origin.is_empty() {
            return Err(TurnstileError::MalformedIdentity(
                "request has no API key and no origin address".to_string(),
            ));
        }

        Ok(RateIdentity::resolve(api_key.as_deref(), &origin))
    }

    fn origin<B>(&self, req: &Request<B>) -> Option<String> {
        if self.trust_proxy_headers {
            let real_ip = req
                .headers()
                .get(REAL_IP_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = real_ip {
                return Some(ip.to_string());
            }
        }

        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
    }
}

/// A layer that places an [`AdmissionGate`] in front of a service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    engine: Arc<DecisionEngine>,
    resolver: IdentityResolver,
}

impl AdmissionLayer {
    pub fn new(engine: Arc<DecisionEngine>, resolver: IdentityResolver) -> Self {
        Self { engine, resolver }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionGate<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionGate {
            inner: service,
            engine: self.engine.clone(),
            resolver: self.resolver,
        }
    }
}

/// Middleware that rejects requests the decision engine denies.
///
/// Admitted requests reach the inner service unchanged. Denied requests get
/// [`too_many_requests`] and never reach it.
#[derive(Clone, Debug)]
pub struct AdmissionGate<S> {
    inner: S,
    engine: Arc<DecisionEngine>,
    resolver: IdentityResolver,
}

impl<S, B> Service<Request<B>> for AdmissionGate<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let engine = self.engine.clone();
        let resolver = self.resolver;
        // Keep the instance that was driven to ready
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let identity = match resolver.resolve(&req) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(error = %e, "Cannot resolve rate identity, admitting request");
                    return inner.call(req).await;
                }
            };

            match engine.decide(&identity).await {
                Decision::Allowed => inner.call(req).await,
                Decision::Denied(reason) => {
                    debug!(
                        identity = %identity,
                        reason = ?reason,
                        path = %req.uri().path(),
                        "Request rejected"
                    );
                    Ok(too_many_requests())
                }
            }
        })
    }
}
