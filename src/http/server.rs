//! HTTP server hosting a demo handler behind the admission gate.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Uri;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::gate::{AdmissionLayer, IdentityResolver};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::DecisionEngine;

/// HTTP server with every route behind the admission gate.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The decision engine shared by all requests
    engine: Arc<DecisionEngine>,
    resolver: IdentityResolver,
}

impl HttpServer {
    /// Create a new server resolving identities from the peer address.
    pub fn new(addr: SocketAddr, engine: Arc<DecisionEngine>) -> Self {
        Self {
            addr,
            engine,
            resolver: IdentityResolver::default(),
        }
    }

    /// Use a custom identity resolver.
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Build the router: the demo handler on every path, wrapped by the gate.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(greet))
            .route("/*path", any(greet))
            .layer(AdmissionLayer::new(self.engine.clone(), self.resolver))
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let router = self.router();

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with admission gate"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

async fn greet(uri: Uri) -> String {
    format!("Hi there, I love {}!", uri.path().trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{InMemoryStore, LimitRule, RateLimitPolicy};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn server() -> HttpServer {
        let rule = LimitRule {
            max_requests: 2,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        };
        let policy = RateLimitPolicy::new(rule, rule, HashMap::new()).unwrap();
        let engine = DecisionEngine::new(Arc::new(InMemoryStore::new()), policy);
        HttpServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(engine))
    }

    fn get(path: &str) -> Request<Body> {
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 1, 1], 5555))));
        req
    }

    #[tokio::test]
    async fn test_greets_path() {
        let response = server().router().oneshot(get("/hi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Hi there, I love hi!");
    }

    #[tokio::test]
    async fn test_all_routes_share_the_gate() {
        let router = server().router();

        assert_eq!(
            router.clone().oneshot(get("/")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            router.clone().oneshot(get("/a/b")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            router.oneshot(get("/c")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server().serve_with_shutdown(async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
