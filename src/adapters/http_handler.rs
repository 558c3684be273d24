use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request, State},
    response::Response,
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{core::dispatcher::Dispatcher, tracing_setup};

/// Path of the gateway's own health document. Never forwarded.
pub const HEALTH_PATH: &str = "/__gateway/health";

/// Axum front of the [`Dispatcher`].
#[derive(Clone)]
pub struct HttpHandler {
    dispatcher: Arc<Dispatcher>,
}

impl HttpHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Catch-all router; serve it with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn router(self) -> Router {
        Router::new()
            .route(HEALTH_PATH, get(health))
            .fallback(proxy)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn handle_request(&self, req: Request, client_addr: IpAddr) -> Response {
        let span = tracing_setup::request_span(
            req.method().as_str(),
            req.uri().path(),
            &client_addr.to_string(),
        );
        let response = self
            .dispatcher
            .dispatch(req, client_addr)
            .instrument(span.clone())
            .await;
        span.record("http.status_code", response.status().as_u16());
        response
    }

    fn health_document(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "cached_services": self.dispatcher.registry().cached_services(),
            "telemetry_active": self.dispatcher.telemetry().is_active(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

async fn health(State(handler): State<HttpHandler>) -> Json<serde_json::Value> {
    Json(handler.health_document())
}

async fn proxy(State(handler): State<HttpHandler>, req: Request) -> Response<AxumBody> {
    let client_addr = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip(),
        None => {
            tracing::warn!("No peer address on request, treating client as 0.0.0.0");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    };
    handler.handle_request(req, client_addr).await
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::{HttpClientAdapter, memory_store::MemoryStore},
        config::{GatewayConfig, models::HttpTransportConfig},
        core::{
            admission::AdmissionChain,
            dispatcher::DispatcherOptions,
            load_balancer::{BalancerRegistry, ServiceBalancers},
            registry::{RegistryOptions, ServiceRegistry},
            telemetry::TelemetryHandle,
        },
    };

    fn create_test_handler() -> HttpHandler {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistryOptions::default(),
        ));
        let balancers = ServiceBalancers::from_config(
            &GatewayConfig::default(),
            &BalancerRegistry::with_builtin(),
        )
        .unwrap();
        let client = Arc::new(HttpClientAdapter::new(&HttpTransportConfig::default()).unwrap());

        HttpHandler::new(Arc::new(Dispatcher::new(
            registry,
            balancers,
            AdmissionChain::new(),
            client,
            TelemetryHandle::inactive(),
            DispatcherOptions::default(),
        )))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_handler().router();

        let response = app
            .oneshot(axum::http::Request::get(HEALTH_PATH).body(AxumBody::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["cached_services"], 0);
        assert_eq!(doc["telemetry_active"], false);
    }

    #[tokio::test]
    async fn test_root_request_is_unresolvable() {
        let app = create_test_handler().router();

        let mut req = axum::http::Request::get("/").body(AxumBody::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
