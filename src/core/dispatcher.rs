//! Per-request routing decision.
//!
//! A request for `/<service>/<rest>?<query>` goes through admission, host
//! resolution (sticky route cache, then registry plus balancer, then the
//! default url), rewriting and forwarding. Every outcome, successful or not,
//! produces exactly one telemetry record, and every failure is turned into the
//! JSON error body here so nothing internal leaks past the dispatcher.
use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::{
    Json,
    body::Body as AxumBody,
    http::{HeaderName, HeaderValue, StatusCode, Uri, header},
    response::IntoResponse,
};
use hyper::{Request, Response};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::GatewayConfig,
    core::{
        admission::{AdmissionChain, normalize_client_ip},
        load_balancer::ServiceBalancers,
        registry::{RegistryError, ServiceRegistry},
        telemetry::{TelemetryHandle, TelemetryRecord},
    },
    ports::http_client::{HttpClient, HttpClientError},
    utils::expiring_cache::ExpiringCache,
};

/// Header carrying the resolved service name to the upstream.
pub const SERVICE_HEADER: HeaderName = HeaderName::from_static("service");
/// Header carrying the dispatch time (unix seconds) to the upstream.
pub const TRANSMIT_TIME_HEADER: HeaderName = HeaderName::from_static("transmit-time");

const UNAVAILABLE_MESSAGE: &str = "error!temporarily unavailable for service";
const NOT_FOUND_MESSAGE: &str = "error!service not found!";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("client {0} was not admitted")]
    Rejected(IpAddr),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no endpoint selected for service '{0}'")]
    NoEndpoint(String),

    #[error("service '{0}' could not be resolved to any host")]
    Unresolvable(String),

    #[error("invalid upstream uri '{uri}': {reason}")]
    InvalidUpstream { uri: String, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] HttpClientError),
}

impl DispatchError {
    /// 500 when no host was chosen, 404 when a host was chosen but did not answer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Rejected(_) | Self::Registry(_) | Self::NoEndpoint(_) | Self::Unresolvable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::InvalidUpstream { .. } | Self::Upstream(_) => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> &'static str {
        if self.status_code() == StatusCode::NOT_FOUND {
            NOT_FOUND_MESSAGE
        } else {
            UNAVAILABLE_MESSAGE
        }
    }
}

/// Client-visible error document.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "Msg")]
    pub msg: &'static str,
    #[serde(rename = "Data")]
    pub data: Option<()>,
    #[serde(rename = "Code")]
    pub code: u16,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorBody {
            msg: self.message(),
            data: None,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// How the upstream host of a request was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Cached(String),
    Balanced(String),
    Fallback(String),
    Unresolved,
}

impl Resolution {
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Cached(host) | Self::Balanced(host) | Self::Fallback(host) => Some(host),
            Self::Unresolved => None,
        }
    }
}

/// Service name and forwarded remainder of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub service: String,
    /// Path after the service segment, `""` or starting with `/`.
    pub rest: String,
    pub query: Option<String>,
}

impl RequestTarget {
    pub fn parse(uri: &Uri) -> Self {
        let path = uri.path();
        let path = path.strip_prefix('/').unwrap_or(path);
        let (service, tail) = path.split_once('/').unwrap_or((path, ""));
        let rest = if tail.is_empty() {
            String::new()
        } else {
            format!("/{tail}")
        };

        Self {
            service: service.to_string(),
            rest,
            query: uri.query().map(str::to_string),
        }
    }

    /// Absolute upstream uri for `host`; a host without scheme is reached over http.
    pub fn upstream_uri(&self, host: &str) -> Result<Uri, DispatchError> {
        let mut raw = upstream_base(host);
        raw.push_str(if self.rest.is_empty() { "/" } else { &self.rest });
        if let Some(query) = &self.query {
            raw.push('?');
            raw.push_str(query);
        }

        raw.parse::<Uri>()
            .map_err(|e| DispatchError::InvalidUpstream {
                uri: raw.clone(),
                reason: e.to_string(),
            })
    }
}

fn upstream_base(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Host used when a service cannot be resolved.
    pub default_url: Option<String>,
    /// Lifetime of a sticky (client, service) route.
    pub route_ttl: Duration,
    pub route_clean_up_interval: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            default_url: None,
            route_ttl: Duration::from_secs(3),
            route_clean_up_interval: Duration::from_secs(10),
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let default_url = config.default_url.trim();
        Self {
            default_url: (!default_url.is_empty()).then(|| default_url.to_string()),
            route_ttl: Duration::from_secs(config.route_cache.default_expiration),
            route_clean_up_interval: Duration::from_secs(config.route_cache.clean_up_interval),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    balancers: ServiceBalancers,
    admission: AdmissionChain,
    routes: Arc<ExpiringCache<(IpAddr, String), String>>,
    client: Arc<dyn HttpClient>,
    telemetry: TelemetryHandle,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        balancers: ServiceBalancers,
        admission: AdmissionChain,
        client: Arc<dyn HttpClient>,
        telemetry: TelemetryHandle,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            registry,
            balancers,
            admission,
            routes: Arc::new(ExpiringCache::new(options.route_ttl)),
            client,
            telemetry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    /// Periodically drop expired sticky routes until `cancel` fires.
    pub fn spawn_route_janitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.routes
            .spawn_janitor("route_cache", self.options.route_clean_up_interval, cancel)
    }

    /// Route one inbound request. Never fails: errors become JSON responses.
    pub async fn dispatch(
        &self,
        mut req: Request<AxumBody>,
        client_addr: IpAddr,
    ) -> Response<AxumBody> {
        let client_ip = normalize_client_ip(client_addr);
        let dispatched_at = chrono::Utc::now().timestamp();
        let target = RequestTarget::parse(req.uri());

        if !self.admission.admit(client_ip).await {
            return self.fail(DispatchError::Rejected(client_ip), "", "", dispatched_at);
        }

        let resolution = self.resolve_host(client_ip, &target.service).await;
        let Some(host) = resolution.host() else {
            let error = DispatchError::Unresolvable(target.service.clone());
            return self.fail(error, &target.service, "", dispatched_at);
        };

        let uri = match target.upstream_uri(host) {
            Ok(uri) => uri,
            Err(e) => return self.fail(e, &target.service, host, dispatched_at),
        };
        let upstream_host = uri.authority().map(|a| a.to_string()).unwrap_or_default();
        let upstream_path = uri.path().to_string();
        *req.uri_mut() = uri;
        stamp_headers(&mut req, &upstream_host, &target.service, dispatched_at);

        tracing::debug!(
            client_ip = %client_ip,
            service = %target.service,
            resolution = ?resolution,
            "Forwarding request"
        );

        match self.client.send_request(req).await {
            Ok(response) => {
                let status = response.status().as_u16();
                tracing::info!(
                    upstream = %upstream_host,
                    path = %upstream_path,
                    status,
                    "Transmit finished"
                );
                self.telemetry.emit(TelemetryRecord::completed(
                    &target.service,
                    dispatched_at,
                    &upstream_host,
                    status,
                ));
                response
            }
            Err(e) => self.fail(e.into(), &target.service, &upstream_host, dispatched_at),
        }
    }

    /// Sticky route if one is live, else registry plus balancer, else the default url.
    pub async fn resolve_host(&self, client_ip: IpAddr, service: &str) -> Resolution {
        let key = (client_ip, service.to_string());
        if let Some(host) = self.routes.get(&key).await {
            return Resolution::Cached(host);
        }

        match self.select(client_ip, service).await {
            Ok(host) => {
                self.routes.insert(key, host.clone()).await;
                Resolution::Balanced(host)
            }
            Err(e) => {
                tracing::error!(service, error = %e, "Transmit error, using default url");
                match &self.options.default_url {
                    Some(url) => Resolution::Fallback(url.clone()),
                    None => Resolution::Unresolved,
                }
            }
        }
    }

    async fn select(&self, client_ip: IpAddr, service: &str) -> Result<String, DispatchError> {
        let endpoints = self.registry.get(service).await?;
        self.balancers
            .for_service(service)
            .select_target(&endpoints, &client_ip.to_string())
            .ok_or_else(|| DispatchError::NoEndpoint(service.to_string()))
    }

    fn fail(
        &self,
        error: DispatchError,
        service: &str,
        upstream_host: &str,
        dispatched_at: i64,
    ) -> Response<AxumBody> {
        match &error {
            DispatchError::Rejected(ip) => tracing::info!(client_ip = %ip, "Request not admitted"),
            DispatchError::Upstream(e) => {
                tracing::error!(service, upstream = upstream_host, error = %e, "Upstream unreachable")
            }
            other => tracing::error!(service, error = %other, "Dispatch failed"),
        }

        let status = error.status_code();
        self.telemetry.emit(TelemetryRecord::completed(
            service,
            dispatched_at,
            upstream_host,
            status.as_u16(),
        ));
        error.into_response()
    }
}

fn stamp_headers(
    req: &mut Request<AxumBody>,
    upstream_host: &str,
    service: &str,
    dispatched_at: i64,
) {
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(upstream_host) {
        headers.insert(header::HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(service) {
        headers.insert(SERVICE_HEADER, value);
    }
    headers.insert(TRANSMIT_TIME_HEADER, HeaderValue::from(dispatched_at));
}
