use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    config::models::HttpTransportConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Upstream transport built on Hyper with Rustls.
///
/// Connection behaviour (connect timeout, TCP keepalive, idle pool) comes from
/// [`HttpTransportConfig`]. The response head must arrive within
/// `response_header_timeout`; the body is streamed back untouched.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    response_timeout: Option<Duration>,
}

impl HttpClientAdapter {
    pub fn new(transport: &HttpTransportConfig) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(positive_secs(transport.dial_time_out));
        http_connector.set_keepalive(positive_secs(transport.dial_keep_alive));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(positive_secs(transport.idle_conn_timeout))
            .pool_max_idle_per_host(transport.max_idle_conns_per_host)
            .build::<_, AxumBody>(https_connector);

        tracing::info!(
            connect_timeout_secs = transport.dial_time_out,
            idle_timeout_secs = transport.idle_conn_timeout,
            max_idle_per_host = transport.max_idle_conns_per_host,
            "Created upstream HTTP client"
        );
        Ok(Self {
            client,
            response_timeout: positive_secs(transport.response_header_timeout),
        })
    }

    /// Host header value for the request's authority, port included.
    fn host_header(req: &Request<AxumBody>) -> HttpClientResult<HeaderValue> {
        let authority = req
            .uri()
            .authority()
            .ok_or_else(|| HttpClientError::InvalidRequest(format!("no host in {}", req.uri())))?;
        HeaderValue::from_str(authority.as_str())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))
    }
}

fn positive_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let host = Self::host_header(&req)?;
        req.headers_mut().insert(header::HOST, host);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        let span = tracing::info_span!(
            "upstream_request",
            http.method = %method,
            http.uri = %uri,
            http.status_code = tracing::field::Empty,
        );
        span.in_scope(|| tracing::debug!("Outgoing request headers: {:?}", parts.headers));

        let pending = self
            .client
            .request(Request::from_parts(parts, body))
            .instrument(span.clone());
        let result = match self.response_timeout {
            Some(limit) => match timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    span.record("http.status_code", 599u16);
                    return Err(HttpClientError::Timeout(limit.as_secs()));
                }
            },
            None => pending.await,
        };

        match result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());

                let (mut parts, hyper_body) = response.into_parts();
                // Axum re-frames the streamed body
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                span.record("http.status_code", 599u16);
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new(&HttpTransportConfig::default()).is_ok());
    }

    #[test]
    fn test_host_header_keeps_port() {
        let req = Request::builder()
            .uri("http://10.0.0.2:8081/path")
            .body(AxumBody::empty())
            .unwrap();
        assert_eq!(
            HttpClientAdapter::host_header(&req).unwrap(),
            HeaderValue::from_static("10.0.0.2:8081")
        );
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let client = HttpClientAdapter::new(&HttpTransportConfig::default()).unwrap();
        let req = Request::builder()
            .uri("/path")
            .body(AxumBody::empty())
            .unwrap();

        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new(&HttpTransportConfig::default()).unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();

        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::ConnectionError(_))
        ));
    }
}
