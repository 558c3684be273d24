use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the upstream does not answer in time
    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an already rewritten HTTP request to its upstream.
    ///
    /// Any transport failure (refused connection, timeout, broken stream before
    /// the response head) is reported as an error; HTTP error statuses are not.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
