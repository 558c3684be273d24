//! [`ServiceStore`] backed by etcd v3 through its JSON gateway.
//!
//! Keys and values travel base64 encoded. Requests go to the configured
//! endpoints in order until one answers; a watch is one long-lived streaming
//! POST to `/v3/watch` whose body is a sequence of newline separated JSON
//! envelopes.
use std::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::models::EtcdConfig,
    ports::service_store::{
        ServiceStore, StoreError, StoreResult, WatchBatch, WatchEvent, WatchStream,
    },
};

const RANGE_PATH: &str = "/v3/kv/range";
const DELETE_RANGE_PATH: &str = "/v3/kv/deleterange";
const WATCH_PATH: &str = "/v3/watch";
const AUTHENTICATE_PATH: &str = "/v3/auth/authenticate";

#[derive(Serialize)]
struct KeyRequest {
    key: String,
}

#[derive(Serialize)]
struct WatchRequest {
    create_request: KeyRequest,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct WatchEnvelope {
    result: Option<WatchResult>,
    error: Option<GatewayError>,
}

#[derive(Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
}

#[derive(Deserialize)]
struct RawEvent {
    /// Omitted for PUT, the zero value of the enum.
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: Option<KeyValue>,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

pub struct EtcdStore {
    http: Client,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
    request_timeout: Duration,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl EtcdStore {
    /// Build the client and authenticate when credentials are configured.
    pub async fn connect(config: &EtcdConfig) -> StoreResult<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|raw| normalize_endpoint(raw))
            .collect::<StoreResult<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(StoreError::Connection("no etcd endpoints configured".to_string()));
        }

        let mut builder = Client::builder();
        if config.dial_timeout > 0 {
            builder = builder.connect_timeout(Duration::from_secs(config.dial_timeout));
        }
        if config.dial_keepalive_time > 0 {
            builder = builder.tcp_keepalive(Duration::from_secs(config.dial_keepalive_time));
        }
        let http = builder
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let credentials = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));

        let store = Self {
            http,
            endpoints,
            credentials,
            token: RwLock::new(None),
            request_timeout: Duration::from_secs(config.request_timeout.max(1)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        store.authenticate().await?;

        tracing::info!(endpoints = ?store.endpoints, "Connected to etcd");
        Ok(store)
    }

    async fn authenticate(&self) -> StoreResult<()> {
        let Some((name, password)) = &self.credentials else {
            return Ok(());
        };
        let response = self
            .send_once(
                AUTHENTICATE_PATH,
                &AuthRequest { name, password },
                Some(self.request_timeout),
                None,
            )
            .await?;
        let auth: AuthResponse = decode_json(response).await?;
        *self.token.write().await = Some(auth.token);
        tracing::debug!("Authenticated against etcd");
        Ok(())
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// POST with token, re-authenticating once when the token was rejected.
    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> StoreResult<reqwest::Response> {
        self.ensure_open()?;
        let token = self.token.read().await.clone();
        match self.send_once(path, body, timeout, token).await {
            Err(StoreError::Auth(reason)) if self.credentials.is_some() => {
                tracing::warn!(reason = %reason, "etcd token rejected, re-authenticating");
                self.authenticate().await?;
                let token = self.token.read().await.clone();
                self.send_once(path, body, timeout, token).await
            }
            other => other,
        }
    }

    /// Try every endpoint in order; only connection failures move on to the next one.
    async fn send_once<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
        token: Option<String>,
    ) -> StoreResult<reqwest::Response> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let mut request = self.http.post(format!("{endpoint}{path}")).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(token) = &token {
                request = request.header(header::AUTHORIZATION, token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    return Err(StoreError::Timeout(timeout.unwrap_or(self.request_timeout)));
                }
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    last_error = Some(StoreError::Connection(format!("{endpoint}: {e}")));
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                let reason = response.text().await.unwrap_or_default();
                return Err(StoreError::Auth(reason));
            }
            if !status.is_success() {
                let reason = response.text().await.unwrap_or_default();
                return Err(StoreError::Protocol(format!("{path} returned {status}: {reason}")));
            }
            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| StoreError::Connection("no etcd endpoint".to_string())))
    }
}

#[async_trait]
impl ServiceStore for EtcdStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let request = KeyRequest {
            key: STANDARD.encode(key),
        };
        let response = self
            .post(RANGE_PATH, &request, Some(self.request_timeout))
            .await?;
        let range: RangeResponse = decode_json(response).await?;

        match range.kvs.into_iter().next() {
            Some(kv) => decode_b64(&kv.value).map(Some),
            None => Ok(None),
        }
    }

    async fn watch(&self, key: &str) -> StoreResult<WatchStream> {
        let request = WatchRequest {
            create_request: KeyRequest {
                key: STANDARD.encode(key),
            },
        };
        let response = self.post(WATCH_PATH, &request, None).await?;
        let stream = decode_watch_stream(response.bytes_stream())
            .take_until(self.shutdown.clone().cancelled_owned());
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let request = KeyRequest {
            key: STANDARD.encode(key),
        };
        self.post(DELETE_RANGE_PATH, &request, Some(self.request_timeout))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            tracing::info!("etcd client closed");
        }
    }
}

fn normalize_endpoint(raw: &str) -> StoreResult<String> {
    let raw = raw.trim().trim_end_matches('/');
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    Url::parse(&with_scheme)
        .map_err(|e| StoreError::Connection(format!("invalid etcd endpoint '{raw}': {e}")))?;
    Ok(with_scheme)
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> StoreResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| StoreError::Protocol(e.to_string()))
}

fn decode_b64(value: &str) -> StoreResult<Bytes> {
    STANDARD
        .decode(value)
        .map(Bytes::from)
        .map_err(|e| StoreError::Protocol(format!("invalid base64 from etcd: {e}")))
}

fn decode_key(value: &str) -> StoreResult<String> {
    let raw = decode_b64(value)?;
    String::from_utf8(raw.to_vec()).map_err(|e| StoreError::Protocol(e.to_string()))
}

/// One gateway envelope. `Ok(None)` for envelopes without events (creation, progress).
fn parse_watch_line(line: &[u8]) -> StoreResult<Option<WatchBatch>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let envelope: WatchEnvelope =
        serde_json::from_slice(line).map_err(|e| StoreError::Protocol(e.to_string()))?;
    if let Some(error) = envelope.error {
        return Err(StoreError::Protocol(error.message));
    }
    let Some(result) = envelope.result else {
        return Ok(None);
    };
    if result.canceled {
        return Err(StoreError::Protocol(format!(
            "watch canceled: {}",
            result.cancel_reason
        )));
    }
    if result.events.is_empty() {
        return Ok(None);
    }

    let mut batch = Vec::with_capacity(result.events.len());
    for event in result.events {
        let Some(kv) = event.kv else {
            continue;
        };
        let key = decode_key(&kv.key)?;
        match event.kind.as_deref() {
            Some("DELETE") => batch.push(WatchEvent::delete(key)),
            _ => batch.push(WatchEvent::put(key, decode_b64(&kv.value)?)),
        }
    }
    Ok(Some(batch))
}

struct LineDecoder<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    finished: bool,
}

fn decode_watch_stream<S, E>(body: S) -> impl Stream<Item = StoreResult<WatchBatch>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = LineDecoder {
        body: Box::pin(body),
        buffer: Vec::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_watch_line(&line) {
                    Ok(None) => continue,
                    Ok(Some(batch)) => return Some((Ok(batch), state)),
                    Err(e) => return Some((Err(e), state)),
                }
            }
            if state.finished {
                let rest = std::mem::take(&mut state.buffer);
                return match parse_watch_line(&rest) {
                    Ok(Some(batch)) => Some((Ok(batch), state)),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), state)),
                };
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((Err(StoreError::Connection(e.to_string())), state));
                }
                None => state.finished = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::{Json, Router, routing::post};
    use tokio::net::TcpListener;

    use super::*;
    use crate::ports::service_store::WatchEventKind;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn test_parse_put_and_delete_events() {
        let line = format!(
            r#"{{"result":{{"events":[{{"kv":{{"key":"{}","value":"{}"}}}},{{"type":"DELETE","kv":{{"key":"{}"}}}}]}}}}"#,
            b64("svc"),
            b64("[]"),
            b64("svc")
        );

        let batch = parse_watch_line(line.as_bytes()).unwrap().unwrap();
        assert_eq!(batch[0], WatchEvent::put("svc", "[]"));
        assert_eq!(batch[1].kind, WatchEventKind::Delete);
        assert_eq!(batch[1].key, "svc");
    }

    #[test]
    fn test_parse_ignores_created_envelope() {
        let line = br#"{"result":{"header":{"revision":"7"},"created":true}}"#;
        assert!(parse_watch_line(line).unwrap().is_none());
        assert!(parse_watch_line(b"  \n").unwrap().is_none());
    }

    #[test]
    fn test_parse_canceled_watch_is_error() {
        let line = br#"{"result":{"canceled":true,"cancel_reason":"compacted"}}"#;
        assert!(matches!(
            parse_watch_line(line),
            Err(StoreError::Protocol(reason)) if reason.contains("compacted")
        ));
    }

    #[tokio::test]
    async fn test_decoder_reassembles_split_lines() {
        let event = format!(
            "{{\"result\":{{\"events\":[{{\"kv\":{{\"key\":\"{}\",\"value\":\"{}\"}}}}]}}}}\n",
            b64("svc"),
            b64("v1")
        );
        let (head, tail) = event.split_at(10);
        let chunks: Vec<Result<Bytes, Infallible>> = vec![
            Ok(Bytes::from_static(b"{\"result\":{\"created\":true}}\n")),
            Ok(Bytes::from(head.to_string())),
            Ok(Bytes::from(tail.to_string())),
        ];

        let batches: Vec<_> = decode_watch_stream(stream::iter(chunks)).collect().await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_ref().unwrap(), &vec![WatchEvent::put("svc", "v1")]);
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("127.0.0.1:2379").unwrap(), "http://127.0.0.1:2379");
        assert_eq!(
            normalize_endpoint("https://etcd.local:2379/").unwrap(),
            "https://etcd.local:2379"
        );
    }

    #[tokio::test]
    async fn test_get_fails_over_to_live_endpoint() -> eyre::Result<()> {
        let value = b64(r#"[{"Url":"10.0.0.1","Weight":1}]"#);
        let app = Router::new().route(
            RANGE_PATH,
            post(move || {
                let value = value.clone();
                async move { Json(serde_json::json!({ "kvs": [{ "key": b64("svc"), "value": value }] })) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let live = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let config = EtcdConfig {
            endpoints: vec![format!("http://{dead}"), format!("http://{live}")],
            ..Default::default()
        };
        let store = EtcdStore::connect(&config).await?;

        let value = store.get("svc").await?.unwrap();
        assert_eq!(&value[..], br#"[{"Url":"10.0.0.1","Weight":1}]"#);

        store.close().await;
        assert!(matches!(store.get("svc").await, Err(StoreError::Closed)));
        Ok(())
    }
}
