//! Shared-store client
//!
//! [`HttpTransport`] reaches a `tiercache-server` (or any server speaking the
//! same StreamableHTTP command protocol): L2 operations go through
//! `POST /api/v1/command`, invalidations are published with `pubsub.publish`
//! and received over the `/pubsub/ws` WebSocket.

use crate::bus::{BusStream, BusTransport};
use crate::config::TierConfig;
use crate::error::TransportError;
use crate::remote::RemoteTransport;
use crate::types::{BusMessage, remote_key};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

type TransportResult<T> = std::result::Result<T, TransportError>;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the shared store
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional authentication token
    pub auth_token: Option<String>,
}

impl ClientConfig {
    /// Create a new configuration with the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            auth_token: None,
        }
    }

    /// Take URL, timeout and token from a tier configuration
    pub fn from_tier(config: &TierConfig) -> Self {
        Self {
            base_url: config.remote.url.clone(),
            timeout: config.remote_timeout(),
            auth_token: config.remote.auth_token.clone(),
        }
    }

    /// Set the timeout for requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Remote and bus transport over HTTP + WebSocket
#[derive(Clone)]
pub struct HttpTransport {
    config: Arc<ClientConfig>,
    http_client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> TransportResult<Self> {
        let base_url = Url::parse(&config.base_url)?;

        let mut http_client_builder = Client::builder().timeout(config.timeout);

        if let Some(ref token) = config.auth_token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Config(format!("invalid auth token: {}", e)))?;
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(reqwest::header::AUTHORIZATION, value);
            http_client_builder = http_client_builder.default_headers(headers);
        }

        let http_client = http_client_builder.build()?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a StreamableHTTP command and return its payload
    pub(crate) async fn send_command(
        &self,
        command: &str,
        payload: Value,
    ) -> TransportResult<Value> {
        let request_id = uuid::Uuid::new_v4().to_string();

        let body = json!({
            "command": command,
            "request_id": request_id,
            "payload": payload,
        });

        let url = self.base_url.join("api/v1/command")?;

        let response = self.http_client.post(url).json(&body).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransportError::Server(error_text));
        }

        let result: Value = response.json().await?;

        if !result["success"].as_bool().unwrap_or(false) {
            let error_msg = result["error"]
                .as_str()
                .unwrap_or("Unknown error")
                .to_string();
            return Err(TransportError::Server(error_msg));
        }

        Ok(result["payload"].clone())
    }

    /// WebSocket endpoint for `topic`
    pub fn subscription_url(&self, topic: &str) -> TransportResult<Url> {
        let mut url = self.base_url.join("pubsub/ws")?;
        let scheme = match self.base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(TransportError::Config(format!(
                    "unsupported URL scheme: {}",
                    other
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Config(format!("cannot switch scheme to {}", scheme)))?;
        url.query_pairs_mut().append_pair("topics", topic);
        Ok(url)
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn get(&self, region: &str, key: &str) -> TransportResult<Option<Vec<u8>>> {
        let payload = json!({ "key": remote_key(region, key) });
        let response = self.send_command("kv.get", payload).await?;

        // StreamableHTTP returns null for not found
        match response {
            Value::Null => Ok(None),
            Value::String(encoded) => BASE64
                .decode(encoded)
                .map(Some)
                .map_err(|e| TransportError::InvalidResponse(format!("bad base64 value: {}", e))),
            other => Err(TransportError::InvalidResponse(format!(
                "expected string value, got {}",
                other
            ))),
        }
    }

    async fn put(
        &self,
        region: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> TransportResult<()> {
        let payload = json!({
            "key": remote_key(region, key),
            "value": BASE64.encode(value),
            "ttl": ttl.map(ttl_secs),
        });

        self.send_command("kv.set", payload).await?;
        Ok(())
    }

    async fn evict(&self, region: &str, key: &str) -> TransportResult<bool> {
        let payload = json!({ "key": remote_key(region, key) });
        let response = self.send_command("kv.del", payload).await?;

        Ok(response["deleted"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl BusTransport for HttpTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        let key = String::from_utf8(payload)
            .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;

        let response = self
            .send_command(
                "pubsub.publish",
                json!({
                    "topic": topic,
                    "payload": key,
                }),
            )
            .await?;

        debug!(
            "Published on {} to {} subscribers",
            topic,
            response["subscribers_matched"].as_u64().unwrap_or(0)
        );
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<BusStream> {
        let ws_url = self.subscription_url(topic)?;
        debug!("Connecting to WebSocket: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        // The subscription is live once the server greets us
        loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).map_err(|e| {
                        TransportError::InvalidResponse(format!("bad frame: {}", e))
                    })?;
                    match frame["type"].as_str() {
                        Some("connected") => break,
                        Some("error") => {
                            return Err(TransportError::Server(
                                frame["error"].as_str().unwrap_or("subscribe failed").to_string(),
                            ));
                        }
                        _ => continue,
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }

        let (tx, rx) = mpsc::unbounded_channel::<BusMessage>();
        let task_topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        debug!("Subscription to {} released", task_topic);
                        break;
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                if let Some(message) = parse_message_frame(&text) {
                                    if tx.send(message).is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                debug!("WebSocket for {} closed by server", task_topic);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("WebSocket error on {}: {}", task_topic, e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}

/// Whole seconds for the store, rounded up and never zero
fn ttl_secs(ttl: Duration) -> u64 {
    (ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).max(1)
}

/// Decode a `{"type":"message","topic":..,"payload":..}` frame
fn parse_message_frame(text: &str) -> Option<BusMessage> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to parse WebSocket message: {}", e);
            return None;
        }
    };

    if frame["type"].as_str() != Some("message") {
        return None;
    }

    let topic = frame["topic"].as_str()?.to_string();
    let payload = match &frame["payload"] {
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Null => return None,
        other => other.to_string().into_bytes(),
    };

    Some(BusMessage { topic, payload })
}
