use crate::core::{Message, SharedStore, StoreError, TopicRouter};
use crate::protocol::{Request, Response};
use axum::{
    Json,
    extract::{
        Query, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response as AxumResponse},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SharedStore>,
    pub router: Arc<TopicRouter>,
}

impl AppState {
    pub fn new(store: SharedStore, router: TopicRouter) -> Self {
        Self {
            store: Arc::new(store),
            router: Arc::new(router),
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "tiercache",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// StreamableHTTP command handler
///
/// Command failures are reported in the envelope with `success: false`;
/// only malformed envelopes are rejected by the JSON extractor.
pub async fn command_handler(
    State(state): State<AppState>,
    Json(request): Json<Request>,
) -> Json<Response> {
    debug!(
        "Command: {} (request_id={})",
        request.command, request.request_id
    );

    Json(handle_command(&state, request))
}

fn handle_command(state: &AppState, request: Request) -> Response {
    let result = match request.command.as_str() {
        "kv.set" => handle_kv_set_cmd(state, &request.payload),
        "kv.get" => handle_kv_get_cmd(state, &request.payload),
        "kv.del" => handle_kv_del_cmd(state, &request.payload),
        "kv.exists" => handle_kv_exists_cmd(state, &request.payload),
        "kv.keys" => handle_kv_keys_cmd(state, &request.payload),
        "kv.stats" => handle_kv_stats_cmd(state),
        "pubsub.publish" => handle_pubsub_publish_cmd(state, &request.payload),
        "pubsub.topics" => handle_pubsub_topics_cmd(state),
        "pubsub.stats" => handle_pubsub_stats_cmd(state),
        _ => Err(StoreError::UnknownCommand(request.command.clone())),
    };

    match result {
        Ok(payload) => Response::success(request.request_id, payload),
        Err(e) => {
            error!("Command {} failed: {}", request.command, e);
            Response::error(request.request_id, e.to_string())
        }
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, StoreError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidRequest(format!("Missing '{}' field", field)))
}

fn handle_kv_set_cmd(state: &AppState, payload: &Value) -> Result<Value, StoreError> {
    let key = required_str(payload, "key")?;
    let value = payload
        .get("value")
        .ok_or_else(|| StoreError::InvalidRequest("Missing 'value' field".to_string()))?;

    let ttl = match payload.get("ttl") {
        None | Some(Value::Null) => None,
        Some(ttl) => Some(ttl.as_u64().ok_or_else(|| {
            StoreError::InvalidRequest("'ttl' must be a whole number of seconds".to_string())
        })?),
    };

    // strings are stored verbatim so kv.get hands back exactly what was set
    let bytes = match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    };

    state.store.set(key, bytes, ttl)?;
    Ok(json!({ "success": true }))
}

fn handle_kv_get_cmd(state: &AppState, payload: &Value) -> Result<Value, StoreError> {
    let key = required_str(payload, "key")?;

    match state.store.get(key) {
        Some(bytes) => {
            let value = String::from_utf8(bytes).map_err(|e| {
                StoreError::InvalidValue(format!(
                    "value for {} is not UTF-8 ({} bytes)",
                    key,
                    e.as_bytes().len()
                ))
            })?;
            Ok(Value::String(value))
        }
        None => Ok(Value::Null),
    }
}

fn handle_kv_del_cmd(state: &AppState, payload: &Value) -> Result<Value, StoreError> {
    let key = required_str(payload, "key")?;
    Ok(json!({ "deleted": state.store.delete(key) }))
}

fn handle_kv_exists_cmd(state: &AppState, payload: &Value) -> Result<Value, StoreError> {
    let key = required_str(payload, "key")?;
    Ok(json!({ "exists": state.store.exists(key) }))
}

fn handle_kv_keys_cmd(state: &AppState, payload: &Value) -> Result<Value, StoreError> {
    let prefix = payload.get("prefix").and_then(Value::as_str);
    let limit = payload
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(100);

    let keys = state.store.scan(prefix, limit);
    Ok(json!({
        "count": keys.len(),
        "keys": keys,
    }))
}

fn handle_kv_stats_cmd(state: &AppState) -> Result<Value, StoreError> {
    let stats = state.store.stats();

    Ok(json!({
        "total_keys": stats.total_keys,
        "total_memory_bytes": stats.total_memory_bytes,
        "operations": {
            "gets": stats.gets,
            "sets": stats.sets,
            "dels": stats.dels,
            "hits": stats.hits,
            "misses": stats.misses,
            "expired": stats.expired,
        },
        "hit_rate": stats.hit_rate()
    }))
}

fn handle_pubsub_publish_cmd(state: &AppState, payload: &Value) -> Result<Value, StoreError> {
    let topic = required_str(payload, "topic")?;
    let message = payload
        .get("payload")
        .ok_or_else(|| StoreError::InvalidRequest("Missing 'payload' field".to_string()))?
        .clone();

    let result = state.router.publish(topic, message)?;

    Ok(json!({
        "message_id": result.message_id,
        "topic": result.topic,
        "subscribers_matched": result.subscribers_matched
    }))
}

fn handle_pubsub_topics_cmd(state: &AppState) -> Result<Value, StoreError> {
    let topics = state.router.list_topics();
    Ok(json!({
        "count": topics.len(),
        "topics": topics,
    }))
}

fn handle_pubsub_stats_cmd(state: &AppState) -> Result<Value, StoreError> {
    serde_json::to_value(state.router.stats())
        .map_err(|e| StoreError::InvalidValue(e.to_string()))
}

/// WebSocket handler for invalidation subscriptions
/// GET /pubsub/ws?topics=Cache,cache.#
pub async fn pubsub_websocket(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> AxumResponse {
    let topics: Vec<String> = params
        .get("topics")
        .map(|raw| {
            raw.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if topics.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "At least one topic required in query param: ?topics=topic1,topic2",
        )
            .into_response();
    }

    info!("WebSocket connection requested for topics: {:?}", topics);

    let router = state.router.clone();
    ws.on_upgrade(move |socket| handle_pubsub_socket(socket, router, topics))
}

async fn handle_pubsub_socket(socket: WebSocket, router: Arc<TopicRouter>, topics: Vec<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let subscribe_result = match router.subscribe(topics.clone()) {
        Ok(result) => result,
        Err(e) => {
            warn!("Rejected subscription to {:?}: {}", topics, e);
            let frame = json!({ "type": "error", "error": e.to_string() });
            let _ = ws_sender.send(WsMessage::Text(frame.to_string().into())).await;
            let _ = ws_sender.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let subscriber_id = subscribe_result.subscriber_id.clone();

    // registered before the welcome frame so nothing published after it is lost
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    router.register_connection(subscriber_id.clone(), tx);

    let welcome = json!({
        "type": "connected",
        "subscriber_id": subscriber_id,
        "topics": topics,
        "subscription_count": subscribe_result.subscription_count
    });

    if ws_sender
        .send(WsMessage::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        warn!("Failed to send welcome message to subscriber: {}", subscriber_id);
        router.unregister_connection(&subscriber_id);
        router.unsubscribe(&subscriber_id);
        return;
    }

    info!("Subscriber {} connected to topics: {:?}", subscriber_id, topics);

    loop {
        tokio::select! {
            Some(message) = rx.recv() => {
                let frame = json!({
                    "type": "message",
                    "message_id": message.id,
                    "topic": message.topic,
                    "payload": message.payload,
                    "timestamp": message.timestamp
                });

                if ws_sender
                    .send(WsMessage::Text(frame.to_string().into()))
                    .await
                    .is_err()
                {
                    warn!("Failed to send message to subscriber: {}", subscriber_id);
                    break;
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Subscriber {} closed connection", subscriber_id);
                        break;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if ws_sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for subscriber {}: {}", subscriber_id, e);
                        break;
                    }
                }
            }
        }
    }

    router.unregister_connection(&subscriber_id);
    router.unsubscribe(&subscriber_id);
    info!("Subscriber {} disconnected and cleaned up", subscriber_id);
}
