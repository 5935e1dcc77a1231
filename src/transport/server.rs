//! HTTP front-end implementing the three routes from spec §6. Built as a
//! standalone `axum::Router` so the embedding application can mount it
//! under its own server (or run it standalone via [`serve`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, post};
use axum::Router;
use percent_encoding::percent_decode_str;

use crate::error::TransportError;
use crate::ids::TopicName;
use crate::message::{Headers, Message};

use super::{InboundObserver, SubscriptionKind};

#[derive(Clone)]
struct ServerState {
    observer: Arc<dyn InboundObserver>,
}

/// Build the router. `unescapeRequestUrl`-style rewriting is avoided by
/// extracting path segments raw and decoding them exactly once here.
pub fn router(observer: Arc<dyn InboundObserver>) -> Router {
    let state = ServerState { observer };
    Router::new()
        .route("/message/:id", post(accept_message))
        .route(
            "/topic/:topic/subscriber",
            post(add_subscriber).delete(remove_subscriber),
        )
        .with_state(state)
}

/// Convenience: bind and serve the router on `addr` until `shutdown` resolves.
pub async fn serve(
    observer: Arc<dyn InboundObserver>,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(observer))
        .with_graceful_shutdown(shutdown)
        .await
}

fn transport_error_status(err: &TransportError) -> StatusCode {
    match err {
        TransportError::Unauthorized => StatusCode::UNAUTHORIZED,
        TransportError::NotAcknowledged => StatusCode::UNPROCESSABLE_ENTITY,
        TransportError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        TransportError::NameResolution | TransportError::ConnectionRefused => StatusCode::BAD_GATEWAY,
        TransportError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TransportError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn headers_from_http(raw_id: &str, headers: &HeaderMap) -> Headers {
    let mut h = Headers::new();
    let decoded_id = percent_decode_str(raw_id).decode_utf8_lossy().to_string();
    h.insert("MessageId", decoded_id);
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            h.insert(name.as_str(), v.to_string());
        }
    }
    h
}

async fn accept_message(
    State(state): State<ServerState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let sender_identity = headers
        .get("X-Sender-Identity")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let msg_headers = headers_from_http(&raw_id, &headers);
    let message = Message::new(msg_headers, body.to_vec());

    match state.observer.accept_message(message, sender_identity).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => transport_error_status(&e),
    }
}

async fn add_subscriber(
    State(state): State<ServerState>,
    Path(raw_topic): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> StatusCode {
    subscription_request(state, raw_topic, params, headers, SubscriptionKind::Add).await
}

async fn remove_subscriber(
    State(state): State<ServerState>,
    Path(raw_topic): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> StatusCode {
    subscription_request(state, raw_topic, params, headers, SubscriptionKind::Remove).await
}

async fn subscription_request(
    state: ServerState,
    raw_topic: String,
    params: HashMap<String, String>,
    headers: HeaderMap,
    kind: SubscriptionKind,
) -> StatusCode {
    let topic = percent_decode_str(&raw_topic).decode_utf8_lossy().to_string();
    let Some(uri) = params.get("uri").cloned() else {
        return StatusCode::BAD_REQUEST;
    };
    let ttl = params
        .get("ttl")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    let sender_identity = headers
        .get("X-Sender-Identity")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match state
        .observer
        .accept_subscription_request(kind, TopicName::from(topic.as_str()), uri, ttl, sender_identity)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(e) => transport_error_status(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec_taxonomy() {
        assert_eq!(transport_error_status(&TransportError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            transport_error_status(&TransportError::NotAcknowledged),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
