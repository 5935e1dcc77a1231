//! HTTP implementation of the outbound half of [`super::Transport`],
//! grounded on the teacher's `QueueClient`/`SubscriptionClient` request
//! builders: one shared client, explicit header construction, and a single
//! place (`classify`) that normalizes HTTP/transport failures into the
//! closed error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::Credentials;
use crate::error::TransportError;
use crate::ids::TopicName;
use crate::message::Message;

use super::{SubscriptionKind, Transport};

/// Transport backed by a pooled [`reqwest::Client`].
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::ConnectionRefused
    } else if err.is_timeout() || err.is_request() {
        TransportError::Transport(err.to_string())
    } else if err
        .to_string()
        .to_ascii_lowercase()
        .contains("dns")
    {
        TransportError::NameResolution
    } else {
        TransportError::Transport(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED => TransportError::Unauthorized,
        StatusCode::UNPROCESSABLE_ENTITY => TransportError::NotAcknowledged,
        s if s.is_client_error() => TransportError::InvalidRequest(body),
        _ => TransportError::Transport(format!("server returned {status}: {body}")),
    }
}

fn apply_credentials(
    mut builder: reqwest::RequestBuilder,
    credentials: Option<&Credentials>,
) -> reqwest::RequestBuilder {
    if let Some(Credentials::Basic { username, password }) = credentials {
        builder = builder.basic_auth(username, Some(password));
    }
    builder
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_message(
        &self,
        destination: &str,
        message: &Message,
        credentials: Option<&Credentials>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let id = message
            .id()
            .ok_or_else(|| TransportError::InvalidRequest("message has no MessageId header".into()))?;
        let encoded_id = utf8_percent_encode(&id.to_string(), NON_ALPHANUMERIC).to_string();
        let url = format!("{}/message/{}", destination.trim_end_matches('/'), encoded_id);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", message.headers().content_type())
            .body(message.content().to_vec());
        for (name, value) in message.headers().iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = apply_credentials(builder, credentials);

        let send = builder.send();
        let resp = tokio::select! {
            r = send => r.map_err(|e| classify(&e))?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }

    async fn send_subscription_request(
        &self,
        kind: SubscriptionKind,
        publisher: &str,
        credentials: Option<&Credentials>,
        topic: &TopicName,
        subscriber_uri: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let encoded_topic = utf8_percent_encode(topic.as_str(), NON_ALPHANUMERIC).to_string();
        let encoded_uri = utf8_percent_encode(subscriber_uri, NON_ALPHANUMERIC).to_string();
        let mut url = format!(
            "{}/topic/{}/subscriber?uri={}",
            publisher.trim_end_matches('/'),
            encoded_topic,
            encoded_uri
        );
        if let Some(ttl) = ttl {
            url.push_str(&format!("&ttl={}", ttl.as_secs()));
        }

        let mut builder = match kind {
            SubscriptionKind::Add => self.client.post(&url),
            SubscriptionKind::Remove => self.client.delete(&url),
        };
        builder = apply_credentials(builder, credentials);

        let send = builder.send();
        let resp = tokio::select! {
            r = send => r.map_err(|e| classify(&e))?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_closed_set() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            TransportError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            TransportError::NotAcknowledged
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, String::new()),
            TransportError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            TransportError::Transport(_)
        ));
    }
}
