//! The long-lived outbound subscription-renewal worker (spec §4.6
//! "Subscription maintenance"): one task per configured subscription.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Credentials;
use crate::error::TransportError;
use crate::ids::TopicName;
use crate::transport::{SubscriptionKind, Transport};

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(30);

/// Everything one renewal task needs, resolved once at spawn time (spec §5:
/// endpoints/topics/subscriptions are immutable after `Init`).
pub struct SubscriptionWorkerConfig {
    pub publisher_uri: String,
    pub credentials: Option<Credentials>,
    pub topic: TopicName,
    pub subscriber_uri: String,
    pub ttl: Option<Duration>,
}

/// Runs until the subscription is non-renewing (`ttl` is `None`), a
/// terminal error occurs, or `cancel` fires.
pub async fn run(transport: Arc<dyn Transport>, config: SubscriptionWorkerConfig, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let result = transport
            .send_subscription_request(
                SubscriptionKind::Add,
                &config.publisher_uri,
                config.credentials.as_ref(),
                &config.topic,
                &config.subscriber_uri,
                config.ttl,
                &cancel,
            )
            .await;

        match result {
            Ok(()) => {
                info!(topic = %config.topic, publisher = %config.publisher_uri, "subscription renewed");
                match config.ttl {
                    None => return,
                    Some(ttl) => {
                        tokio::select! {
                            _ = tokio::time::sleep(ttl / 2) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
            }
            Err(TransportError::NameResolution | TransportError::ConnectionRefused | TransportError::Transport(_)) => {
                warn!(topic = %config.topic, publisher = %config.publisher_uri, "transient subscription error, retrying in 30s");
                tokio::select! {
                    _ = tokio::time::sleep(TRANSIENT_BACKOFF) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e @ (TransportError::InvalidRequest(_) | TransportError::Unauthorized)) => {
                error!(topic = %config.topic, publisher = %config.publisher_uri, error = %e, "terminal subscription error, giving up");
                return;
            }
            Err(TransportError::NotAcknowledged) => {
                error!(topic = %config.topic, publisher = %config.publisher_uri, "subscription request not acknowledged, giving up");
                return;
            }
            Err(TransportError::Cancelled) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyTransport {
        fail_times: u32,
        calls: AtomicU32,
        results: Mutex<Vec<TransportError>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send_message(
            &self,
            _destination: &str,
            _message: &crate::message::Message,
            _credentials: Option<&Credentials>,
            _cancel: &CancellationToken,
        ) -> Result<(), TransportError> {
            unimplemented!()
        }

        async fn send_subscription_request(
            &self,
            _kind: SubscriptionKind,
            _publisher: &str,
            _credentials: Option<&Credentials>,
            _topic: &TopicName,
            _subscriber_uri: &str,
            _ttl: Option<Duration>,
            _cancel: &CancellationToken,
        ) -> Result<(), TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(TransportError::InvalidRequest("bad request".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn terminal_error_stops_the_worker() {
        let transport: Arc<dyn Transport> = Arc::new(FlakyTransport {
            fail_times: 1,
            calls: AtomicU32::new(0),
            results: Mutex::new(vec![]),
        });
        let cancel = CancellationToken::new();
        let config = SubscriptionWorkerConfig {
            publisher_uri: "https://a/".into(),
            credentials: None,
            topic: TopicName::from("T0"),
            subscriber_uri: "https://b/".into(),
            ttl: Some(Duration::from_secs(60)),
        };
        // InvalidRequest on first call is terminal: worker returns promptly.
        tokio::time::timeout(Duration::from_millis(200), run(transport, config, cancel))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_ttl_subscription_does_not_renew() {
        let transport: Arc<dyn Transport> = Arc::new(FlakyTransport {
            fail_times: 0,
            calls: AtomicU32::new(0),
            results: Mutex::new(vec![]),
        });
        let cancel = CancellationToken::new();
        let config = SubscriptionWorkerConfig {
            publisher_uri: "https://a/".into(),
            credentials: None,
            topic: TopicName::from("T0"),
            subscriber_uri: "https://b/".into(),
            ttl: None,
        };
        tokio::time::timeout(Duration::from_millis(200), run(transport, config, cancel))
            .await
            .unwrap();
    }
}
