pub mod mock;
pub mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events delivered by a broker connection.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// One published payload on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The connection (re)established and the subscription is active.
    Connected,
    /// The connection dropped; the receiver keeps retrying.
    Disconnected,
}

/// Source of broker events.
///
/// Implementations spawn background tasks that feed the returned channel
/// until the cancellation token fires.
#[async_trait]
pub trait BrokerReceiver: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BrokerEvent>, Self::Error>;
}

/// Match a topic against an MQTT filter (`+` single level, `#` tail).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
