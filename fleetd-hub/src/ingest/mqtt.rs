use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, SubscribeReasonCode, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ulid::Ulid;

use super::{BrokerEvent, BrokerReceiver};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT broker subscription. The event loop reconnects forever; connection
/// state transitions are surfaced as `Connected`/`Disconnected` events.
pub struct MqttReceiver {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub reject_unauthorized: bool,
    pub client_id: Option<String>,
    pub topic: String,
}

#[async_trait]
impl BrokerReceiver for MqttReceiver {
    type Error = Infallible;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BrokerEvent>, Self::Error> {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("fleetd-{}", Ulid::new()));

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        if self.use_tls {
            if !self.reject_unauthorized {
                warn!("certificate verification cannot be disabled with the rustls transport");
            }
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(256);
        let topic = self.topic.clone();
        let host = self.host.clone();
        let port = self.port;

        tokio::spawn(async move {
            info!(%host, port, %topic, "mqtt receiver started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("closing broker connection");
                        let _ = client.disconnect().await;
                        break;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("broker connected, subscribing");
                            if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                error!(error = %e, "failed to queue subscription");
                            }
                            if tx.send(BrokerEvent::Connected).await.is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                            let refused = ack
                                .return_codes
                                .iter()
                                .all(|code| matches!(code, SubscribeReasonCode::Failure));
                            if refused {
                                error!(%topic, "broker refused the subscription");
                                std::process::exit(1);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let event = BrokerEvent::Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "broker connection error, retrying");
                            if tx.send(BrokerEvent::Disconnected).await.is_err() {
                                break;
                            }
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
