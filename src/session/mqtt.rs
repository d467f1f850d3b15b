//! MQTT signaling transport (public broker, TLS)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flume::Sender;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{SignalingTransport, Subscription};
use crate::error::{Error, Result};
use crate::BrokerConfig;

type Routes = Arc<Mutex<HashMap<String, Vec<Sender<Bytes>>>>>;

/// Broker connection shared by every session of the process.
///
/// The event loop runs on a background task and reconnects on its own;
/// incoming publishes are routed to subscribers by exact topic match.
pub struct MqttTransport {
    client: AsyncClient,
    routes: Routes,
    cancel: CancellationToken,
}

impl MqttTransport {
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: &BrokerConfig) -> Self {
        let client_id = format!("periscope-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        let routes: Routes = Arc::default();
        let cancel = CancellationToken::new();

        info!(
            "Connecting to signaling broker {}:{} (tls: {})",
            config.host, config.port, config.tls
        );
        tokio::spawn(drive(eventloop, Arc::clone(&routes), cancel.clone()));

        Self {
            client,
            routes,
            cancel,
        }
    }
}

async fn drive(mut eventloop: EventLoop, routes: Routes, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("Broker message on {} ({} bytes)", publish.topic, publish.payload.len());
                    route(&routes, &publish.topic, publish.payload);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Signaling broker connected"),
                Ok(_) => {}
                Err(e) => {
                    warn!("Signaling broker connection error: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }
    debug!("Broker event loop stopped");
}

fn route(routes: &Mutex<HashMap<String, Vec<Sender<Bytes>>>>, topic: &str, payload: Bytes) {
    let mut routes = routes.lock();
    if let Some(subscribers) = routes.get_mut(topic) {
        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        if subscribers.is_empty() {
            routes.remove(topic);
        }
    }
}

#[async_trait]
impl SignalingTransport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic, QoS::ExactlyOnce, false, payload.to_vec())
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = flume::unbounded();
        self.routes
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        self.client
            .subscribe(topic, QoS::ExactlyOnce)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(rx)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_exact_topic_and_prunes_closed() {
        let routes: Routes = Arc::default();
        let (tx, rx) = flume::unbounded();
        let (dead_tx, dead_rx) = flume::unbounded();
        drop(dead_rx);
        routes
            .lock()
            .insert("a/answer".into(), vec![tx, dead_tx]);

        route(&routes, "a/answer/extra", Bytes::from_static(b"no"));
        route(&routes, "a/answer", Bytes::from_static(b"yes"));

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"yes"));
        assert!(rx.try_recv().is_err());
        assert_eq!(routes.lock()["a/answer"].len(), 1);
    }
}
