use super::{MessageStream, Transport, TransportError, TransportMessage};
use async_nats::connection::State;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// NATS provider. The broadcast and request/reply channels are separate
/// connections so a stalled subscriber cannot delay command delivery.
pub struct NatsTransport {
    broadcast_url: String,
    rpc_url: String,
    broadcast: RwLock<async_nats::Client>,
    rpc: RwLock<async_nats::Client>,
}

impl NatsTransport {
    pub async fn connect(broadcast_url: &str, rpc_url: &str) -> Result<Self, TransportError> {
        let broadcast = Self::open(broadcast_url).await?;
        let rpc = Self::open(rpc_url).await?;
        info!(broadcast_url, rpc_url, "✅ Connected to NATS");
        Ok(Self {
            broadcast_url: broadcast_url.to_string(),
            rpc_url: rpc_url.to_string(),
            broadcast: RwLock::new(broadcast),
            rpc: RwLock::new(rpc),
        })
    }

    async fn open(url: &str) -> Result<async_nats::Client, TransportError> {
        async_nats::connect(url).await.map_err(|e| {
            error!("❌ Failed to connect to NATS at {}: {}", url, e);
            TransportError::Connection(format!("{}: {}", url, e))
        })
    }

    fn broadcast_client(&self) -> async_nats::Client {
        self.broadcast.read().clone()
    }

    fn rpc_client(&self) -> async_nats::Client {
        self.rpc.read().clone()
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.broadcast_client();
        client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        client.flush().await.map_err(|e| TransportError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        })
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, TransportError> {
        let subscriber = self
            .broadcast_client()
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        info!("👂 Subscribed to '{}'", subject);

        let stream = subscriber.map(|msg| TransportMessage {
            subject: msg.subject.to_string(),
            payload: msg.payload.to_vec(),
        });
        Ok(Box::pin(stream))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let client = self.rpc_client();
        match tokio::time::timeout(timeout, client.request(subject.to_string(), payload.into()))
            .await
        {
            Ok(Ok(reply)) => Ok(reply.payload.to_vec()),
            Ok(Err(e)) => Err(TransportError::Request {
                subject: subject.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        warn!("🔄 Reconnecting NATS broadcast and request channels");
        let broadcast = Self::open(&self.broadcast_url).await?;
        let rpc = Self::open(&self.rpc_url).await?;
        *self.broadcast.write() = broadcast;
        *self.rpc.write() = rpc;
        info!("✅ NATS channels re-established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.broadcast.read().connection_state(), State::Connected)
            && matches!(self.rpc.read().connection_state(), State::Connected)
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}
