use super::{MessageStream, Transport, TransportError, TransportMessage, subject_matches};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// A request waiting for its single responder.
#[derive(Debug)]
pub struct PendingRequest {
    pub subject: String,
    pub payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl PendingRequest {
    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.reply.send(payload);
    }
}

/// In-process provider used by tests and single-node setups.
///
/// Broadcasts fan out through a tokio broadcast channel. Requests are routed
/// to the responder registered for the exact subject.
pub struct InMemoryTransport {
    bus: broadcast::Sender<TransportMessage>,
    responders: DashMap<String, mpsc::Sender<PendingRequest>>,
    published: Mutex<Vec<TransportMessage>>,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    reconnects: AtomicU32,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            bus,
            responders: DashMap::new(),
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
        }
    }

    /// Become the responder for `subject`. Replaces any previous responder.
    pub fn register_responder(&self, subject: &str) -> mpsc::Receiver<PendingRequest> {
        let (tx, rx) = mpsc::channel(64);
        self.responders.insert(subject.to_string(), tx);
        rx
    }

    pub fn remove_responder(&self, subject: &str) {
        self.responders.remove(subject);
    }

    /// Every successful publish so far.
    pub fn published(&self) -> Vec<TransportMessage> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, subject: &str) -> Vec<TransportMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    /// Make publishes fail until reset or reconnect.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() || self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                subject: subject.to_string(),
                reason: "link down".into(),
            });
        }
        let message = TransportMessage {
            subject: subject.to_string(),
            payload,
        };
        self.published.lock().push(message.clone());
        // No subscribers is not an error for a broadcast
        let _ = self.bus.send(message);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, TransportError> {
        let pattern = subject.to_string();
        let rx = self.bus.subscribe();
        let stream = futures::stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if subject_matches(&pattern, &msg.subject) => {
                        return Some((msg, (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Request {
                subject: subject.to_string(),
                reason: "link down".into(),
            });
        }
        let responder = self
            .responders
            .get(subject)
            .map(|r| r.value().clone())
            .ok_or_else(|| TransportError::NoResponder(subject.to_string()))?;

        let (reply, rx) = oneshot::channel();
        responder
            .send(PendingRequest {
                subject: subject.to_string(),
                payload,
                reply,
            })
            .await
            .map_err(|_| TransportError::NoResponder(subject.to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(TransportError::Request {
                subject: subject.to_string(),
                reason: "responder dropped the request".into(),
            }),
            Err(_) => Err(TransportError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
