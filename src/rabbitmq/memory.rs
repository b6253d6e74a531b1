//! In-memory broker
//!
//! Synthetic `BrokerDriver` for tests and local runs. Queues are created on
//! first use, deliveries go round-robin to the queue's consumers and every
//! publish and settlement is recorded for inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::delivery::DeliveryArgs;
use super::driver::{
    BrokerDriver, DriverAcker, DriverChannel, DriverConnection, InboundDelivery, InboundStream,
};
use super::errors::{BrokerError, DriverError};
use super::message::{MessageProperties, Publishing};
use crate::config::DialConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory broker refused the connection: {0}")]
    DialRefused(String),

    #[error("memory broker: connection is not open")]
    ConnectionClosed,

    #[error("memory broker: channel is not open")]
    ChannelClosed,
}

/// A publish as seen by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub message: Publishing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool, requeue: bool },
    Reject { delivery_tag: u64, requeue: bool },
}

struct Consumer {
    tag: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<InboundDelivery>,
}

#[derive(Default)]
struct BrokerState {
    refuse_dial: Option<String>,
    published: Vec<PublishedMessage>,
    settlements: Vec<Settlement>,
    consumers: HashMap<String, Vec<Consumer>>,
    close_notifiers: HashMap<u64, Vec<mpsc::UnboundedSender<DriverError>>>,
    prefetch: HashMap<u64, u16>,
    next_consumer: HashMap<String, usize>,
}

struct Shared {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
    next_delivery_tag: AtomicU64,
    next_channel_id: AtomicU64,
}

/// In-memory broker. Clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        info!("Initializing in-memory broker");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                connected: AtomicBool::new(true),
                next_delivery_tag: AtomicU64::new(1),
                next_channel_id: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-update.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following dial fail with `reason`.
    pub fn refuse_dial(&self, reason: &str) {
        self.state().refuse_dial = Some(reason.to_string());
    }

    /// Hands a message to one consumer of `queue`. Returns the delivery tag,
    /// or `None` when nobody consumes the queue.
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) -> Option<u64> {
        self.deliver_with(queue, MessageProperties::default(), body)
    }

    pub fn deliver_with(
        &self,
        queue: &str,
        properties: MessageProperties,
        body: impl Into<Vec<u8>>,
    ) -> Option<u64> {
        let mut state = self.state();
        let start = state.next_consumer.get(queue).copied().unwrap_or(0);
        let consumers = state.consumers.get_mut(queue)?;
        consumers.retain(|c| !c.sender.is_closed());
        if consumers.is_empty() {
            return None;
        }

        let consumer = &consumers[start % consumers.len()];
        let delivery_tag = self.shared.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = InboundDelivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: queue.to_string(),
            redelivered: false,
            properties,
            body: body.into(),
            acker: Box::new(MemoryAcker {
                broker: self.clone(),
                delivery_tag,
            }),
        };
        debug!(
            queue = %queue,
            consumer_tag = %consumer.tag,
            delivery_tag,
            "memory broker delivering"
        );
        let sent = consumer.sender.send(delivery).is_ok();
        state
            .next_consumer
            .insert(queue.to_string(), start.wrapping_add(1));
        sent.then_some(delivery_tag)
    }

    /// Broker-side cancel of every consumer of `queue`; their streams end.
    pub fn cancel_consumers(&self, queue: &str) {
        self.state().consumers.remove(queue);
    }

    /// Raises a close notification on every open channel.
    pub fn emit_close(&self, error: BrokerError) {
        let state = self.state();
        for notifier in state.close_notifiers.values().flatten() {
            let _ = notifier.send(DriverError::from(error.clone()));
        }
    }

    /// Simulates the broker dropping the connection: streams and close
    /// notifications end, further operations fail.
    pub fn shutdown(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let mut state = self.state();
        state.consumers.clear();
        state.close_notifiers.clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .consumers
            .get(queue)
            .map_or(0, |consumers| consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    pub fn prefetch(&self, channel_id: u64) -> Option<u16> {
        self.state().prefetch.get(&channel_id).copied()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn settle(&self, settlement: Settlement) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(MemoryError::ConnectionClosed.into());
        }
        self.state().settlements.push(settlement);
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerDriver for MemoryBroker {
    async fn dial(
        &self,
        _url: &str,
        _config: &DialConfig,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        if let Some(reason) = self.state().refuse_dial.clone() {
            return Err(MemoryError::DialRefused(reason).into());
        }
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn DriverChannel>, DriverError> {
        if !self.broker.is_connected() {
            return Err(MemoryError::ConnectionClosed.into());
        }
        let id = self.broker.shared.next_channel_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    async fn close(&self, _code: u16, _reason: &str) -> Result<(), DriverError> {
        self.broker.shutdown();
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if !self.broker.is_connected() {
            return Err(MemoryError::ConnectionClosed.into());
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(MemoryError::ChannelClosed.into());
        }
        Ok(())
    }
}

#[async_trait]
impl DriverChannel for MemoryChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.broker.state().published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            immediate,
            message,
        });
        Ok(())
    }

    async fn consume(&self, args: &DeliveryArgs) -> Result<InboundStream, DriverError> {
        self.ensure_open()?;
        let tag = if args.consumer_tag.is_empty() {
            format!("amq.ctag-{}", uuid::Uuid::new_v4().simple())
        } else {
            args.consumer_tag.clone()
        };

        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.broker
            .state()
            .consumers
            .entry(args.queue.clone())
            .or_default()
            .push(Consumer {
                tag,
                channel_id: self.id,
                sender,
            });

        Ok(futures::stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    fn notify_close(&self) -> mpsc::UnboundedReceiver<DriverError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if self.ensure_open().is_ok() {
            self.broker
                .state()
                .close_notifiers
                .entry(self.id)
                .or_default()
                .push(sender);
        }
        receiver
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.broker.state().prefetch.insert(self.id, prefetch_count);
        Ok(())
    }

    async fn close(&self, _code: u16, _reason: &str) -> Result<(), DriverError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.state();
        state.close_notifiers.remove(&self.id);
        for consumers in state.consumers.values_mut() {
            consumers.retain(|c| c.channel_id != self.id);
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    delivery_tag: u64,
}

#[async_trait]
impl DriverAcker for MemoryAcker {
    async fn ack(&self, multiple: bool) -> Result<(), DriverError> {
        self.broker.settle(Settlement::Ack {
            delivery_tag: self.delivery_tag,
            multiple,
        })
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), DriverError> {
        self.broker.settle(Settlement::Nack {
            delivery_tag: self.delivery_tag,
            multiple,
            requeue,
        })
    }

    async fn reject(&self, requeue: bool) -> Result<(), DriverError> {
        self.broker.settle(Settlement::Reject {
            delivery_tag: self.delivery_tag,
            requeue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        let conn = broker.dial("amqp://host", &DialConfig::default()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let mut first = channel.consume(&DeliveryArgs::new("q")).await.unwrap();
        let mut second = channel.consume(&DeliveryArgs::new("q")).await.unwrap();
        assert_eq!(broker.consumer_count("q"), 2);

        broker.deliver("q", "a").unwrap();
        broker.deliver("q", "b").unwrap();

        assert_eq!(first.next().await.unwrap().body, b"a".to_vec());
        assert_eq!(second.next().await.unwrap().body, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_round_robin_is_kept_per_queue() {
        let broker = MemoryBroker::new();
        let conn = broker.dial("amqp://host", &DialConfig::default()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let mut orders_a = channel.consume(&DeliveryArgs::new("orders")).await.unwrap();
        let mut orders_b = channel.consume(&DeliveryArgs::new("orders")).await.unwrap();
        let mut audit_a = channel.consume(&DeliveryArgs::new("audit")).await.unwrap();
        let mut audit_b = channel.consume(&DeliveryArgs::new("audit")).await.unwrap();

        broker.deliver("orders", "o1").unwrap();
        broker.deliver("audit", "a1").unwrap();
        broker.deliver("orders", "o2").unwrap();
        broker.deliver("audit", "a2").unwrap();

        assert_eq!(orders_a.next().await.unwrap().body, b"o1".to_vec());
        assert_eq!(orders_b.next().await.unwrap().body, b"o2".to_vec());
        assert_eq!(audit_a.next().await.unwrap().body, b"a1".to_vec());
        assert_eq!(audit_b.next().await.unwrap().body, b"a2".to_vec());
    }

    #[tokio::test]
    async fn test_deliver_without_consumers() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.deliver("nobody", "x"), None);
    }

    #[tokio::test]
    async fn test_channel_close_ends_notifications_and_streams() {
        let broker = MemoryBroker::new();
        let conn = broker.dial("amqp://host", &DialConfig::default()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let mut notifications = channel.notify_close();
        let mut stream = channel.consume(&DeliveryArgs::new("q")).await.unwrap();
        channel.close(0, "bye").await.unwrap();

        assert!(notifications.recv().await.is_none());
        assert!(stream.next().await.is_none());
        assert!(channel.qos(5).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_fails_settlement() {
        let broker = MemoryBroker::new();
        let conn = broker.dial("amqp://host", &DialConfig::default()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let mut stream = channel.consume(&DeliveryArgs::new("q")).await.unwrap();

        broker.deliver("q", "x").unwrap();
        let delivery = stream.next().await.unwrap();
        broker.shutdown();

        assert!(delivery.acker.ack(false).await.is_err());
        assert!(!conn.is_connected());
        assert!(stream.next().await.is_none());
    }
}
