// src/rabbitmq/delivery.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use lapin::types::FieldTable;

use super::driver::{DriverAcker, InboundDelivery};
use super::errors::{AmqpError, DriverError, Result};
use super::message::MessageProperties;

/// Arguments for opening one consume subscription on a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryArgs {
    /// Queue name, must not be empty.
    pub queue: String,
    /// Consumer tag. When empty the broker generates a random one.
    pub consumer_tag: String,
    /// Let the broker consider messages settled as soon as they are sent.
    pub auto_ack: bool,
    /// Request exclusive access to the queue.
    pub exclusive: bool,
    pub nowait: bool,
    /// Broker-specific arguments.
    pub args: FieldTable,
}

impl DeliveryArgs {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn nowait(mut self, nowait: bool) -> Self {
        self.nowait = nowait;
        self
    }

    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue.trim().is_empty() {
            return Err(AmqpError::InvalidArgs("queue name cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// One inbound message. It is settled exactly once through `ack`, `nack`
/// or `reject`; any further attempt fails with `AlreadyFinalized`. A settlement
/// the driver fails to deliver leaves the message unsettled, so it can be retried.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    acker: Box<dyn DriverAcker>,
    settled: AtomicBool,
}

impl Delivery {
    /// Wraps a driver delivery. Deliveries from an auto-ack subscription are
    /// already settled by the broker.
    pub(crate) fn from_inbound(inbound: InboundDelivery, auto_ack: bool) -> Self {
        Self {
            delivery_tag: inbound.delivery_tag,
            exchange: inbound.exchange,
            routing_key: inbound.routing_key,
            redelivered: inbound.redelivered,
            properties: inbound.properties,
            body: inbound.body,
            acker: inbound.acker,
            settled: AtomicBool::new(auto_ack),
        }
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledges the delivery. Not cancellable once issued.
    pub async fn ack(&self, multiple: bool) -> Result<()> {
        self.settle()?;
        let outcome = self.acker.ack(multiple).await;
        self.finish(outcome)
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.settle()?;
        let outcome = self.acker.nack(multiple, requeue).await;
        self.finish(outcome)
    }

    /// Rejects the delivery. Not cancellable once issued.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        let outcome = self.acker.reject(requeue).await;
        self.finish(outcome)
    }

    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyFinalized(self.delivery_tag));
        }
        Ok(())
    }

    fn finish(&self, outcome: std::result::Result<(), DriverError>) -> Result<()> {
        outcome.map_err(|err| {
            self.settled.store(false, Ordering::SeqCst);
            AmqpError::Broker(err)
        })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}
