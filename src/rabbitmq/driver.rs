// src/rabbitmq/driver.rs
// Capability surface a concrete broker client has to provide.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use super::delivery::DeliveryArgs;
use super::errors::DriverError;
use super::message::{MessageProperties, Publishing};
use crate::config::DialConfig;

/// One message as handed over by the driver, before the core wraps it.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub acker: Box<dyn DriverAcker>,
}

/// Deliveries in broker order. Ends when the broker closes the subscription.
pub type InboundStream = BoxStream<'static, InboundDelivery>;

#[async_trait]
pub trait BrokerDriver: Send + Sync {
    async fn dial(
        &self,
        url: &str,
        config: &DialConfig,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}

#[async_trait]
pub trait DriverConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn DriverChannel>, DriverError>;

    fn is_connected(&self) -> bool;

    async fn close(&self, code: u16, reason: &str) -> Result<(), DriverError>;
}

#[async_trait]
pub trait DriverChannel: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<(), DriverError>;

    async fn consume(&self, args: &DeliveryArgs) -> Result<InboundStream, DriverError>;

    /// Registers for close events. The receiver yields every event the driver
    /// raises and is exhausted once the channel is gone.
    fn notify_close(&self) -> mpsc::UnboundedReceiver<DriverError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), DriverError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), DriverError>;
}

#[async_trait]
pub trait DriverAcker: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), DriverError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), DriverError>;

    async fn reject(&self, requeue: bool) -> Result<(), DriverError>;
}
