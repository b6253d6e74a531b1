// src/rabbitmq/channel.rs

use std::fmt;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::Connection;
use super::delivery::{Delivery, DeliveryArgs};
use super::driver::DriverChannel;
use super::errors::{AmqpError, BrokerError, Result};
use super::message::Publishing;

/// Deliveries of one consume subscription, in broker order.
///
/// Once the broker ends the stream it never resumes; open a new one instead.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Owns one broker channel.
///
/// Clones share the channel. Publishing is serialized through an internal
/// lock because broker channels accept a single writer at a time.
#[derive(Clone)]
pub struct Channel {
    id: Arc<str>,
    connection: Connection,
    inner: Arc<dyn DriverChannel>,
    publish_lock: Arc<Mutex<()>>,
}

impl Channel {
    pub(crate) fn new(connection: Connection, inner: Box<dyn DriverChannel>) -> Self {
        let id = format!("channel-{}", &Uuid::new_v4().simple().to_string()[..8]);
        debug!(channel_id = %id, broker = %connection.broker(), "amqp: channel opened");
        Self {
            id: Arc::from(id),
            connection,
            inner: Arc::from(inner),
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Channel identifier for logging
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Redacted identity of the broker this channel talks to.
    pub fn broker(&self) -> &str {
        self.connection.broker()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Publishes a message.
    ///
    /// A missing header table is replaced by an empty one. Once handed to the
    /// driver the publish cannot be aborted: dropping the future only stops
    /// waiting for the driver's answer.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        mut message: Publishing,
    ) -> Result<()> {
        message.ensure_headers();

        let _guard = self.publish_lock.lock().await;
        self.inner
            .publish(exchange, routing_key, mandatory, immediate, message)
            .await
            .map_err(AmqpError::Broker)
    }

    /// Opens one consume subscription. Every call yields an independent stream.
    pub async fn open_delivery_stream(&self, args: &DeliveryArgs) -> Result<DeliveryStream> {
        args.validate()?;

        let inbound = self.inner.consume(args).await.map_err(AmqpError::Broker)?;
        info!(
            channel_id = %self.id,
            queue = %args.queue,
            consumer_tag = %args.consumer_tag,
            auto_ack = args.auto_ack,
            "amqp: delivery stream opened"
        );

        let auto_ack = args.auto_ack;
        Ok(inbound
            .map(move |delivery| Delivery::from_inbound(delivery, auto_ack))
            .boxed())
    }

    /// Forwards every close notification of this channel into `sink`.
    ///
    /// The forwarding task keeps the order of events and ends when the driver
    /// stops producing them or when `sink` is dropped. It then drops its clone of
    /// `sink`, so a receiver whose only sender was this bridge sees the end.
    pub fn bridge_close_notifications(&self, sink: mpsc::Sender<BrokerError>) -> JoinHandle<()> {
        let mut events = self.inner.notify_close();
        let channel_id = self.id.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let error = BrokerError::from_driver(event);
                warn!(
                    channel_id = %channel_id,
                    code = error.code,
                    reason = %error.reason,
                    "amqp: channel close notification"
                );
                if sink.send(error).await.is_err() {
                    debug!(channel_id = %channel_id, "amqp: close notification sink dropped");
                    break;
                }
            }
            debug!(channel_id = %channel_id, "amqp: close notification bridge finished");
        })
    }

    /// Limits the number of unacknowledged deliveries on this channel.
    pub async fn qos(&self, prefetch_count: u16) -> Result<()> {
        debug!(channel_id = %self.id, prefetch = prefetch_count, "amqp: setting channel QoS");
        self.inner.qos(prefetch_count).await.map_err(AmqpError::Broker)
    }

    pub async fn close(&self) -> Result<()> {
        info!(channel_id = %self.id, "amqp: closing channel");
        self.inner
            .close(0, "channel closed by client")
            .await
            .map_err(AmqpError::Broker)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("broker", &self.broker())
            .finish()
    }
}
