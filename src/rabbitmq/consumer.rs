// src/rabbitmq/consumer.rs
// Cancellable dispatch loop: one spawned handler task per delivery.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cancellation::CancellationToken;
use super::channel::{Channel, DeliveryStream};
use super::delivery::{Delivery, DeliveryArgs};
use super::errors::{AmqpError, Result};

/// Application callback run once per delivered message.
///
/// The returned error is only logged; it never stops the consumer.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: CancellationToken,
        channel: Channel,
        delivery: Delivery,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(CancellationToken, Channel, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(
        &self,
        ctx: CancellationToken,
        channel: Channel,
        delivery: Delivery,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(ctx, channel, delivery))
    }
}

/// Dispatch tuning for the consumption loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum number of handler tasks running at once. `None` spawns one task
    /// per delivery without limit; with a limit, reading the next delivery
    /// waits until a running handler finishes.
    pub max_in_flight: Option<usize>,
    /// Hand the loop's own token to handlers so they can observe shutdown.
    /// Off by default: handlers then get a token that is never cancelled.
    pub share_cancellation: bool,
}

impl ConsumeOptions {
    pub fn bounded(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: Some(max_in_flight.max(1)),
            ..Self::default()
        }
    }

    pub fn share_cancellation(mut self, share: bool) -> Self {
        self.share_cancellation = share;
        self
    }
}

impl Channel {
    /// Consumes `deliveries` until `ctx` is cancelled or the stream ends.
    ///
    /// Every delivery is handed to its own spawned task, launched in delivery
    /// order and never awaited here. Returns `Ok(())` on cancellation and
    /// `AmqpError::DeliveryStreamClosed` when the broker ends the stream first.
    /// Handlers already running are left to finish on their own, and their
    /// token is not the loop's unless `ConsumeOptions::share_cancellation` is set.
    pub async fn consume<H: Handler>(
        &self,
        ctx: CancellationToken,
        queue: &str,
        handler: H,
        deliveries: DeliveryStream,
    ) -> Result<()> {
        self.consume_with(ctx, queue, handler, deliveries, ConsumeOptions::default())
            .await
    }

    pub async fn consume_with<H: Handler>(
        &self,
        ctx: CancellationToken,
        queue: &str,
        handler: H,
        mut deliveries: DeliveryStream,
        options: ConsumeOptions,
    ) -> Result<()> {
        let handler = Arc::new(handler);
        let queue: Arc<str> = Arc::from(queue);
        let limit = options
            .max_in_flight
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));

        info!(queue = %queue, channel_id = %self.id(), "amqp: start the consumer");
        loop {
            let permit = match &limit {
                Some(semaphore) => tokio::select! {
                    _ = ctx.cancelled() => {
                        self.stopped(&queue);
                        return Ok(());
                    }
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                },
                None => None,
            };

            // No `biased;`: select picks randomly among ready branches.
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.stopped(&queue);
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(delivery) => {
                        debug!(
                            queue = %queue,
                            delivery_tag = delivery.delivery_tag,
                            "amqp: dispatching delivery"
                        );
                        let handler_ctx = if options.share_cancellation {
                            ctx.clone()
                        } else {
                            CancellationToken::new()
                        };
                        // The handler future is created here, in delivery order.
                        let task = handler.handle(handler_ctx, self.clone(), delivery);
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            if let Err(err) = task.await {
                                warn!(queue = %queue, error = %err, "amqp: execute handler failed");
                            }
                            drop(permit);
                        });
                    }
                    None => {
                        warn!(
                            queue = %queue,
                            channel_id = %self.id(),
                            "amqp: the delivery channel closed"
                        );
                        return Err(AmqpError::DeliveryStreamClosed);
                    }
                },
            }
        }
    }

    /// Opens a delivery stream for `args` and consumes it, labelled with the
    /// queue name.
    pub async fn subscribe<H: Handler>(
        &self,
        ctx: CancellationToken,
        args: &DeliveryArgs,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<()> {
        let deliveries = self.open_delivery_stream(args).await?;
        self.consume_with(ctx, &args.queue, handler, deliveries, options)
            .await
    }

    fn stopped(&self, queue: &str) {
        info!(queue = %queue, channel_id = %self.id(), "amqp: stop the consumer");
    }
}
