use std::path::PathBuf;

use amqp_bridge::config::{self, BridgeConfig, CONFIG_FILE_NAME};
use amqp_bridge::rabbitmq::{
    BrokerError, CancellationToken, Channel, ConsumeOptions, Connection, Delivery, DeliveryArgs,
    LapinDriver,
};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        if command == "init-config" {
            let path = args
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            config::create_default_config_file(&path)?;
            println!("Configuration file created at: {}", path.display());
            return Ok(());
        }
        anyhow::bail!("unknown command {:?}, expected `init-config [path]`", command);
    }

    let config = amqp_bridge::env::load().context("Failed to load configuration")?;
    run(config).await
}

async fn run(config: BridgeConfig) -> Result<()> {
    let connection = Connection::dial(
        &LapinDriver::new(),
        &config.connection.uri,
        &config.connection.dial,
    )
    .await
    .context("Failed to connect to the broker")?;
    let channel = connection.open_channel().await?;
    channel.qos(config.consumer.prefetch_count).await?;

    let (close_tx, close_rx) = mpsc::channel(16);
    channel.bridge_close_notifications(close_tx);
    tokio::spawn(log_close_notifications(connection.broker().to_string(), close_rx));

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                ctx.cancel();
            }
        });
    }

    let args = DeliveryArgs::new(config.consumer.queue.clone())
        .consumer_tag(config.consumer.consumer_tag.clone())
        .auto_ack(config.consumer.auto_ack)
        .exclusive(config.consumer.exclusive);
    let options = ConsumeOptions {
        max_in_flight: config.consumer.max_in_flight,
        ..ConsumeOptions::default()
    };

    info!(
        broker = %connection.broker(),
        queue = %args.queue,
        "Service running. Press Ctrl+C to exit."
    );
    let outcome = channel.subscribe(ctx, &args, log_delivery, options).await;

    if let Err(err) = channel.close().await {
        warn!("Failed to close channel: {}", err);
    }
    if let Err(err) = connection.close().await {
        warn!("Failed to close connection: {}", err);
    }

    outcome.context("Consumer stopped unexpectedly")
}

async fn log_delivery(_ctx: CancellationToken, channel: Channel, delivery: Delivery) -> Result<()> {
    info!(
        channel_id = %channel.id(),
        delivery_tag = delivery.delivery_tag,
        routing_key = %delivery.routing_key,
        bytes = delivery.body.len(),
        "Received message"
    );
    if !delivery.is_settled() {
        delivery.ack(false).await?;
    }
    Ok(())
}

async fn log_close_notifications(broker: String, mut notifications: mpsc::Receiver<BrokerError>) {
    while let Some(err) = notifications.recv().await {
        error!(
            broker = %broker,
            code = err.code,
            recover = err.recover,
            "Channel closed by broker: {}",
            err.reason
        );
    }
}
