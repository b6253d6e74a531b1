// src/rabbitmq/connection.rs

use std::sync::Arc;

use tracing::{debug, info};

use super::channel::Channel;
use super::driver::{BrokerDriver, DriverConnection};
use super::errors::{AmqpError, Result};
use crate::config::DialConfig;

/// Owns one broker connection and hands out channels on it.
///
/// Clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    broker: Arc<str>,
    inner: Arc<dyn DriverConnection>,
}

impl Connection {
    /// Dials the broker. Driver failures are returned as they are; retrying is
    /// left to the caller.
    pub async fn dial(driver: &dyn BrokerDriver, url: &str, config: &DialConfig) -> Result<Self> {
        let broker = broker_identity(url);
        debug!(broker = %broker, heartbeat = ?config.heartbeat(), "amqp: dialing broker");

        let inner = driver.dial(url, config).await.map_err(AmqpError::Broker)?;

        info!(broker = %broker, "amqp: connected");
        Ok(Self {
            broker: Arc::from(broker),
            inner: Arc::from(inner),
        })
    }

    /// Broker endpoint with credentials stripped, for logs and labels.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Opens a new channel on this connection.
    pub async fn open_channel(&self) -> Result<Channel> {
        if !self.inner.is_connected() {
            return Err(AmqpError::ClosedConnection);
        }
        let channel = self.inner.open_channel().await.map_err(AmqpError::Broker)?;
        Ok(Channel::new(self.clone(), channel))
    }

    pub async fn close(&self) -> Result<()> {
        info!(broker = %self.broker, "amqp: closing connection");
        self.inner
            .close(0, "connection closed by client")
            .await
            .map_err(AmqpError::Broker)
    }
}

/// Everything after the first `@` of the dial URL, or the URL itself when it
/// carries no credentials.
pub fn broker_identity(url: &str) -> &str {
    match url.split_once('@') {
        Some((_, server)) => server,
        None => url,
    }
}
