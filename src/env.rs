// src/env.rs
// Environment overrides on top of the file configuration.
use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::{self, BridgeConfig};

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const AMQP_QUEUE: &str = "AMQP_QUEUE";
pub const AMQP_CONSUMER_TAG: &str = "AMQP_CONSUMER_TAG";
pub const AMQP_PREFETCH_COUNT: &str = "AMQP_PREFETCH_COUNT";
pub const AMQP_HEARTBEAT_SECONDS: &str = "AMQP_HEARTBEAT_SECONDS";
pub const AMQP_CONNECT_TIMEOUT_MS: &str = "AMQP_CONNECT_TIMEOUT_MS";
pub const AMQP_MAX_IN_FLIGHT: &str = "AMQP_MAX_IN_FLIGHT";

/// Loads `.env`, the config file (or defaults) and then the process environment.
pub fn load() -> Result<BridgeConfig> {
    dotenv().ok();
    let mut config = config::load_config()?;
    apply_overrides(&mut config, |key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn apply_overrides<F>(config: &mut BridgeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(uri) = lookup(AMQP_ADDR) {
        config.connection.uri = uri;
    }
    if let Some(queue) = lookup(AMQP_QUEUE) {
        config.consumer.queue = queue;
    }
    if let Some(tag) = lookup(AMQP_CONSUMER_TAG) {
        config.consumer.consumer_tag = tag;
    }
    if let Some(count) = parse_var(&lookup, AMQP_PREFETCH_COUNT)? {
        config.consumer.prefetch_count = count;
    }
    if let Some(secs) = parse_var(&lookup, AMQP_HEARTBEAT_SECONDS)? {
        config.connection.dial.heartbeat_seconds = secs;
    }
    if let Some(ms) = parse_var(&lookup, AMQP_CONNECT_TIMEOUT_MS)? {
        config.connection.dial.connection_timeout_ms = ms;
    }
    if let Some(limit) = parse_var(&lookup, AMQP_MAX_IN_FLIGHT)? {
        config.consumer.max_in_flight = Some(limit);
    }
    Ok(())
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, val))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
