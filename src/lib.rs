pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{BridgeConfig, DialConfig};
pub use rabbitmq::{
    AmqpError, BrokerError, CancellationToken, Channel, ConsumeOptions, Connection, Delivery,
    DeliveryArgs, Handler, Publishing,
};
