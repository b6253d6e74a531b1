// src/rabbitmq/mod.rs
// Connection/channel layer over an AMQP broker driver.

pub mod cancellation;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod driver;
pub mod errors;
pub mod lapin_driver;
pub mod memory;
pub mod message;

// Re-export specific items to simplify imports elsewhere
pub use cancellation::CancellationToken;
pub use channel::{Channel, DeliveryStream};
pub use connection::{broker_identity, Connection};
pub use consumer::{ConsumeOptions, Handler};
pub use delivery::{Delivery, DeliveryArgs};
pub use driver::BrokerDriver;
pub use errors::{AmqpError, BrokerError, DriverError, Result};
pub use lapin_driver::LapinDriver;
pub use memory::MemoryBroker;
pub use message::{MessageProperties, Publishing};
