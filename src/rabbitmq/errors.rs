// src/rabbitmq/errors.rs

use std::error::Error as StdError;

use thiserror::Error;

/// Error produced by a broker driver, passed through untouched.
pub type DriverError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AmqpError {
    /// The broker has declared the connection dead.
    #[error("amqp: connection is closed")]
    ClosedConnection,

    /// The delivery stream ended while nobody asked the consumer to stop.
    #[error("amqp: delivery channel was closed")]
    DeliveryStreamClosed,

    #[error("amqp: delivery {0} was already acknowledged or rejected")]
    AlreadyFinalized(u64),

    #[error("amqp: invalid delivery args: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Broker(DriverError),
}

// Custom Result type for AMQP operations
pub type Result<T> = std::result::Result<T, AmqpError>;

impl AmqpError {
    /// Returns the underlying driver error when it is of type `E`.
    ///
    /// Lets callers keep matching on their driver's own error kinds, e.g.
    /// `err.broker_error::<lapin::Error>()`.
    pub fn broker_error<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            AmqpError::Broker(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_delivery_stream_closed(&self) -> bool {
        matches!(self, AmqpError::DeliveryStreamClosed)
    }
}

impl From<DriverError> for AmqpError {
    fn from(error: DriverError) -> Self {
        AmqpError::Broker(error)
    }
}

/// Close notification raised by the broker for a channel or connection,
/// detached from the driver's own error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("amqp: exception ({code}) reason: {reason:?}")]
pub struct BrokerError {
    /// AMQP reply code, 0 when the driver did not supply one.
    pub code: u16,
    pub reason: String,
    /// Raised by the server rather than by the local driver.
    pub server: bool,
    /// A soft error: the connection survives and a new channel may be opened.
    pub recover: bool,
}

impl BrokerError {
    pub fn new(code: u16, reason: impl Into<String>, server: bool, recover: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            server,
            recover,
        }
    }

    /// Translates an arbitrary driver close event.
    ///
    /// Events that already are a `BrokerError` are unwrapped, lapin errors keep
    /// their reply code, anything else becomes a local non-recoverable error.
    pub fn from_driver(error: DriverError) -> Self {
        match error.downcast::<BrokerError>() {
            Ok(broker) => *broker,
            Err(error) => match error.downcast_ref::<lapin::Error>() {
                Some(lapin_error) => BrokerError::from(lapin_error),
                None => BrokerError::new(0, error.to_string(), false, false),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("fake driver failure")]
    struct FakeDriverError;

    #[test]
    fn test_broker_error_passes_through_driver_type() {
        let err = AmqpError::from(DriverError::from(FakeDriverError));
        assert!(err.broker_error::<FakeDriverError>().is_some());
        assert_eq!(err.to_string(), "fake driver failure");
    }

    #[test]
    fn test_sentinels_are_distinguishable() {
        assert!(AmqpError::DeliveryStreamClosed.is_delivery_stream_closed());
        assert!(!AmqpError::ClosedConnection.is_delivery_stream_closed());
        assert!(AmqpError::ClosedConnection
            .broker_error::<FakeDriverError>()
            .is_none());
    }

    #[test]
    fn test_from_driver_unwraps_broker_error() {
        let original = BrokerError::new(320, "CONNECTION_FORCED", true, false);
        let translated = BrokerError::from_driver(DriverError::from(original.clone()));
        assert_eq!(translated, original);
    }

    #[test]
    fn test_from_driver_wraps_unknown_error() {
        let translated = BrokerError::from_driver(DriverError::from(FakeDriverError));
        assert_eq!(translated.code, 0);
        assert_eq!(translated.reason, "fake driver failure");
        assert!(!translated.server);
    }
}
