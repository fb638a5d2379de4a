//! Error types for spotter-bus

use spotter_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish error: {0}")]
    Publish(String),

    /// Control payload that is not an integer; the run state is left alone
    #[error("Malformed control message: {0}")]
    MalformedControlMessage(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<BusError> for CoreError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Core(inner) => inner,
            BusError::Io(inner) => CoreError::Io(inner),
            other => CoreError::Publish(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Encoding(err.to_string())
    }
}

impl From<rumqttc::ClientError> for BusError {
    fn from(err: rumqttc::ClientError) -> Self {
        BusError::Publish(err.to_string())
    }
}
