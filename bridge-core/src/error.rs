//! Error types for control-surface operations

use bridge_rules::RuleError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error("Capture driver {driver} failed: {message}")]
    Driver { driver: String, message: String },

    #[error("A session is already active")]
    AlreadyConnected,

    #[error("No active session")]
    NotConnected,
}

impl BridgeError {
    pub fn driver(driver: impl Into<String>, message: impl ToString) -> Self {
        BridgeError::Driver {
            driver: driver.into(),
            message: message.to_string(),
        }
    }
}
