use thiserror::Error;

/// Fault taxonomy for the bridge.
///
/// `Registration` and `Config` are startup-fatal for the board; `Parse` is
/// recovered per bit; `Publish` is retried by the publisher; `Spool` is the
/// silent-data-loss path and is logged at highest severity wherever it is
/// swallowed.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Chip registration failed: {0}")]
    Registration(String),
    #[error("Bit descriptor parse error: {0}")]
    Parse(String),
    #[error("Broker publish failed: {0}")]
    Publish(String),
    #[error("Spool write failed: {0}")]
    Spool(String),
}
