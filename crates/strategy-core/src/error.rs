use thiserror::Error;

/// Failures surfaced by the evaluation engines.
///
/// Numeric degeneracies (zero-trade runs, zero variance) never show up here:
/// they resolve to documented neutral values where they occur.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Concurrency error: a {0} run is already in flight")]
    Concurrency(String),

    #[error("Insufficient data: {0}")]
    Data(String),

    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
