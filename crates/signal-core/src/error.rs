use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("News source error: {0}")]
    SourceError(String),

    #[error("Market data error: {0}")]
    MarketDataError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type SignalResult<T> = Result<T, SignalError>;
