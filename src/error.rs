//! Exchange error type with Binance-compatible error codes.
//!
//! Every error carries the negative integer code the REST layer reports in
//! `{"code": ..., "msg": ...}` and the HTTP status class it maps to.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Invalid symbol.")]
    UnknownSymbol,
    #[error("{0}")]
    InvalidParam(String),
    #[error("Filter failure: {0}")]
    FilterFailure(String),
    #[error("Timestamp for this request is outside of the recvWindow.")]
    InvalidTimestamp,
    #[error("Signature for this request is not valid.")]
    InvalidSignature,
    #[error("Invalid API-key, IP, or permissions for action.")]
    InvalidApiKey,
    #[error("Account has insufficient balance for requested action.")]
    InsufficientBalance,
    #[error("Unknown order sent.")]
    UnknownOrder,
    #[error("Duplicate order sent.")]
    DuplicateClientOrderId,
    #[error("Order would immediately match and take.")]
    WouldTakeLiquidity,
    #[error("No reference price available for price match.")]
    NoReferencePrice,
    #[error("Unknown account.")]
    UnknownAccount,
    #[error("This action is disabled on this account.")]
    Unauthorized,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Binance error code for the REST error body.
    pub fn code(&self) -> i32 {
        match self {
            ExchangeError::UnknownSymbol => -1121,
            ExchangeError::InvalidParam(_) => -1102,
            ExchangeError::FilterFailure(_) => -1013,
            ExchangeError::InvalidTimestamp => -1021,
            ExchangeError::InvalidSignature => -1022,
            ExchangeError::InvalidApiKey => -2014,
            ExchangeError::InsufficientBalance => -2010,
            ExchangeError::UnknownOrder => -2013,
            ExchangeError::DuplicateClientOrderId => -2010,
            ExchangeError::WouldTakeLiquidity => -2010,
            ExchangeError::NoReferencePrice => -2010,
            ExchangeError::UnknownAccount => -2016,
            ExchangeError::Unauthorized => -2015,
            ExchangeError::Internal(_) => -1000,
        }
    }

    /// HTTP status the REST layer responds with.
    pub fn http_status(&self) -> u16 {
        match self {
            ExchangeError::InvalidTimestamp
            | ExchangeError::InvalidSignature
            | ExchangeError::InvalidApiKey
            | ExchangeError::Unauthorized => 401,
            ExchangeError::Internal(_) => 500,
            _ => 400,
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_binance_table() {
        assert_eq!(ExchangeError::UnknownSymbol.code(), -1121);
        assert_eq!(ExchangeError::InvalidTimestamp.code(), -1021);
        assert_eq!(ExchangeError::InvalidApiKey.code(), -2014);
        assert_eq!(ExchangeError::UnknownOrder.code(), -2013);
        assert_eq!(ExchangeError::InsufficientBalance.code(), -2010);
    }

    #[test]
    fn auth_errors_map_to_401() {
        assert_eq!(ExchangeError::InvalidSignature.http_status(), 401);
        assert_eq!(ExchangeError::InvalidApiKey.http_status(), 401);
        assert_eq!(ExchangeError::UnknownOrder.http_status(), 400);
    }
}
