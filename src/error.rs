//! Engine and gateway error taxonomy.
//!
//! Application code (CLI, bot loop, persistence) uses `anyhow`; the trading
//! core returns these typed errors so callers can decide per variant whether
//! a failure is per-tick, per-leg or fatal.

use thiserror::Error;

/// Errors reported by a broker gateway implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Terminal connection lost or never established
    #[error("gateway disconnected: {0}")]
    Disconnected(String),

    /// Call did not complete within the configured timeout
    #[error("gateway call timed out after {0}s")]
    Timeout(u64),

    /// Broker declined the order
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Unknown ticket or symbol
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed response or unexpected status
    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Errors that indicate connectivity rather than a bad request.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GatewayError::Disconnected(_) | GatewayError::Timeout(_))
    }
}

/// Errors raised by the signal, sizing and lifecycle components.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Not enough bar history, or a required indicator is still warming up
    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// An indicator could not be computed
    #[error("indicator computation failed: {0}")]
    IndicatorComputation(String),

    /// Order was still rejected after the bounded retries
    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: String },

    #[error("gateway disconnected: {0}")]
    GatewayDisconnected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Stop price on the wrong side of entry, or zero distance
    #[error("invalid stop: {0}")]
    InvalidStop(String),

    #[error("invalid position transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("sizing failed: {0}")]
    Sizing(String),

    #[error(transparent)]
    Gateway(GatewayError),
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Disconnected(msg) => EngineError::GatewayDisconnected(msg),
            other => EngineError::Gateway(other),
        }
    }
}

impl EngineError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(msg.into())
    }

    pub fn data_unavailable(symbol: &str, reason: impl Into<String>) -> Self {
        EngineError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// True for connectivity failures that should pause ticking.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            EngineError::GatewayDisconnected(_) | EngineError::Gateway(GatewayError::Timeout(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_conversion() {
        let err: EngineError = GatewayError::Disconnected("socket closed".into()).into();
        assert!(matches!(err, EngineError::GatewayDisconnected(_)));
        assert!(err.is_disconnect());

        let err: EngineError = GatewayError::NotFound("ticket 7".into()).into();
        assert!(matches!(err, EngineError::Gateway(GatewayError::NotFound(_))));
        assert!(!err.is_disconnect());
    }
}
