//! Broker gateway interface.
//!
//! The engine talks to the broker terminal only through [`BrokerGateway`].
//! Implementations: [`super::HttpGateway`] for a live terminal bridge and
//! [`super::PaperGateway`] for replay and tests. [`TimedGateway`] wraps
//! either one and bounds every call with a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{ConnectionHandle, OrderKind, OrderRef, PositionFilter, PositionRef};
use crate::error::GatewayError;
use crate::models::{AccountSnapshot, Direction, PriceBar, Timeframe};

/// Broker terminal operations the engine depends on.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Establish (or re-establish) the terminal session.
    async fn connect(&self) -> Result<ConnectionHandle, GatewayError>;

    /// The most recent `count` bars, oldest first. The last bar may still
    /// be forming.
    async fn get_price_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<PriceBar>, GatewayError>;

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, GatewayError>;

    async fn place_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        kind: OrderKind,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<OrderRef, GatewayError>;

    async fn modify_position(
        &self,
        ticket: u64,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<(), GatewayError>;

    async fn close_position(&self, ticket: u64, quantity: Decimal) -> Result<(), GatewayError>;

    async fn get_open_positions(
        &self,
        filter: &PositionFilter,
    ) -> Result<Vec<PositionRef>, GatewayError>;
}

/// Applies a timeout to every call of the wrapped gateway.
pub struct TimedGateway {
    inner: Arc<dyn BrokerGateway>,
    timeout: Duration,
}

impl TimedGateway {
    pub fn new(inner: Arc<dyn BrokerGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>> + Send,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[async_trait]
impl BrokerGateway for TimedGateway {
    async fn connect(&self) -> Result<ConnectionHandle, GatewayError> {
        self.timed(self.inner.connect()).await
    }

    async fn get_price_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<PriceBar>, GatewayError> {
        self.timed(self.inner.get_price_bars(symbol, timeframe, count)).await
    }

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        self.timed(self.inner.get_account_snapshot()).await
    }

    async fn place_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        kind: OrderKind,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        self.timed(
            self.inner
                .place_order(symbol, direction, quantity, kind, stop, take_profit),
        )
        .await
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<(), GatewayError> {
        self.timed(self.inner.modify_position(ticket, stop, take_profit)).await
    }

    async fn close_position(&self, ticket: u64, quantity: Decimal) -> Result<(), GatewayError> {
        self.timed(self.inner.close_position(ticket, quantity)).await
    }

    async fn get_open_positions(
        &self,
        filter: &PositionFilter,
    ) -> Result<Vec<PositionRef>, GatewayError> {
        self.timed(self.inner.get_open_positions(filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Never answers account queries.
    struct StalledGateway;

    #[async_trait]
    impl BrokerGateway for StalledGateway {
        async fn connect(&self) -> Result<ConnectionHandle, GatewayError> {
            Ok(ConnectionHandle {
                session_id: "s".to_string(),
                server: "stalled".to_string(),
                connected_at: Utc::now(),
            })
        }

        async fn get_price_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _count: usize,
        ) -> Result<Vec<PriceBar>, GatewayError> {
            Ok(Vec::new())
        }

        async fn get_account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(GatewayError::Protocol("unreachable".to_string()))
        }

        async fn place_order(
            &self,
            _symbol: &str,
            _direction: Direction,
            _quantity: Decimal,
            _kind: OrderKind,
            _stop: Decimal,
            _take_profit: Decimal,
        ) -> Result<OrderRef, GatewayError> {
            Err(GatewayError::OrderRejected("closed".to_string()))
        }

        async fn modify_position(
            &self,
            _ticket: u64,
            _stop: Decimal,
            _take_profit: Decimal,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn close_position(&self, _ticket: u64, _quantity: Decimal) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn get_open_positions(
            &self,
            _filter: &PositionFilter,
        ) -> Result<Vec<PositionRef>, GatewayError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_times_out() {
        let gateway = TimedGateway::new(Arc::new(StalledGateway), Duration::from_secs(5));
        let err = gateway.get_account_snapshot().await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout(5));
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let gateway = TimedGateway::new(Arc::new(StalledGateway), Duration::from_secs(5));
        assert!(gateway.connect().await.is_ok());
        assert!(matches!(
            gateway
                .place_order("EURUSD", Direction::Long, Decimal::ONE, OrderKind::Market, Decimal::ZERO, Decimal::ZERO)
                .await,
            Err(GatewayError::OrderRejected(_))
        ));
    }
}
