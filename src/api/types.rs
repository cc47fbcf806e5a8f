//! Gateway-facing types and the terminal bridge's JSON wire format.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{AccountSnapshot, Direction, PriceBar};

/// Order execution type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Fill immediately at the current quote
    Market,
}

/// Result of a successful order placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRef {
    pub ticket: u64,
    pub fill_price: Decimal,
    pub filled_quantity: Decimal,
}

/// An open position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRef {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub open_price: Decimal,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub profit: Decimal,
}

/// Restricts `get_open_positions` to a subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionFilter {
    pub symbol: Option<String>,
}

impl PositionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn symbol(symbol: &str) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
        }
    }
}

/// Returned by `connect`; identifies the terminal session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHandle {
    pub session_id: String,
    pub server: String,
    pub connected_at: DateTime<Utc>,
}

// === Terminal bridge wire types ===

/// Bar as returned by `GET /bars`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarResponse {
    /// Unix seconds
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub tick_volume: f64,
}

impl BarResponse {
    pub fn into_bar(self) -> Option<PriceBar> {
        let timestamp = DateTime::from_timestamp(self.time, 0)?;
        Some(PriceBar::new(
            timestamp,
            self.open,
            self.high,
            self.low,
            self.close,
            self.tick_volume,
        ))
    }
}

/// Account block from `GET /account`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub balance: Decimal,
    pub equity: Decimal,
    #[serde(default)]
    pub margin_free: Decimal,
    /// Terminal server time, unix seconds
    pub server_time: i64,
}

impl From<AccountResponse> for AccountSnapshot {
    fn from(r: AccountResponse) -> Self {
        AccountSnapshot {
            balance: r.balance,
            equity: r.equity,
            free_margin: r.margin_free,
            timestamp: DateTime::from_timestamp(r.server_time, 0).unwrap_or_else(Utc::now),
        }
    }
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest<'a> {
    pub symbol: &'a str,
    pub direction: Direction,
    pub volume: Decimal,
    pub kind: OrderKind,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Lets the bridge tag orders placed by this engine
    pub comment: &'a str,
}

/// Body of `POST /positions/{ticket}/modify`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyRequest {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

/// Body of `POST /positions/{ticket}/close`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub volume: Decimal,
}

/// Response to order placement. The bridge reports rejections in-band.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub success: bool,
    #[serde(default)]
    pub ticket: Option<u64>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub retcode: Option<i32>,
    #[serde(default)]
    pub message: String,
}

/// Generic acknowledgement for modify and close.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_position_ref() {
        let json = r#"{"ticket": 501, "symbol": "EURUSD", "direction": "LONG",
            "quantity": "0.40", "openPrice": "1.10012", "stopPrice": "1.09500"}"#;
        let pos: PositionRef = serde_json::from_str(json).unwrap();
        assert_eq!(pos.ticket, 501);
        assert_eq!(pos.direction, Direction::Long);
        assert_eq!(pos.quantity, dec!(0.40));
        assert_eq!(pos.take_profit, None);
        assert_eq!(pos.profit, Decimal::ZERO);
    }

    #[test]
    fn test_bar_response_conversion() {
        let json = r#"{"time": 1704067200, "open": 1.1, "high": 1.2, "low": 1.0, "close": 1.15, "tickVolume": 320}"#;
        let bar = serde_json::from_str::<BarResponse>(json).unwrap().into_bar().unwrap();
        assert_eq!(bar.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(bar.volume, 320.0);
    }

    #[test]
    fn test_rejected_order_response() {
        let json = r#"{"success": false, "retcode": 10004, "message": "Requote"}"#;
        let resp: OrderResponse = serde_json::from_str(json).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.retcode, Some(10004));
        assert!(resp.ticket.is_none());
    }
}
