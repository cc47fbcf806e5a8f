//! Instrument specification: price precision, pip convention and lot limits.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Tradable instrument as quoted by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,

    /// Number of quoted decimal digits (5 for EURUSD, 3 for USDJPY, 2 for XAUUSD)
    pub digits: u32,

    /// Smallest price increment (one point)
    pub point: Decimal,

    /// Units per 1.0 lot; P&L per lot per unit of price
    pub contract_size: Decimal,

    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub lot_step: Decimal,
}

impl Instrument {
    /// Size of one pip. For 3- and 5-digit quotes a pip is ten points,
    /// otherwise a pip equals a point.
    pub fn pip_size(&self) -> Decimal {
        if self.digits == 3 || self.digits == 5 {
            self.point * dec!(10)
        } else {
            self.point
        }
    }

    /// Convert a pip count into a price distance.
    pub fn pips_to_price(&self, pips: Decimal) -> Decimal {
        pips * self.pip_size()
    }

    /// Convert a price distance into pips.
    pub fn price_to_pips(&self, distance: Decimal) -> Decimal {
        let pip = self.pip_size();
        if pip.is_zero() {
            return Decimal::ZERO;
        }
        distance / pip
    }

    /// Round a price to the instrument's quoted precision.
    pub fn normalize_price(&self, price: Decimal) -> Decimal {
        price.round_dp(self.digits)
    }

    /// Floor a quantity to the lot step.
    pub fn floor_lots(&self, quantity: Decimal) -> Decimal {
        if self.lot_step.is_zero() {
            return quantity;
        }
        (quantity / self.lot_step).floor() * self.lot_step
    }
}
