//! Stop adjustment rules for open legs.
//!
//! Pure functions: they take the current stop and market inputs and return
//! the new stop only when it is strictly better for the position. Stops
//! ratchet; they never move against the position, so re-running a rule
//! with unchanged inputs returns `None`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use super::config::ExitSettings;
use crate::models::{CloseReason, Direction, Instrument, PositionLeg};

/// Convert an indicator value into a price distance.
pub fn to_decimal(value: f64) -> Option<Decimal> {
    if value.is_finite() {
        Decimal::from_f64(value)
    } else {
        None
    }
}

/// Keep the stop that is better for the position.
pub fn ratchet(direction: Direction, current: Decimal, proposed: Decimal) -> Decimal {
    if direction.is_better(proposed, current) {
        proposed
    } else {
        current
    }
}

/// Trailing stop.
///
/// Once the favourable move from `entry` reaches `trailing_activation_atr`
/// ATRs, the stop follows price at `trailing_distance_atr` ATRs. A move
/// smaller than `trailing_step_pips` is ignored to avoid modify spam.
pub fn trailing_stop(
    direction: Direction,
    entry: Decimal,
    current_stop: Decimal,
    price: Decimal,
    atr: f64,
    exits: &ExitSettings,
    instrument: &Instrument,
) -> Option<Decimal> {
    if !exits.trailing_enabled || atr <= 0.0 {
        return None;
    }
    let activation = to_decimal(exits.trailing_activation_atr * atr)?;
    let distance = to_decimal(exits.trailing_distance_atr * atr)?;

    if direction.favorable_move(entry, price) < activation {
        return None;
    }

    let candidate = instrument.normalize_price(price - direction.sign() * distance);
    if !direction.is_better(candidate, current_stop) {
        return None;
    }

    let step = instrument.pips_to_price(exits.trailing_step_pips);
    if direction.favorable_move(current_stop, candidate) < step {
        return None;
    }
    Some(candidate)
}

/// Where a breakeven stop sits: entry plus the configured offset in the
/// position's favour.
pub fn breakeven_target(
    direction: Direction,
    entry: Decimal,
    offset_pips: Decimal,
    instrument: &Instrument,
) -> Decimal {
    instrument.normalize_price(entry + direction.sign() * instrument.pips_to_price(offset_pips))
}

/// Outcome of the breakeven rule for one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakevenDecision {
    /// Trigger not reached yet
    Wait,
    /// Trigger reached but the stop already protects entry
    AlreadyProtected,
    /// Move the stop to this price
    Move(Decimal),
}

/// Breakeven shift, applied once per leg.
pub fn breakeven_stop(
    direction: Direction,
    entry: Decimal,
    current_stop: Decimal,
    price: Decimal,
    atr: f64,
    exits: &ExitSettings,
    instrument: &Instrument,
) -> BreakevenDecision {
    if !exits.breakeven_enabled || atr <= 0.0 {
        return BreakevenDecision::Wait;
    }
    let Some(trigger) = to_decimal(exits.breakeven_trigger_atr * atr) else {
        return BreakevenDecision::Wait;
    };
    if direction.favorable_move(entry, price) < trigger {
        return BreakevenDecision::Wait;
    }
    force_breakeven(direction, entry, current_stop, exits, instrument)
}

/// Breakeven regardless of the profit trigger, used after the first
/// take-profit fills.
pub fn force_breakeven(
    direction: Direction,
    entry: Decimal,
    current_stop: Decimal,
    exits: &ExitSettings,
    instrument: &Instrument,
) -> BreakevenDecision {
    let target = breakeven_target(direction, entry, exits.breakeven_offset_pips, instrument);
    if direction.is_better(target, current_stop) {
        BreakevenDecision::Move(target)
    } else {
        BreakevenDecision::AlreadyProtected
    }
}

/// True once the position is older than the configured hold time.
pub fn time_exit_due(opened_at: DateTime<Utc>, now: DateTime<Utc>, exits: &ExitSettings) -> bool {
    exits.time_exit_enabled && now - opened_at >= Duration::hours(exits.max_hold_hours)
}

/// Best guess at why the broker closed a leg we did not close ourselves:
/// whichever of stop and take-profit is nearer to `price`, refined by what
/// has happened to the stop.
pub fn classify_broker_close(leg: &PositionLeg, direction: Direction, price: Decimal) -> CloseReason {
    let to_stop = (price - leg.stop_price).abs();
    let to_target = (price - leg.take_profit).abs();
    if to_target < to_stop {
        return CloseReason::TakeProfit;
    }
    if leg.trailing_active {
        CloseReason::TrailingStop
    } else if leg.breakeven_applied && !direction.is_better(leg.entry_price, leg.stop_price) {
        CloseReason::BreakevenStop
    } else {
        CloseReason::StopLoss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn eurusd() -> Instrument {
        Instrument {
            symbol: "EURUSD".to_string(),
            digits: 5,
            point: dec!(0.00001),
            contract_size: dec!(100000),
            min_lot: dec!(0.01),
            max_lot: dec!(50),
            lot_step: dec!(0.01),
        }
    }

    fn exits() -> ExitSettings {
        ExitSettings {
            trailing_enabled: true,
            trailing_activation_atr: 1.0,
            trailing_distance_atr: 1.5,
            trailing_step_pips: dec!(1),
            breakeven_enabled: true,
            breakeven_trigger_atr: 1.0,
            breakeven_offset_pips: dec!(2),
            breakeven_after_first_tp: true,
            time_exit_enabled: true,
            max_hold_hours: 24,
        }
    }

    #[test]
    fn test_ratchet_never_loosens() {
        assert_eq!(ratchet(Direction::Long, dec!(95), dec!(100)), dec!(100));
        assert_eq!(ratchet(Direction::Long, dec!(100), dec!(90)), dec!(100));
        assert_eq!(ratchet(Direction::Short, dec!(105), dec!(110)), dec!(105));
        assert_eq!(ratchet(Direction::Short, dec!(105), dec!(101)), dec!(101));
    }

    #[test]
    fn test_trailing_waits_for_activation() {
        let inst = eurusd();
        // ATR 20 pips, price only 15 pips in profit
        let stop = trailing_stop(
            Direction::Long, dec!(1.10000), dec!(1.09600), dec!(1.10150), 0.0020, &exits(), &inst,
        );
        assert_eq!(stop, None);
    }

    #[test]
    fn test_trailing_is_idempotent() {
        let inst = eurusd();
        let cfg = exits();
        let price = dec!(1.10500);

        let first = trailing_stop(Direction::Long, dec!(1.10000), dec!(1.09600), price, 0.0020, &cfg, &inst);
        // 1.10500 - 1.5 * 0.0020
        assert_eq!(first, Some(dec!(1.10200)));

        let second = trailing_stop(Direction::Long, dec!(1.10000), first.unwrap(), price, 0.0020, &cfg, &inst);
        assert_eq!(second, None);
    }

    #[test]
    fn test_trailing_short_moves_down_only() {
        let inst = eurusd();
        let cfg = exits();
        let stop = trailing_stop(Direction::Short, dec!(1.10000), dec!(1.10400), dec!(1.09500), 0.0020, &cfg, &inst);
        assert_eq!(stop, Some(dec!(1.09800)));

        // price bounces up: the proposed stop would be looser, so nothing moves
        let stop = trailing_stop(Direction::Short, dec!(1.10000), dec!(1.09800), dec!(1.09700), 0.0020, &cfg, &inst);
        assert_eq!(stop, None);
    }

    #[test]
    fn test_trailing_respects_step() {
        let inst = eurusd();
        let mut cfg = exits();
        cfg.trailing_step_pips = dec!(5);
        // would improve the stop by 3 pips only
        let stop = trailing_stop(Direction::Long, dec!(1.10000), dec!(1.10170), dec!(1.10500), 0.0020, &cfg, &inst);
        assert_eq!(stop, None);
    }

    #[test]
    fn test_breakeven_once() {
        let inst = eurusd();
        let cfg = exits();
        let decision = breakeven_stop(Direction::Long, dec!(1.10000), dec!(1.09600), dec!(1.10250), 0.0020, &cfg, &inst);
        assert_eq!(decision, BreakevenDecision::Move(dec!(1.10020)));

        let again = breakeven_stop(Direction::Long, dec!(1.10000), dec!(1.10020), dec!(1.10250), 0.0020, &cfg, &inst);
        assert_eq!(again, BreakevenDecision::AlreadyProtected);

        let early = breakeven_stop(Direction::Long, dec!(1.10000), dec!(1.09600), dec!(1.10100), 0.0020, &cfg, &inst);
        assert_eq!(early, BreakevenDecision::Wait);
    }

    #[test]
    fn test_breakeven_short_target() {
        let inst = eurusd();
        assert_eq!(
            breakeven_target(Direction::Short, dec!(1.10000), dec!(2), &inst),
            dec!(1.09980)
        );
    }

    #[test]
    fn test_time_exit() {
        let cfg = exits();
        let opened = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(!time_exit_due(opened, opened + Duration::hours(23), &cfg));
        assert!(time_exit_due(opened, opened + Duration::hours(24), &cfg));

        let disabled = ExitSettings {
            time_exit_enabled: false,
            ..cfg
        };
        assert!(!time_exit_due(opened, opened + Duration::hours(100), &disabled));
    }

    #[test]
    fn test_classify_broker_close() {
        let mut leg = PositionLeg::new(0, 1, dec!(0.1), dec!(1.10000), dec!(1.09500), dec!(1.10750));
        assert_eq!(
            classify_broker_close(&leg, Direction::Long, dec!(1.10745)),
            CloseReason::TakeProfit
        );
        assert_eq!(
            classify_broker_close(&leg, Direction::Long, dec!(1.09490)),
            CloseReason::StopLoss
        );

        leg.stop_price = dec!(1.10020);
        leg.breakeven_applied = true;
        assert_eq!(
            classify_broker_close(&leg, Direction::Long, dec!(1.10015)),
            CloseReason::BreakevenStop
        );

        leg.trailing_active = true;
        assert_eq!(
            classify_broker_close(&leg, Direction::Long, dec!(1.10015)),
            CloseReason::TrailingStop
        );
    }
}
