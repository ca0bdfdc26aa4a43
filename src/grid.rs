//! Grid Calculator: a pure function mapping a signal plus DCA grid
//! configuration into a list of order legs, honoring exchange precision
//! rules. No I/O, no persistence — everything downstream (`PositionManager`)
//! consumes this as a plan to submit.

use rust_decimal::Decimal;

use crate::config::{DcaGridConfig, EntryOrderType};
use crate::exchange::connector::PrecisionRule;
use crate::types::Side;

/// One computed leg of a DCA wave, ready to become a `DcaOrder`.
#[derive(Debug, Clone, PartialEq)]
pub struct GridLeg {
    pub leg_index: u32,
    pub price: Decimal,
    pub weight_percent: Decimal,
    pub gap_percent: Decimal,
    pub tp_percent: Decimal,
    pub quantity: Decimal,
    pub tp_price: Decimal,
    /// `None` when the computed quantity's notional fell below
    /// `min_notional` — the leg must be skipped, not placed, per spec §8
    /// boundary behavior.
    pub skip: bool,
}

/// Round `value` down to the nearest multiple of `increment` (floor, not
/// nearest) — the rounding direction spec §8 mandates for both prices
/// (tick_size) and quantities (step_size).
pub fn round_down_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).floor() * increment
}

/// Compute the legs for one DCA wave (pyramid). `pyramid_index` selects a
/// per-pyramid level override from `config.pyramid_specific_levels` when
/// present, otherwise falls back to `config.dca_levels`.
///
/// `side` determines the TP direction: a long (`Buy`) entry's TP is above
/// the fill price; a short (`Sell`) entry's TP would be below it, kept for
/// side-symmetry even though the system is spot/long-only today.
pub fn compute_grid_legs(
    config: &DcaGridConfig,
    pyramid_index: u32,
    base_entry_price: Decimal,
    side: Side,
    precision: PrecisionRule,
) -> Vec<GridLeg> {
    let levels = config
        .pyramid_specific_levels
        .get(&(pyramid_index as usize))
        .unwrap_or(&config.dca_levels);

    let mut legs = Vec::with_capacity(levels.len());

    for (idx, level) in levels.iter().enumerate() {
        let gap_multiplier = Decimal::ONE + level.gap_percent / Decimal::from(100);
        let raw_price = base_entry_price * gap_multiplier;
        let price = round_down_to_increment(raw_price, precision.tick_size);

        let leg_capital = config.total_capital_usd * level.weight_percent / Decimal::from(100);
        let raw_quantity = if price > Decimal::ZERO {
            leg_capital / price
        } else {
            Decimal::ZERO
        };
        let quantity = round_down_to_increment(raw_quantity, precision.step_size);

        let notional = quantity * price;
        let skip = notional < precision.min_notional;

        let tp_multiplier = match side {
            Side::Buy => Decimal::ONE + level.tp_percent / Decimal::from(100),
            Side::Sell => Decimal::ONE - level.tp_percent / Decimal::from(100),
        };
        let tp_price = round_down_to_increment(price * tp_multiplier, precision.tick_size);

        legs.push(GridLeg {
            leg_index: idx as u32,
            price,
            weight_percent: level.weight_percent,
            gap_percent: level.gap_percent,
            tp_percent: level.tp_percent,
            quantity,
            tp_price,
            skip,
        });
    }

    legs
}

/// Whether leg 0 should start `trigger_pending` (market entry type) versus
/// `pending` (limit entry type), per spec §4.2 step 6.
pub fn leg_zero_starts_trigger_pending(config: &DcaGridConfig) -> bool {
    config.entry_order_type == EntryOrderType::Market
}

/// Recompute a pyramid's own weighted-average entry and TP target from its
/// filled, non-TP'd legs, for `pyramid_aggregate` mode (spec §4.2 step 7).
/// Returns `None` if the pyramid has no filled quantity yet.
pub fn pyramid_weighted_avg_entry(filled_prices_and_quantities: &[(Decimal, Decimal)]) -> Option<Decimal> {
    let total_qty: Decimal = filled_prices_and_quantities.iter().map(|(_, q)| *q).sum();
    if total_qty <= Decimal::ZERO {
        return None;
    }
    let total_cost: Decimal = filled_prices_and_quantities
        .iter()
        .map(|(p, q)| *p * *q)
        .sum();
    Some(total_cost / total_qty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DcaLevel;
    use rust_decimal_macros::dec;

    fn scenario_1_config() -> DcaGridConfig {
        DcaGridConfig {
            entry_order_type: EntryOrderType::Limit,
            dca_levels: vec![
                DcaLevel { gap_percent: dec!(0), weight_percent: dec!(20), tp_percent: dec!(2) },
                DcaLevel { gap_percent: dec!(-1), weight_percent: dec!(20), tp_percent: dec!(1.5) },
                DcaLevel { gap_percent: dec!(-2), weight_percent: dec!(20), tp_percent: dec!(1) },
                DcaLevel { gap_percent: dec!(-3), weight_percent: dec!(20), tp_percent: dec!(0.5) },
                DcaLevel { gap_percent: dec!(-5), weight_percent: dec!(20), tp_percent: dec!(0.5) },
            ],
            pyramid_specific_levels: Default::default(),
            tp_mode: crate::domain::TpMode::PerLeg,
            tp_aggregate_percent: None,
            pyramid_tp_percents: Default::default(),
            max_pyramids: 3,
            cancel_dca_beyond_percent: None,
            total_capital_usd: dec!(500),
            adjust_tp_to_actual_fill: false,
            stale_tp_threshold_hours: dec!(24),
            stale_tp_action: Default::default(),
        }
    }

    #[test]
    fn scenario_1_prices_and_quantities() {
        let config = scenario_1_config();
        let precision = PrecisionRule {
            tick_size: dec!(0.01),
            step_size: dec!(0.01),
            min_notional: dec!(0),
        };
        let legs = compute_grid_legs(&config, 0, dec!(100), Side::Buy, precision);

        let expected_prices = [dec!(100.00), dec!(99.00), dec!(98.00), dec!(97.00), dec!(95.00)];
        assert_eq!(legs.len(), 5);
        for (leg, expected_price) in legs.iter().zip(expected_prices.iter()) {
            assert_eq!(leg.price, *expected_price);
            let expected_qty = round_down_to_increment(dec!(100) / expected_price, dec!(0.01));
            assert_eq!(leg.quantity, expected_qty);
            assert!(!leg.skip);
        }
    }

    #[test]
    fn scenario_1_tp_prices() {
        let config = scenario_1_config();
        let precision = PrecisionRule { tick_size: dec!(0.01), step_size: dec!(0.01), min_notional: dec!(0) };
        let legs = compute_grid_legs(&config, 0, dec!(100), Side::Buy, precision);

        assert_eq!(legs[0].tp_price, dec!(102.00));
        assert_eq!(legs[1].tp_price, round_down_to_increment(dec!(99.00) * dec!(1.015), dec!(0.01)));
        assert_eq!(legs[4].tp_price, round_down_to_increment(dec!(95.00) * dec!(1.005), dec!(0.01)));
    }

    #[test]
    fn below_min_notional_is_skipped() {
        let config = scenario_1_config();
        let precision = PrecisionRule { tick_size: dec!(0.01), step_size: dec!(0.01), min_notional: dec!(1000) };
        let legs = compute_grid_legs(&config, 0, dec!(100), Side::Buy, precision);
        assert!(legs.iter().all(|l| l.skip));
    }

    #[test]
    fn round_down_never_rounds_up() {
        assert_eq!(round_down_to_increment(dec!(1.999), dec!(0.01)), dec!(1.99));
        assert_eq!(round_down_to_increment(dec!(2.00), dec!(0.01)), dec!(2.00));
    }

    #[test]
    fn market_entry_type_requires_trigger_pending() {
        let mut config = scenario_1_config();
        assert!(!leg_zero_starts_trigger_pending(&config));
        config.entry_order_type = EntryOrderType::Market;
        assert!(leg_zero_starts_trigger_pending(&config));
    }

    #[test]
    fn pyramid_weighted_avg_matches_cost_weighted_mean() {
        let fills = vec![(dec!(100), dec!(1)), (dec!(90), dec!(1))];
        assert_eq!(pyramid_weighted_avg_entry(&fills), Some(dec!(95)));
    }

    #[test]
    fn pyramid_weighted_avg_none_when_empty() {
        assert_eq!(pyramid_weighted_avg_entry(&[]), None);
    }
}
