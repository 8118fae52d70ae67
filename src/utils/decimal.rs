//! Decimal helpers shared across the engine.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Relative deviation between two prices, against their midpoint:
/// `|a − b| / ((a + b) / 2)`.
pub fn midpoint_deviation(a: Decimal, b: Decimal) -> Decimal {
    let mid = (a + b) / dec!(2);
    if mid == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (a - b).abs() / mid
}

/// Clamp a value into `[lo, hi]`.
pub fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    value.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midpoint_deviation() {
        // |100 - 100.5| / 100.25
        let dev = midpoint_deviation(dec!(100), dec!(100.5));
        assert!(dev > dec!(0.00498) && dev < dec!(0.005));
        assert_eq!(midpoint_deviation(dec!(100), dec!(100)), Decimal::ZERO);
        // Symmetric.
        assert_eq!(
            midpoint_deviation(dec!(99), dec!(101)),
            midpoint_deviation(dec!(101), dec!(99))
        );
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(dec!(5), dec!(1), dec!(4)), dec!(4));
        assert_eq!(clamp(dec!(0.5), dec!(1), dec!(4)), dec!(1));
        assert_eq!(clamp(dec!(2), dec!(1), dec!(4)), dec!(2));
    }
}
