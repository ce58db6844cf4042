use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Amounts are kept in major units with two decimal places (rupees, dollars).
pub const CURRENCY_SCALE: u32 = 2;

/// Largest amount the order store holds (`NUMERIC(12,2)`).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_327, 232, 0, false, CURRENCY_SCALE);

/// True for amounts that fit the store's money columns.
pub fn in_amount_range(amount: Decimal) -> bool {
    amount.abs() <= MAX_AMOUNT
}

/// Converts a major-unit amount to the gateway's integer minor units (paise, cents).
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    amount.checked_mul(Decimal::ONE_HUNDRED)?.round().to_i64()
}

/// True when two amounts differ by no more than one minor unit.
pub fn within_minor_unit(a: Decimal, b: Decimal) -> bool {
    a.checked_sub(b)
        .map(|diff| diff.abs() <= Decimal::new(1, CURRENCY_SCALE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_minor_unit_conversion() {
        let amount = Decimal::from_str("25.00").unwrap();
        assert_eq!(to_minor_units(amount), Some(2500));
        assert_eq!(to_minor_units(Decimal::from_str("19.999").unwrap()), Some(2000));
        assert_eq!(to_minor_units(Decimal::MAX), None);
    }

    #[test]
    fn test_amount_range() {
        assert_eq!(MAX_AMOUNT, Decimal::from_str("9999999999.99").unwrap());
        assert!(in_amount_range(MAX_AMOUNT));
        assert!(!in_amount_range(Decimal::from_str("10000000000.00").unwrap()));
        assert!(!within_minor_unit(Decimal::MAX, Decimal::MIN));
    }

    #[test]
    fn test_rounding_tolerance() {
        let a = Decimal::from_str("25.00").unwrap();
        assert!(within_minor_unit(a, Decimal::from_str("25.01").unwrap()));
        assert!(within_minor_unit(a, Decimal::from_str("24.995").unwrap()));
        assert!(!within_minor_unit(a, Decimal::from_str("25.02").unwrap()));
    }
}
