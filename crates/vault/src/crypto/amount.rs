//! Exact monetary amounts and their canonical decimal form.
//!
//! Amounts are held as signed minor units (hundredths). The canonical string
//! always carries exactly two fraction digits, so `500` is `"500.00"` and
//! `-0.5` is `"-0.50"`. Inputs with more precision are rejected, not rounded.
//!
//! Magnitudes stay below 10^15 minor units. Every such amount has at most 15
//! significant digits, so it survives the `f64` JSON form exactly in both
//! directions.

use std::{fmt, str::FromStr};

use serde_json::{Number, Value};

use super::CryptoError;

/// Minor units per major unit.
const SCALE: i64 = 100;

/// Largest magnitude in minor units whose `minor / 100` float form is exact.
pub const MAX_MINOR_UNITS: i64 = 999_999_999_999_999;

/// Exclusive bound on the major-unit magnitude of a float input.
const MAX_MAJOR_UNITS: f64 = 1e13;

/// A monetary amount with two decimal places of precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    /// Build an amount from minor units (e.g. cents).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Format`] if the magnitude exceeds [`MAX_MINOR_UNITS`].
    pub fn from_minor_units(minor: i64) -> Result<Self, CryptoError> {
        if minor.unsigned_abs() > MAX_MINOR_UNITS as u64 {
            return Err(CryptoError::Format("amount out of range".into()));
        }
        Ok(Self(minor))
    }

    /// The amount in minor units.
    pub fn minor_units(self) -> i64 {
        self.0
    }

    /// Convert a JSON number into an exact amount.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Format`] when the number has more than two
    /// decimal places or is out of range.
    ///
    /// A float is checked against its shortest decimal rendering, so a value
    /// like `1.001` is refused instead of being snapped to the nearest cent.
    pub fn from_json(number: &Number) -> Result<Self, CryptoError> {
        if let Some(whole) = number.as_i64() {
            let minor = whole
                .checked_mul(SCALE)
                .ok_or_else(|| CryptoError::Format("amount out of range".into()))?;
            return Self::from_minor_units(minor);
        }
        let float = number
            .as_f64()
            .ok_or_else(|| CryptoError::Format("amount out of range".into()))?;
        if !float.is_finite() || float.abs() >= MAX_MAJOR_UNITS {
            return Err(CryptoError::Format("amount out of range".into()));
        }
        number.to_string().parse().map_err(|_| {
            CryptoError::Format("amount has more than two decimal places".into())
        })
    }

    /// The amount as a JSON number. Always a float, e.g. `1234.56` or `500.0`.
    pub fn to_json(self) -> Value {
        Value::from(self.0 as f64 / SCALE as f64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = SCALE as u64;
        write!(f, "{sign}{}.{:02}", abs / scale, abs % scale)
    }
}

impl FromStr for Amount {
    type Err = CryptoError;

    /// Parse `-?\d+(\.\d{1,2})?`. Anything else is a format error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CryptoError::Format("payload is not a canonical amount".into());

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => {
                if f.is_empty() || f.len() > 2 {
                    return Err(invalid());
                }
                (w, f)
            }
            None => (digits, ""),
        };
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || !all_digits(whole) || !all_digits(fraction) {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };
        let minor = whole
            .checked_mul(SCALE)
            .and_then(|m| m.checked_add(fraction))
            .ok_or_else(invalid)?;
        Self::from_minor_units(if negative { -minor } else { minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number(v: Value) -> Number {
        match v {
            Value::Number(n) => n,
            other => panic!("not a number: {other}"),
        }
    }

    #[test]
    fn canonical_form_has_two_decimals() {
        assert_eq!(Amount(123_456).to_string(), "1234.56");
        assert_eq!(Amount(50_000).to_string(), "500.00");
        assert_eq!(Amount(-5).to_string(), "-0.05");
        assert_eq!(Amount(0).to_string(), "0.00");
    }

    #[test]
    fn from_json_accepts_integers_and_cents() {
        assert_eq!(Amount::from_json(&number(json!(500))).unwrap(), Amount(50_000));
        assert_eq!(Amount::from_json(&number(json!(1234.56))).unwrap(), Amount(123_456));
        assert_eq!(Amount::from_json(&number(json!(-0.1))).unwrap(), Amount(-10));
    }

    #[test]
    fn from_json_rejects_sub_cent_precision() {
        let err = Amount::from_json(&number(json!(1.234))).unwrap_err();
        assert!(matches!(err, CryptoError::Format(_)));
    }

    #[test]
    fn from_json_rejects_out_of_range() {
        assert!(Amount::from_json(&number(json!(u64::MAX))).is_err());
        assert!(Amount::from_json(&number(json!(1e300))).is_err());
        assert!(Amount::from_json(&number(json!(10_000_000_000_000i64))).is_err());
        assert!(Amount::from_json(&number(json!(10_000_000_000_000.0))).is_err());
    }

    #[test]
    fn large_amounts_are_exact_or_refused() {
        let parse = |text: &str| Amount::from_json(&serde_json::from_str::<Number>(text).unwrap());

        let largest = parse("9999999999999.99").unwrap();
        assert_eq!(largest, Amount(MAX_MINOR_UNITS));
        assert_eq!(largest.to_string(), "9999999999999.99");
        let Value::Number(emitted) = largest.to_json() else {
            panic!("not a number");
        };
        assert_eq!(Amount::from_json(&emitted).unwrap(), largest);
        assert_eq!(parse("-9999999999999.99").unwrap(), Amount(-MAX_MINOR_UNITS));
        assert_eq!(parse("4398046511104.37").unwrap(), Amount(439_804_651_110_437));

        assert!(parse("70368744177664.01").is_err());
        assert!(Amount::from_minor_units(MAX_MINOR_UNITS + 1).is_err());
    }

    #[test]
    fn near_cent_floats_are_not_rounded() {
        for text in ["1.001", "0.005", "1234.5600001", "0.0000001"] {
            let n = serde_json::from_str::<Number>(text).unwrap();
            assert!(Amount::from_json(&n).is_err(), "accepted {text}");
        }
    }

    #[test]
    fn parse_accepts_canonical_and_short_forms() {
        assert_eq!("1234.56".parse::<Amount>().unwrap(), Amount(123_456));
        assert_eq!("12.5".parse::<Amount>().unwrap(), Amount(1_250));
        assert_eq!("7".parse::<Amount>().unwrap(), Amount(700));
        assert_eq!("-0.05".parse::<Amount>().unwrap(), Amount(-5));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "-", "abc", "1.", ".5", "1.234", "1,00", "+1.00", "1e3", " 1.00"] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn display_then_parse_is_exact() {
        for minor in [0, 1, -1, 99, 100, 123_456, -987_654_321, MAX_MINOR_UNITS] {
            let a = Amount(minor);
            assert_eq!(a.to_string().parse::<Amount>().unwrap(), a);
        }
    }

    #[test]
    fn to_json_matches_parsed_literal() {
        assert_eq!(Amount(123_456).to_json(), json!(1234.56));
        assert_eq!(Amount(50_000).to_json(), json!(500.0));
    }
}
