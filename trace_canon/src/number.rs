use std::fmt;

use ethereum_types::U256;
use serde::{de, Deserialize, Deserializer};

/// Failure to read a numeric trace field.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuantityError {
    /// The text is neither `0x`-prefixed hex nor decimal.
    #[error("invalid number {0:?}")]
    Invalid(String),
    /// The value does not fit in 256 bits.
    #[error("number {0:?} overflows 256 bits")]
    Overflow(String),
}

/// Parse a client-reported number.
///
/// `0x`-prefixed text is hex, anything else is decimal. Surrounding
/// whitespace is ignored.
pub fn parse_quantity(s: &str) -> Result<U256, QuantityError> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => (digits, 16),
        None => (s, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(QuantityError::Invalid(s.to_owned()));
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    match radix {
        16 if digits.len() > 64 => Err(QuantityError::Overflow(s.to_owned())),
        16 => U256::from_str_radix(digits, 16).map_err(|_| QuantityError::Invalid(s.to_owned())),
        _ => U256::from_dec_str(digits).map_err(|_| QuantityError::Overflow(s.to_owned())),
    }
}

/// A number as clients print it: a JSON number, a hex string or a decimal
/// string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quantity(pub U256);

impl From<Quantity> for U256 {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative number, or a hex or decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Quantity(v.into()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|v| Quantity(v.into()))
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse_quantity(v).map(Quantity).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
