// Column values: a closed tagged union plus an exact fixed-point decimal.
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::core::error::{Error, ErrorKind};

pub const DECIMAL_MAX_SCALE: u8 = 38;

/// Exact decimal `mantissa * 10^-scale`, always normalized so equal numbers have
/// identical representations (`1.50` is stored as mantissa 15, scale 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i128,
    scale: u8,
}

impl Decimal {
    pub fn new(mantissa: i128, scale: u8) -> Result<Self, Error> {
        if scale > DECIMAL_MAX_SCALE {
            return Err(Error::new(ErrorKind::Schema)
                .with_message(format!("decimal scale {scale} exceeds {DECIMAL_MAX_SCALE}")));
        }
        Ok(Self { mantissa, scale }.normalized())
    }

    pub fn from_i64(value: i64) -> Self {
        Self {
            mantissa: i128::from(value),
            scale: 0,
        }
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        if self.mantissa == 0 {
            self.scale = 0;
        }
        self
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::new(ErrorKind::Schema).with_message(format!("invalid decimal literal '{input}'"))
        };
        let text = input.trim();
        let (negative, digits) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u8::try_from(frac_part.len()).map_err(|_| invalid())?;
        let combined = format!("{int_part}{frac_part}");
        let magnitude: i128 = combined.parse().map_err(|_| invalid())?;
        let mantissa = if negative { -magnitude } else { magnitude };
        Self::new(mantissa, scale)
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.scale == other.scale {
            return self.mantissa.cmp(&other.mantissa);
        }
        let (low, high, flipped) = if self.scale < other.scale {
            (self, other, false)
        } else {
            (other, self, true)
        };
        let diff = u32::from(high.scale - low.scale);
        let ordering = match 10i128
            .checked_pow(diff)
            .and_then(|factor| low.mantissa.checked_mul(factor))
        {
            Some(scaled) => scaled.cmp(&high.mantissa),
            // The scaled value is out of i128 range, so its sign decides.
            None if low.mantissa > 0 => Ordering::Greater,
            None => Ordering::Less,
        };
        if flipped { ordering.reverse() } else { ordering }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = usize::from(self.scale);
        let sign = if self.mantissa < 0 { "-" } else { "" };
        if digits.len() <= scale {
            write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
        } else {
            let (int_part, frac_part) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int_part}.{frac_part}")
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Decimal(Decimal),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INT",
            Value::Text(_) => "TEXT",
            Value::Decimal(_) => "DECIMAL",
            Value::Boolean(_) => "BOOLEAN",
        }
    }

    /// SQL-style comparison: anything involving NULL is unknown, INT and DECIMAL
    /// compare numerically, other mixed types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Decimal(b)) => Some(Decimal::from_i64(*a).cmp(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp(&Decimal::from_i64(*b))),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) => 2,
            Value::Decimal(_) => 3,
            Value::Text(_) => 4,
        }
    }
}

// Total order used for index keys. Keys of one index always share a variant, so
// the cross-variant rank only keeps the order total.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Text(value) => write!(f, "{value}"),
            Value::Decimal(value) => write!(f, "{value}"),
            Value::Boolean(value) => write!(f, "{}", if *value { "TRUE" } else { "FALSE" }),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Decimal, Value};
    use crate::core::error::ErrorKind;
    use std::cmp::Ordering;

    fn dec(text: &str) -> Decimal {
        text.parse().expect("decimal")
    }

    #[test]
    fn decimal_parse_normalizes() {
        assert_eq!(dec("1.50"), dec("1.5"));
        assert_eq!(dec("1.50").to_string(), "1.5");
        assert_eq!(dec("-0.001").to_string(), "-0.001");
        assert_eq!(dec("-0.0").to_string(), "0");
        assert_eq!(dec(".5").to_string(), "0.5");
        assert_eq!(dec("+42").to_string(), "42");
    }

    #[test]
    fn decimal_rejects_garbage() {
        for input in ["", ".", "1.2.3", "abc", "1e5", "--1"] {
            let err = input.parse::<Decimal>().expect_err(input);
            assert_eq!(err.kind(), ErrorKind::Schema);
        }
    }

    #[test]
    fn decimal_orders_across_scales() {
        assert_eq!(dec("1.5").cmp(&dec("1.25")), Ordering::Greater);
        assert_eq!(dec("-1.5").cmp(&dec("-1.25")), Ordering::Less);
        assert_eq!(dec("2").cmp(&dec("1.999")), Ordering::Greater);
        assert_eq!(dec("0.1").cmp(&dec("0.10")), Ordering::Equal);
    }

    #[test]
    fn decimal_order_survives_overflowing_rescale() {
        let big = Decimal::new(i128::MAX / 2, 0).expect("big");
        let tiny = Decimal::new(1, 38).expect("tiny");
        assert_eq!(big.cmp(&tiny), Ordering::Greater);
        assert_eq!(tiny.cmp(&big), Ordering::Less);
        let neg = Decimal::new(i128::MIN / 2, 0).expect("neg");
        assert_eq!(neg.cmp(&tiny), Ordering::Less);
    }

    #[test]
    fn sql_compare_treats_null_as_unknown() {
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::Int(2).compare(&Value::Decimal(dec("1.5"))), Some(Ordering::Greater));
        assert_eq!(Value::Text("a".into()).compare(&Value::Int(1)), None);
    }
}
