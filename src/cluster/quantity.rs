//! Resource quantities with Kubernetes notation
//!
//! A [`Quantity`] stores its value as a signed count of milli-units in an
//! `i128`, so sums of any realistic number of node or pod quantities stay
//! exact. Parsing accepts the usual suffixes (`m`, `k`, `M`, `G`, `T`, `P`,
//! `E`, `Ki` .. `Ei`) and scientific exponents (`1e3`). Fractions finer than
//! a milli-unit round towards positive infinity, which matches how the API
//! server canonicalises them. Arithmetic saturates instead of overflowing.
//!
//! The API types carry quantities as opaque strings
//! ([`k8s_openapi::apimachinery::pkg::api::resource::Quantity`]);
//! [`from_api_list`] and [`to_api_list`] convert at that boundary.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as ApiQuantity;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::warn;

/// Mapping from resource-class name (cpu, memory, pods, ...) to quantity.
///
/// Ordered so that serialised advertisements are byte-stable between ticks.
pub type ResourceList = BTreeMap<String, Quantity>;

const MILLIS_PER_UNIT: i128 = 1000;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Errors produced while parsing a quantity string
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity '{0}'")]
    Invalid(String),

    #[error("unknown suffix '{suffix}' in quantity '{input}'")]
    UnknownSuffix { input: String, suffix: String },

    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// How a quantity prefers to be printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantityFormat {
    /// Powers of ten (`k`, `M`, `m`)
    #[default]
    DecimalSi,
    /// Powers of two (`Ki`, `Mi`, `Gi`)
    BinarySi,
}

/// An exact resource amount.
///
/// Equality and ordering consider only the numeric value; `4Gi` equals
/// `4294967296`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quantity {
    millis: i128,
    format: QuantityFormat,
}

impl Quantity {
    /// Zero in decimal notation
    pub const fn zero() -> Self {
        Self {
            millis: 0,
            format: QuantityFormat::DecimalSi,
        }
    }

    /// Whole units, e.g. cores or bytes
    pub fn from_units(units: i64) -> Self {
        Self {
            millis: units as i128 * MILLIS_PER_UNIT,
            format: QuantityFormat::DecimalSi,
        }
    }

    /// Milli-units, e.g. millicores
    pub fn from_millis(millis: i128) -> Self {
        Self {
            millis,
            format: QuantityFormat::DecimalSi,
        }
    }

    /// Whole bytes printed in binary notation
    pub fn from_bytes(bytes: i64) -> Self {
        Self {
            millis: bytes as i128 * MILLIS_PER_UNIT,
            format: QuantityFormat::BinarySi,
        }
    }

    pub fn milli_value(&self) -> i128 {
        self.millis
    }

    /// Value in whole units, rounded up
    pub fn value(&self) -> i128 {
        let units = self.millis.div_euclid(MILLIS_PER_UNIT);
        if self.millis.rem_euclid(MILLIS_PER_UNIT) == 0 {
            units
        } else {
            units + 1
        }
    }

    pub fn format(&self) -> QuantityFormat {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn is_negative(&self) -> bool {
        self.millis < 0
    }

    /// Approximate floating point value in whole units
    pub fn as_f64(&self) -> f64 {
        self.millis as f64 / MILLIS_PER_UNIT as f64
    }

    /// `self * percent / 100`, rounded towards zero at milli resolution.
    pub fn scaled_percent(&self, percent: u8) -> Self {
        let percent = percent as i128;
        let millis = match self.millis.checked_mul(percent) {
            Some(product) => product / 100,
            None => self.millis / 100 * percent,
        };
        Self {
            millis,
            format: self.format,
        }
    }

    /// Negative values become zero.
    pub fn clamp_non_negative(self) -> Self {
        if self.millis < 0 {
            Self {
                millis: 0,
                format: self.format,
            }
        } else {
            self
        }
    }

    fn with_format(mut self, format: QuantityFormat) -> Self {
        self.format = format;
        self
    }
}

// ============================================================================
// Parsing
// ============================================================================

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_quantity(input)
    }
}

/// Parse a quantity in Kubernetes notation.
pub fn parse_quantity(input: &str) -> Result<Quantity, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_len = body
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(body.len());
    let (number, suffix) = body.split_at(number_len);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(QuantityError::Invalid(input.to_string()));
    }

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    let digits = format!("{}{}", int_part, frac_part);
    let out_of_range = || QuantityError::OutOfRange(input.to_string());

    let mantissa: i128 = digits.parse().map_err(|_| out_of_range())?;
    let mut denominator: i128 = pow10(frac_part.len() as u32).ok_or_else(out_of_range)?;

    let (factor, format) = suffix_factor(suffix, input)?;
    let numerator = match factor {
        SuffixFactor::Multiply(f) => mantissa.checked_mul(f).ok_or_else(out_of_range)?,
        SuffixFactor::Divide(d) => {
            denominator = denominator.checked_mul(d).ok_or_else(out_of_range)?;
            mantissa
        }
    };

    // Sub-milli remainders round towards positive infinity: truncation
    // already does that for negative values.
    let mut millis = numerator / denominator;
    if negative {
        millis = -millis;
    } else if numerator % denominator != 0 {
        millis += 1;
    }

    Ok(Quantity { millis, format })
}

enum SuffixFactor {
    /// Multiply the mantissa by this many milli-units
    Multiply(i128),
    /// Divide the milli-unit value by this amount
    Divide(i128),
}

fn suffix_factor(suffix: &str, input: &str) -> Result<(SuffixFactor, QuantityFormat), QuantityError> {
    let out_of_range = || QuantityError::OutOfRange(input.to_string());

    match suffix {
        "" => return Ok((SuffixFactor::Multiply(MILLIS_PER_UNIT), QuantityFormat::DecimalSi)),
        "m" => return Ok((SuffixFactor::Multiply(1), QuantityFormat::DecimalSi)),
        _ => {}
    }

    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        let factor = 1024i128.pow(*power) * MILLIS_PER_UNIT;
        return Ok((SuffixFactor::Multiply(factor), QuantityFormat::BinarySi));
    }

    if let Some((_, power)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        let factor = pow10(3 * power).ok_or_else(out_of_range)? * MILLIS_PER_UNIT;
        return Ok((SuffixFactor::Multiply(factor), QuantityFormat::DecimalSi));
    }

    if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
        let exponent: i32 = exp.parse().map_err(|_| QuantityError::UnknownSuffix {
            input: input.to_string(),
            suffix: suffix.to_string(),
        })?;
        // Milli-units are 10^3, so shift the exponent by three.
        let shifted = exponent + 3;
        let factor = if shifted >= 0 {
            SuffixFactor::Multiply(pow10(shifted as u32).ok_or_else(out_of_range)?)
        } else {
            SuffixFactor::Divide(pow10(shifted.unsigned_abs()).ok_or_else(out_of_range)?)
        };
        return Ok((factor, QuantityFormat::DecimalSi));
    }

    Err(QuantityError::UnknownSuffix {
        input: input.to_string(),
        suffix: suffix.to_string(),
    })
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

// ============================================================================
// Formatting
// ============================================================================

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % MILLIS_PER_UNIT != 0 {
            return write!(f, "{}m", self.millis);
        }

        let units = self.millis / MILLIS_PER_UNIT;
        if units == 0 {
            return write!(f, "0");
        }

        if self.format == QuantityFormat::BinarySi {
            for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
                let base = 1024i128.pow(*power);
                if units % base == 0 {
                    return write!(f, "{}{}", units / base, suffix);
                }
            }
        }

        for (suffix, power) in DECIMAL_SUFFIXES.iter().rev() {
            let base = 10i128.pow(3 * power);
            if units % base == 0 {
                return write!(f, "{}{}", units / base, suffix);
            }
        }

        write!(f, "{}", units)
    }
}

// ============================================================================
// Arithmetic and comparison
// ============================================================================

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

// The left-hand side keeps its format; a zero accumulator adopts the format
// of the first value added to it.
impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        let format = if self.millis == 0 { rhs.format } else { self.format };
        Quantity {
            millis: self.millis.saturating_add(rhs.millis),
            format,
        }
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = *self + rhs;
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity {
            millis: self.millis.saturating_sub(rhs.millis),
            format: self.format,
        }
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Quantity) {
        *self = *self - rhs;
    }
}

/// Add every entry of `to_add` into `dst`, starting absent classes at zero.
pub fn add_resource_lists(dst: &mut ResourceList, to_add: &ResourceList) {
    for (name, quantity) in to_add {
        dst.entry(name.clone())
            .and_modify(|existing| *existing += *quantity)
            .or_insert(*quantity);
    }
}

/// Per-class `max(a, b)`; classes missing on one side count as zero.
pub fn max_resource_lists(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let mut out = a.clone();
    for (name, quantity) in b {
        out.entry(name.clone())
            .and_modify(|existing| {
                if *quantity > *existing {
                    *existing = quantity.with_format(existing.format);
                }
            })
            .or_insert(*quantity);
    }
    out
}

/// Build a resource list from `(name, quantity)` string pairs.
pub fn resource_list<'a, I>(entries: I) -> Result<ResourceList, QuantityError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    entries
        .into_iter()
        .map(|(name, value)| Ok((name.to_string(), parse_quantity(value)?)))
        .collect()
}

// ============================================================================
// Conversion to and from the API types
// ============================================================================

impl TryFrom<&ApiQuantity> for Quantity {
    type Error = QuantityError;

    fn try_from(value: &ApiQuantity) -> Result<Self, Self::Error> {
        parse_quantity(&value.0)
    }
}

impl From<Quantity> for ApiQuantity {
    fn from(value: Quantity) -> Self {
        ApiQuantity(value.to_string())
    }
}

/// Parse an API resource list. Entries that are not valid quantities are
/// skipped with a warning so one malformed object cannot stall accounting.
pub fn from_api_list(list: Option<&BTreeMap<String, ApiQuantity>>) -> ResourceList {
    let Some(list) = list else {
        return ResourceList::new();
    };

    list.iter()
        .filter_map(|(name, value)| match Quantity::try_from(value) {
            Ok(quantity) => Some((name.clone(), quantity)),
            Err(e) => {
                warn!("Ignoring resource '{}': {}", name, e);
                None
            }
        })
        .collect()
}

pub fn to_api_list(list: &ResourceList) -> BTreeMap<String, ApiQuantity> {
    list.iter()
        .map(|(name, quantity)| (name.clone(), ApiQuantity::from(*quantity)))
        .collect()
}

// ============================================================================
// Serde: quantities travel as strings, numbers are accepted on input
// ============================================================================

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                parse_quantity(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::from_units(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                Ok(Quantity::from_millis(v as i128 * MILLIS_PER_UNIT))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Quantity, E> {
                parse_quantity(&v.to_string()).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        parse_quantity(s).unwrap()
    }

    #[test]
    fn test_parse_plain_and_milli() {
        assert_eq!(q("4").milli_value(), 4000);
        assert_eq!(q("500m").milli_value(), 500);
        assert_eq!(q("1.5").milli_value(), 1500);
        assert_eq!(q("0.1").milli_value(), 100);
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(q("8Gi").value(), 8 * 1024 * 1024 * 1024);
        assert_eq!(q("2k").value(), 2000);
        assert_eq!(q("1M").value(), 1_000_000);
        assert_eq!(q("1e3").value(), 1000);
        assert_eq!(q("5e-3").milli_value(), 5);
        assert_eq!(q("1.5Gi").value(), 1536 * 1024 * 1024);
    }

    #[test]
    fn test_sub_milli_rounds_up() {
        assert_eq!(q("0.0001").milli_value(), 1);
        assert_eq!(q("1e-6").milli_value(), 1);
    }

    #[test]
    fn test_negative_sub_milli_rounds_towards_zero() {
        assert!(q("-0.0001").is_zero());
        assert_eq!(q("-1.0005").milli_value(), -1000);
        assert_eq!(q("-1500m").milli_value(), -1500);
    }

    #[test]
    fn test_arithmetic_saturates() {
        let max = Quantity::from_millis(i128::MAX);
        let min = Quantity::from_millis(i128::MIN);
        assert_eq!((max + q("1")).milli_value(), i128::MAX);
        assert_eq!((min - q("1")).milli_value(), i128::MIN);
        assert_eq!(max.scaled_percent(100).milli_value(), i128::MAX / 100 * 100);
        assert_eq!(max.scaled_percent(50).milli_value(), i128::MAX / 100 * 50);
    }

    #[test]
    fn test_api_list_conversion() {
        let mut api = BTreeMap::new();
        api.insert("cpu".to_string(), ApiQuantity("1500m".to_string()));
        api.insert("memory".to_string(), ApiQuantity("4Gi".to_string()));
        api.insert("broken".to_string(), ApiQuantity("lots".to_string()));

        let list = from_api_list(Some(&api));
        assert_eq!(list.len(), 2);
        assert_eq!(list["cpu"], q("1500m"));
        assert_eq!(to_api_list(&list)["memory"], ApiQuantity("4Gi".to_string()));
        assert!(from_api_list(None).is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_quantity(""), Err(QuantityError::Empty));
        assert!(matches!(parse_quantity("abc"), Err(QuantityError::Invalid(_))));
        assert!(matches!(parse_quantity("1.2.3"), Err(QuantityError::Invalid(_))));
        assert!(matches!(
            parse_quantity("4Xi"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
    }

    #[test]
    fn test_display_keeps_notation() {
        assert_eq!(q("4Gi").to_string(), "4Gi");
        assert_eq!(q("8Gi").scaled_percent(50).to_string(), "4Gi");
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!(q("3000").to_string(), "3k");
        assert_eq!(Quantity::zero().to_string(), "0");
    }

    #[test]
    fn test_equality_ignores_format() {
        assert_eq!(q("1Ki"), q("1024"));
        assert!(q("1") > q("999m"));
    }

    #[test]
    fn test_repeated_addition_is_exact() {
        let mut total = Quantity::zero();
        for _ in 0..10_000 {
            total += q("100m");
        }
        assert_eq!(total, q("1000"));
    }

    #[test]
    fn test_zero_accumulator_adopts_format() {
        let total = Quantity::zero() + q("1Gi");
        assert_eq!(total.format(), QuantityFormat::BinarySi);
        assert_eq!(total.to_string(), "1Gi");
    }

    #[test]
    fn test_clamp_and_scale() {
        let negative = q("1") - q("3");
        assert!(negative.is_negative());
        assert!(negative.clamp_non_negative().is_zero());
        assert_eq!(q("4").scaled_percent(50), q("2"));
        assert_eq!(q("3").scaled_percent(33), q("990m"));
    }

    #[test]
    fn test_add_resource_lists() {
        let mut dst = resource_list([("cpu", "1")]).unwrap();
        let add = resource_list([("cpu", "500m"), ("memory", "1Gi")]).unwrap();
        add_resource_lists(&mut dst, &add);
        assert_eq!(dst["cpu"], q("1500m"));
        assert_eq!(dst["memory"], q("1Gi"));
    }

    #[test]
    fn test_max_resource_lists() {
        let a = resource_list([("cpu", "1"), ("memory", "1Gi")]).unwrap();
        let b = resource_list([("cpu", "2"), ("pods", "3")]).unwrap();
        let max = max_resource_lists(&a, &b);
        assert_eq!(max["cpu"], q("2"));
        assert_eq!(max["memory"], q("1Gi"));
        assert_eq!(max["pods"], q("3"));
    }

    #[test]
    fn test_serde_roundtrip_and_numbers() {
        let list: ResourceList =
            serde_json::from_str(r#"{"cpu": "250m", "memory": "2Gi", "pods": 110}"#).unwrap();
        assert_eq!(list["pods"], q("110"));
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(json, r#"{"cpu":"250m","memory":"2Gi","pods":"110"}"#);
    }
}
