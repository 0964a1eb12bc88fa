//! Scalar-unit quantities such as `10 GB`, `30 s` or `2.4 GHz`.
//!
//! Values are normalised to a base unit (bytes, seconds, hertz) so that
//! comparisons across units convert instead of comparing strings.

use std::cmp::Ordering;

/// The dimension a unit belongs to. Quantities only compare within a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
  Size,
  Time,
  Frequency,
}

/// A parsed quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
  pub value: f64,
  pub unit: String,
  pub dimension: Dimension,
  /// `value` expressed in the base unit of `dimension`.
  pub normalized: f64,
}

impl Quantity {
  pub fn partial_cmp_quantity(&self, other: &Quantity) -> Option<Ordering> {
    if self.dimension != other.dimension {
      return None;
    }
    self.normalized.partial_cmp(&other.normalized)
  }
}

const SIZE_UNITS: &[(&str, f64)] = &[
  ("b", 1.0),
  ("kb", 1e3),
  ("kib", 1024.0),
  ("mb", 1e6),
  ("mib", 1_048_576.0),
  ("gb", 1e9),
  ("gib", 1_073_741_824.0),
  ("tb", 1e12),
  ("tib", 1_099_511_627_776.0),
];

const TIME_UNITS: &[(&str, f64)] = &[
  ("d", 86_400.0),
  ("h", 3_600.0),
  ("m", 60.0),
  ("s", 1.0),
  ("ms", 1e-3),
  ("us", 1e-6),
  ("ns", 1e-9),
];

const FREQUENCY_UNITS: &[(&str, f64)] = &[("hz", 1.0), ("khz", 1e3), ("mhz", 1e6), ("ghz", 1e9)];

/// Parse `"<number> <unit>"`. Units are case-insensitive; the space is optional.
pub fn parse_quantity(text: &str) -> Option<Quantity> {
  let text = text.trim();
  let split = text.find(|c: char| c.is_ascii_alphabetic())?;
  let (number, unit) = text.split_at(split);
  let number = number.trim();
  if number.is_empty() {
    return None;
  }
  let value: f64 = number.parse().ok()?;
  let unit = unit.trim();
  let lower = unit.to_ascii_lowercase();

  let tables = [
    (Dimension::Size, SIZE_UNITS),
    (Dimension::Time, TIME_UNITS),
    (Dimension::Frequency, FREQUENCY_UNITS),
  ];
  for (dimension, table) in tables {
    if let Some((_, factor)) = table.iter().find(|(name, _)| *name == lower) {
      return Some(Quantity {
        value,
        unit: unit.to_string(),
        dimension,
        normalized: value * factor,
      });
    }
  }
  None
}

/// Convenience for size properties: the number of bytes in `text`.
pub fn parse_bytes(text: &str) -> Option<f64> {
  parse_quantity(text)
    .filter(|q| q.dimension == Dimension::Size)
    .map(|q| q.normalized)
}
