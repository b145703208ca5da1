//! Stream attributes: named, typed constants published with the write
//! pattern.
//!
//! Attributes carry no step data. A writer defines them once (or
//! redefines them between steps) and every full exchange ships the
//! current set to the readers alongside the blocks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attributes by name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Value of one attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// One string.
    #[serde(rename = "s")]
    Text(String),
    /// An array of strings.
    #[serde(rename = "S")]
    TextArray(Vec<String>),
    /// Signed integers; a single value is an array of one.
    #[serde(rename = "i")]
    Int(Vec<i64>),
    /// Unsigned integers.
    #[serde(rename = "u")]
    UInt(Vec<u64>),
    /// Floating-point values.
    #[serde(rename = "f")]
    Float(Vec<f64>),
}

impl AttributeValue {
    /// Number of elements (one for [`AttributeValue::Text`]).
    pub fn len(&self) -> usize {
        match self {
            Self::Text(_) => 1,
            Self::TextArray(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::UInt(v) => v.len(),
            Self::Float(v) => v.len(),
        }
    }

    /// Whether the value holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The text of a single-string attribute.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s:?}"),
            Self::TextArray(v) => write!(f, "{v:?}"),
            Self::Int(v) => write!(f, "{v:?}"),
            Self::UInt(v) => write!(f, "{v:?}"),
            Self::Float(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(v: Vec<String>) -> Self {
        Self::TextArray(v)
    }
}

macro_rules! numeric_attribute {
    ($variant:ident, $t:ty) => {
        impl From<$t> for AttributeValue {
            fn from(v: $t) -> Self {
                Self::$variant(vec![v])
            }
        }

        impl From<Vec<$t>> for AttributeValue {
            fn from(v: Vec<$t>) -> Self {
                Self::$variant(v)
            }
        }

        impl From<&[$t]> for AttributeValue {
            fn from(v: &[$t]) -> Self {
                Self::$variant(v.to_vec())
            }
        }
    };
}

numeric_attribute!(Int, i64);
numeric_attribute!(UInt, u64);
numeric_attribute!(Float, f64);

/// Merge per-writer attribute sets in ascending rank order.
///
/// When writers disagree on a name, the lowest rank's value is kept.
pub fn merge_attributes<'a>(sets: impl IntoIterator<Item = &'a Attributes>) -> Attributes {
    let mut merged = Attributes::new();
    for set in sets {
        for (name, value) in set {
            merged
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_pick_the_matching_variant() {
        assert_eq!(AttributeValue::from("K"), AttributeValue::Text("K".into()));
        assert_eq!(AttributeValue::from(3i64), AttributeValue::Int(vec![3]));
        assert_eq!(
            AttributeValue::from(vec![0.5f64, 1.5]),
            AttributeValue::Float(vec![0.5, 1.5])
        );
        assert_eq!(AttributeValue::from(&[7u64][..]).len(), 1);
        assert!(AttributeValue::TextArray(vec![]).is_empty());
    }

    #[test]
    fn lowest_rank_wins_on_disagreement() {
        let r0 = Attributes::from([("units".to_string(), AttributeValue::from("K"))]);
        let r1 = Attributes::from([
            ("units".to_string(), AttributeValue::from("C")),
            ("dt".to_string(), AttributeValue::from(0.1f64)),
        ]);
        let merged = merge_attributes([&r0, &r1]);
        assert_eq!(merged["units"].as_text(), Some("K"));
        assert_eq!(merged["dt"], AttributeValue::Float(vec![0.1]));
    }

    #[test]
    fn values_use_short_tags() {
        let json = serde_json::to_value(AttributeValue::from(vec![1i64, 2])).unwrap();
        assert_eq!(json, serde_json::json!({ "i": [1, 2] }));
    }
}
