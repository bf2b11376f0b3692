use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw value of one data point as it appears in the device JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DpValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Other(serde_json::Value),
}

impl DpValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DpValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integers, plus strings holding a decimal integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DpValue::Int(i) => Some(*i),
            DpValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DpValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpValue::Bool(b) => write!(f, "{b}"),
            DpValue::Int(i) => write!(f, "{i}"),
            DpValue::Str(s) => f.write_str(s),
            DpValue::Other(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for DpValue {
    fn from(value: bool) -> Self {
        DpValue::Bool(value)
    }
}

impl From<i64> for DpValue {
    fn from(value: i64) -> Self {
        DpValue::Int(value)
    }
}

impl From<&str> for DpValue {
    fn from(value: &str) -> Self {
        DpValue::Str(value.to_string())
    }
}

/// Data-point id → raw value. Serializes as the device's string-keyed JSON
/// object (`{"6": 87}`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPointMap(BTreeMap<u32, DpValue>);

impl DataPointMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&DpValue> {
        self.0.get(&id)
    }

    pub fn insert(&mut self, id: u32, value: impl Into<DpValue>) {
        self.0.insert(id, value.into());
    }

    /// Overlays `other`; keys absent from `other` are kept.
    pub fn merge(&mut self, other: &DataPointMap) {
        for (id, value) in &other.0 {
            self.0.insert(*id, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &DpValue)> {
        self.0.iter().map(|(id, v)| (*id, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, DpValue)> for DataPointMap {
    fn from_iter<T: IntoIterator<Item = (u32, DpValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
