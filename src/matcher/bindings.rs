//! Binding sets: variable name to bound value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};

/// Suffix marking a binding as permanent across action execution.
pub const PERMANENT_SUFFIX: char = '!';

/// A variable-to-value assignment produced by one successful match.
///
/// Binding sets are values: every transition copies them, so two strides
/// never alias the same map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bindings(Map<String, Value>);

impl Bindings {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Copy of these bindings with `key` set to `value`.
    pub fn extend_with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut acc = self.clone();
        acc.0.insert(key.into(), value);
        acc
    }

    /// Keep only the listed keys.
    pub fn delete_except(&mut self, keep: &[&str]) {
        self.0.retain(|k, _| keep.contains(&k.as_str()));
    }

    /// The permanent bindings: keys ending in `!`.
    pub fn permanent(&self) -> Bindings {
        Bindings(
            self.0
                .iter()
                .filter(|(k, _)| is_permanent(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert a JSON value into bindings; anything but a map is rejected.
    pub fn from_value(value: Value) -> crate::types::Result<Self> {
        match value {
            Value::Object(m) => Ok(Self(m)),
            other => Err(crate::types::Error::validation(format!(
                "bindings must be a map, got {}",
                other
            ))),
        }
    }
}

impl Deref for Bindings {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Bindings {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Bindings {
    fn from(m: Map<String, Value>) -> Self {
        Self(m)
    }
}

impl FromIterator<(String, Value)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn is_permanent(key: &str) -> bool {
    key.ends_with(PERMANENT_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bs(v: Value) -> Bindings {
        Bindings::from_value(v).unwrap()
    }

    #[test]
    fn test_extend_with_copies() {
        let a = bs(json!({"?x": 1}));
        let b = a.extend_with("?y", json!(2));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_permanent_keys() {
        let b = bs(json!({"config!": {"n": 1}, "?x": 2}));
        let p = b.permanent();
        assert_eq!(p.into_value(), json!({"config!": {"n": 1}}));
    }

    #[test]
    fn test_delete_except() {
        let mut b = bs(json!({"a": 1, "b": 2, "c": 3}));
        b.delete_except(&["a", "c"]);
        assert_eq!(b.into_value(), json!({"a": 1, "c": 3}));
    }

    #[test]
    fn test_from_value_rejects_scalars() {
        assert!(Bindings::from_value(json!(3)).is_err());
    }
}
