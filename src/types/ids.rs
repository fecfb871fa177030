//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `new()` (UUID v4), `from_string()`, `as_str()`,
/// Display, Serialize, Deserialize and `From<&str>` for literals in tests
/// and configuration.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: impl Into<String>) -> crate::types::Result<Self> {
                let s = s.into();
                if s.is_empty() {
                    return Err(crate::types::Error::validation(concat!(
                        stringify!($name),
                        " cannot be empty"
                    )));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(CrewId);
define_id!(MachineId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_id_rejected() {
        assert!(CrewId::from_string("").is_err());
        assert!(MachineId::from_string(String::new()).is_err());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(CrewId::new(), CrewId::new());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let mid = MachineId::from_string("doubler").unwrap();
        assert_eq!(serde_json::to_value(&mid).unwrap(), serde_json::json!("doubler"));
        let back: MachineId = serde_json::from_value(serde_json::json!("doubler")).unwrap();
        assert_eq!(back, mid);
    }
}
