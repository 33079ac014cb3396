//! Consuming session participating in a subscription.

use std::fmt;

use uuid::Uuid;

/// One live consumer process instance.
///
/// The weight is a hint for the rebalancing policy and is not interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Session {
    pub id: String,
    pub weight: i32,
}

impl Session {
    pub fn new(id: impl Into<String>, weight: i32) -> Self {
        Self {
            id: id.into(),
            weight,
        }
    }

    /// Session with a freshly generated id.
    pub fn with_generated_id(weight: i32) -> Self {
        Self::new(Self::generate_id(), weight)
    }

    /// Random (v4) UUID in hyphenated form.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(weight={})", self.id, self.weight)
    }
}
