//! Serializable identifiers and scheduling primitives shared across modules.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a task in the Task Store.
    TaskId
);
uuid_id!(
    /// Identifier of a resource request.
    RequestId
);
uuid_id!(
    /// Identifier of an operator acknowledgment record.
    AcknowledgmentId
);

/// Request/task priority. Higher values are served first.
///
/// Values at or above [`Priority::URGENT`] are reserved for urgent and
/// error-recovery work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Background work.
    pub const LOW: Self = Self(10);
    /// Default priority for tasks and requests.
    pub const NORMAL: Self = Self(20);
    /// Elevated priority.
    pub const HIGH: Self = Self(30);
    /// Lowest value of the reserved urgent band.
    pub const URGENT: Self = Self(100);

    /// True if this priority falls in the reserved urgent band.
    pub const fn is_urgent(self) -> bool {
        self.0 >= Self::URGENT.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
