//! Counters and clocks shared across the engine.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Wraps a raw counter value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw counter value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Identifies a transaction. Ids increase per engine and are never
    /// reused while the engine runs.
    TransactionId,
    "txn"
);

counter_id!(
    /// Orders commits. Each commit gets the next number, starting at 1.
    SequenceNumber,
    "seq"
);

/// Wall-clock milliseconds since the Unix epoch, or 0 if the clock is set
/// before it.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
