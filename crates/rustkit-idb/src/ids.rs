//! Handle identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub(crate) fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw numeric value.
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Unique request ID.
    RequestId
);
define_id!(
    /// Unique transaction ID. Also the submission order used by the scheduler.
    TransactionId
);
define_id!(
    /// Unique connection ID.
    ConnectionId
);
define_id!(
    /// Unique cursor ID.
    CursorId
);
define_id!(
    /// Identity of one object store incarnation; a store deleted and
    /// re-created under the same name gets a new ID.
    StoreId
);
define_id!(
    /// Identity of one index incarnation.
    IndexId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
