use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::hash::sha256_hex;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self)
            }
        }

        impl From<Ulid> for $name {
            fn from(value: Ulid) -> Self {
                Self(value)
            }
        }
    };
}

record_id!(
    /// Identifies one immutable fact version in the canon.
    FactId
);
record_id!(
    /// Identifies one entry of an audit chain.
    AuditId
);
record_id!(FactConflictId);
record_id!(CanonSnapshotId);
record_id!(ElementId);
record_id!(HistoryId);
record_id!(ContextSnapshotId);
record_id!(
    /// Identifies a conflict registered with the resolver.
    ConflictId
);
record_id!(IntentId);

/// Deterministic id source owned by one store instance.
///
/// The timestamp half of every ULID comes from the injected clock; the random
/// half is derived from `sha256(namespace:seed:discriminator:counter)`, so a
/// replay with the same clock and the same calls yields the same ids. The
/// counter is per instance and strictly increasing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IdSequence {
    namespace: &'static str,
    seed: String,
    counter: u64,
}

impl IdSequence {
    #[must_use]
    pub fn new(namespace: &'static str) -> Self {
        Self { namespace, seed: String::new(), counter: 0 }
    }

    /// Continue a sequence after its store was rebuilt from persisted state.
    /// `seed` should commit to that state (a chain head works well) so new ids
    /// cannot collide with ids issued before the export.
    #[must_use]
    pub fn resume(namespace: &'static str, seed: &str, counter: u64) -> Self {
        Self { namespace, seed: seed.to_string(), counter }
    }

    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn next(&mut self, at: OffsetDateTime, discriminator: &str) -> Ulid {
        let counter = self.counter;
        self.counter = self.counter.saturating_add(1);

        let material =
            sha256_hex(&format!("{}:{}:{discriminator}:{counter}", self.namespace, self.seed));
        let mut random = [0_u8; 16];
        if let Ok(bytes) = hex::decode(&material[..32]) {
            random.copy_from_slice(&bytes);
        }
        let millis = u64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(0);
        Ulid::from_parts(millis, u128::from_be_bytes(random))
    }
}
