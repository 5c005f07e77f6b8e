//! Typed identifiers. Every entity id is a `Uuid` underneath, but mixing a
//! `DeviceId` up with an `InstanceId` is a compile error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// A fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
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

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

typed_id!(
    /// Identifies a pipeline.
    PipelineId
);
typed_id!(
    /// Identifies a pipeline stage.
    StageId
);
typed_id!(
    /// Identifies a managed Node-RED instance ("project").
    InstanceId
);
typed_id!(
    /// Identifies an edge device.
    DeviceId
);
typed_id!(
    /// Identifies a configuration snapshot.
    SnapshotId
);
typed_id!(TeamId);
typed_id!(ApplicationId);
typed_id!(UserId);
