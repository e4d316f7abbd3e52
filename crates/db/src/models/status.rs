//! Status helper enums mapping to SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data in the
//! corresponding lookup table (`request_statuses`, `task_states`).

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID, `None` if unknown.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Lowercase name as seeded in the lookup table.
            pub fn label(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.label())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

define_status_enum! {
    /// Translation request lifecycle.
    RequestStatus {
        Queued = 1 => "queued",
        Processing = 2 => "processing",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
    }
}

define_status_enum! {
    /// Durable queue task state.
    TaskState {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Done = 3 => "done",
        Dead = 4 => "dead",
    }
}

impl RequestStatus {
    /// `completed` and `failed` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `processing -> processing` is allowed (progress updates); any
    /// non-terminal state may fail; only `processing` may complete.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Completed | Self::Failed, _) => false,
            (Self::Queued | Self::Processing, Self::Processing) => true,
            (Self::Processing, Self::Completed) => true,
            (Self::Queued | Self::Processing, Self::Failed) => true,
            _ => false,
        }
    }
}
