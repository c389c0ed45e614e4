//! Domain identifiers (strongly-typed IDs).
//!
//! Two families live here:
//!
//! - Kernel-issued ids (`TaskId`, `AuditId`, `TicketId`) are ULIDs wrapped in a
//!   phantom-typed `Id<T>`, so a `TaskId` can never be passed where an
//!   `AuditId` is expected. ULIDs sort by creation time, which the audit log
//!   and the queue rely on for stable ordering.
//! - Collaborator-supplied names (`AgentId`, `WorkerId`, `NodeId`, ...) are
//!   opaque strings wrapped in newtypes via `string_id!`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each kernel-issued id type.
pub trait IdMarker: Send + Sync + 'static {
    /// Display prefix (e.g. "task-").
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// Serializes as the bare ULID string; `Display` adds the type prefix.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the prefixed display form and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Audit {}

impl IdMarker for Audit {
    fn prefix() -> &'static str {
        "audit-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ticket {}

impl IdMarker for Ticket {
    fn prefix() -> &'static str {
        "ticket-"
    }
}

/// Identifier of a submitted task.
pub type TaskId = Id<Task>;

/// Identifier of one audit record.
pub type AuditId = Id<Audit>;

/// Identifier of a pending approval request.
pub type TicketId = Id<Ticket>;

/// Declares an opaque string newtype with the usual conversions.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

pub(crate) use string_id;

string_id!(
    /// Conversation the task was submitted from.
    ConversationId
);
string_id!(
    /// Agent definition a task runs under (e.g. "researcher").
    AgentId
);
string_id!(
    /// Self-declared identity of a polling worker.
    WorkerId
);
string_id!(
    /// Provenance-based permission ceiling (e.g. "user", "shared").
    TrustContextId
);
string_id!(
    /// Stable identifier of a node in the consuming application's data.
    NodeId
);
