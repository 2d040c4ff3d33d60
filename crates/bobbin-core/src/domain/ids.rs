//! Domain identifiers (strongly-typed IDs).
//!
//! Every id is a ULID wrapped in `Id<T>`, where `T` is a zero-sized marker.
//! A `TaskId` and a `GroupId` share one implementation but can never be
//! mixed up at compile time.
//!
//! On the wire an id is the bare 26-character ULID string; `Display` adds a
//! human-readable prefix (`task-`, `group-`) for logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker supplies the display prefix of each id kind.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
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

    /// Fresh id from the system clock. Prefer `IdGenerator` inside the app.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Storage key suffix (no prefix).
    pub fn key(&self) -> String {
        self.ulid.to_string()
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

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    /// Accepts both the bare ULID and the prefixed display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

macro_rules! id_kind {
    ($(#[$meta:meta])* $marker:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_kind!(Task => "task-");
id_kind!(Group => "group-");

/// Identifier of one task invocation. Retries keep the same id.
pub type TaskId = Id<Task>;

/// Identifier shared by all members of a group or chord header.
pub type GroupId = Id<Group>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_prefixed_wire_form_is_bare() {
        let id = TaskId::generate();

        assert_eq!(id.to_string(), format!("task-{}", id.key()));
        assert_eq!(serde_json::to_value(id).unwrap(), serde_json::json!(id.key()));
        let back: TaskId = serde_json::from_value(serde_json::json!(id.key())).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let id = GroupId::generate();
        assert_eq!(id.to_string().parse::<GroupId>().unwrap(), id);
        assert_eq!(id.key().parse::<GroupId>().unwrap(), id);
        assert!("group-not-a-ulid".parse::<GroupId>().is_err());
    }

    #[test]
    fn same_ulid_in_both_kinds_keeps_its_own_prefix() {
        let ulid = Ulid::new();
        let task = TaskId::from(ulid);
        let group = GroupId::from(ulid);

        assert_eq!(task.as_ulid(), group.as_ulid());
        assert_ne!(task.to_string(), group.to_string());
        assert_eq!(std::mem::size_of::<TaskId>(), std::mem::size_of::<Ulid>());
    }
}
