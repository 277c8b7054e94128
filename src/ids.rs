//! Branded identifiers.
//!
//! Each ID kind is a distinct newtype over `String` so the compiler
//! rejects passing a `NodeId` where a `TreeId` is expected, even though
//! both are strings underneath. No `From` impl exists between different
//! ID kinds — converting between them is always a deliberate
//! `.as_str()`/`.to_string()` at a call site, never implicit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! branded_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw string as this ID kind.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrows the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id!(TreeId, "Identifies a tree.");
branded_id!(NodeId, "Identifies a node within a process; unique across all trees.");
branded_id!(EntityId, "Identifies a Group or Relational entity body.");

/// Identifies a working copy. Spec §3 defines the Ephemeral Store's
/// working-copy table as keyed by `NodeId` directly — the same id as
/// the node being staged, or a freshly minted node id for a draft — so
/// this is a type alias rather than a fifth branded newtype.
pub type WorkingCopyId = NodeId;

impl TreeId {
    /// The tree's distinguished root node id: `${treeId}Root`.
    pub fn root_id(&self) -> NodeId {
        NodeId::new(format!("{}Root", self.0))
    }

    /// The tree's distinguished trash root node id: `${treeId}Trash`.
    pub fn trash_root_id(&self) -> NodeId {
        NodeId::new(format!("{}Trash", self.0))
    }

    /// The tree's distinguished super root node id: `${treeId}SuperRoot`.
    pub fn super_root_id(&self) -> NodeId {
        NodeId::new(format!("{}SuperRoot", self.0))
    }
}

/// Mints process-monotone string IDs with a fixed prefix.
///
/// A plain incrementing integer rendered into the branded string ID
/// kinds above.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: &'static str,
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator that mints IDs as `{prefix}{n}` starting at 1.
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(1),
        }
    }

    /// Mints the next raw string in the sequence.
    pub fn next_raw(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}
