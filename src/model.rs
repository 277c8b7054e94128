//! Data models for the tree store: trees, nodes, working copies, command
//! envelopes, and change events.
//!
//! # Key types
//!
//! - [`Tree`] — a named hierarchy with its three distinguished nodes.
//! - [`Node`] — a participant in a tree.
//! - [`WorkingCopy`] — a staged edit kept in the Ephemeral Store.
//! - [`CommandEnvelope`] — the unit submitted to [`crate::engine::Engine::submit`].
//! - [`ChangeEvent`] — what subscribers receive.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EntityId, NodeId, TreeId, WorkingCopyId};

/// Registered node-type identifier, e.g. `"folder"`, `"basemap"`.
pub type NodeType = String;

/// Milliseconds since the Unix epoch. The engine never reads the system
/// clock itself except through [`now_millis`], so tests can construct
/// nodes with arbitrary timestamps.
pub type Millis = u64;

/// Current wall-clock time in milliseconds, used as the default for
/// `createdAt`/`updatedAt`/`removedAt`/`issuedAt` when a caller doesn't
/// supply one.
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Millis
}

/// A named hierarchy with a regular root, a trash root, and a super
/// root, all three created atomically with the tree and never moved,
/// renamed, or removed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tree {
    /// This tree's id.
    pub id: TreeId,
    /// Display name.
    pub name: String,
    /// The tree's regular root node id (`${id}Root`).
    pub root_id: NodeId,
    /// The tree's trash root node id (`${id}Trash`).
    pub trash_root_id: NodeId,
    /// The tree's super root node id (`${id}SuperRoot`), parent of both
    /// the regular root and the trash root.
    pub super_root_id: NodeId,
}

/// A node participating in a tree.
///
/// See spec §3 for the full invariant set; the most load-bearing ones
/// are: `version` increases by exactly 1 on every persisted update, and
/// `isRemoved` holds iff `parentId == trashRootId` and both
/// `originalParentId`/`originalName` are set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the process.
    pub id: NodeId,
    /// The tree this node belongs to.
    pub tree_id: TreeId,
    /// Parent node id; resolves to an existing node in the same tree,
    /// or to one of the tree's distinguished roots.
    pub parent_id: NodeId,
    /// Registered node type, selecting entity bindings and hooks.
    pub node_type: NodeType,
    /// Sibling-unique, non-empty, ≤255 char name excluding `/:*?"<>|`.
    pub name: String,
    /// Creation timestamp; never changes after creation.
    pub created_at: Millis,
    /// Last-update timestamp; monotone-nondecreasing per node.
    pub updated_at: Millis,
    /// Monotone-increasing version, starts at 1.
    pub version: u64,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Optional UI hint: does this node have children without the
    /// caller having to list them.
    pub has_children: Option<bool>,
    /// True while this node is a draft staged only in the Ephemeral
    /// Store (mirrors the working copy it was created from).
    pub is_draft: bool,
    /// True while this node is in the tree's trash.
    pub is_removed: bool,
    /// When this node was trashed, if `is_removed`.
    pub removed_at: Option<Millis>,
    /// The parent this node had before being trashed, if `is_removed`.
    pub original_parent_id: Option<NodeId>,
    /// The name this node had before being trashed, if `is_removed`.
    pub original_name: Option<String>,
}

impl Node {
    /// True iff the removed-state invariant (spec §3, invariant 3)
    /// holds for this node given its tree's trash root.
    pub fn removed_state_consistent(&self, trash_root_id: &NodeId) -> bool {
        let marked = self.is_removed;
        let parented_in_trash = &self.parent_id == trash_root_id;
        let has_restore_fields = self.original_parent_id.is_some() && self.original_name.is_some();
        marked == (parented_in_trash && has_restore_fields)
    }
}

/// Policy applied when a commit or mutation's proposed name collides
/// with an existing sibling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnNameConflict {
    /// Fail the operation with `NameNotUnique`.
    Error,
    /// Append ` (n)` with the smallest `n >= 2` that yields uniqueness.
    AutoRename,
}

impl Default for OnNameConflict {
    /// Envelopes that omit `onNameConflict` get the stricter policy.
    fn default() -> Self {
        OnNameConflict::Error
    }
}

/// A Relational reference delta staged during a working-copy session,
/// applied to Core on commit (spec §4.5 step 4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RelationalDelta {
    AddReference(EntityId),
    RemoveReference(EntityId),
}

/// The four entity classifications and the lifetime/sharing rule each
/// implies (spec §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EntityClass {
    /// Exactly one per node; created and deleted with the node.
    Peer,
    /// Zero-or-more per node; deleted en masse with the node.
    Group,
    /// Many-to-many across nodes; persists while refCount > 0.
    Relational,
    /// Tied to a working copy; purged when the working copy ends.
    Ephemeral,
}

/// A Peer entity body: exactly one per node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerEntity {
    /// The node this entity is attached to; also its primary key.
    pub node_id: NodeId,
    /// Opaque, plugin-defined body.
    pub data: Value,
    /// Bumped on every update.
    pub version: u64,
    pub updated_at: Millis,
}

/// A Group entity body: zero-or-more per node, totally ordered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupEntity {
    /// This entity's id.
    pub id: EntityId,
    /// The node this entity is attached to.
    pub node_id: NodeId,
    /// Position within the node's group; gap-free after any reorder.
    pub sort_order: u32,
    /// Opaque, plugin-defined body.
    pub data: Value,
    pub version: u64,
    pub updated_at: Millis,
}

/// A Relational entity body: shared across nodes, reference-counted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationalEntity {
    /// This entity's id.
    pub id: EntityId,
    /// Opaque, plugin-defined body.
    pub data: Value,
    /// The set of nodes currently referencing this entity. The entity
    /// is deleted the instant this set becomes empty.
    pub referring_node_ids: std::collections::BTreeSet<NodeId>,
    pub version: u64,
    pub updated_at: Millis,
}

impl RelationalEntity {
    /// Current reference count: `|refs(E)|` in spec §8's invariant 5.
    pub fn ref_count(&self) -> usize {
        self.referring_node_ids.len()
    }
}

/// An Ephemeral entity body: tied to a working copy, keyed by
/// `workingCopyId`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EphemeralEntity {
    /// This entity's id.
    pub id: EntityId,
    /// The working copy this body is staged under.
    pub working_copy_id: WorkingCopyId,
    /// Opaque, plugin-defined body.
    pub data: Value,
    pub version: u64,
    pub updated_at: Millis,
}

/// A record in the Ephemeral Store staging an in-progress edit.
///
/// Keyed by `NodeId` — the same id as the node it stages, or a freshly
/// minted id for a draft (new node).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkingCopy {
    /// The working copy's key; see struct docs.
    pub id: WorkingCopyId,
    /// The node this copy stages, or `None` for a draft.
    pub working_copy_of: Option<NodeId>,
    /// When this working copy was opened.
    pub copied_at: Millis,
    /// The source node's `version` at copy time; only meaningful when
    /// `working_copy_of` is `Some`.
    pub base_version: Option<u64>,
    /// True for a draft (new node) working copy.
    pub is_draft: bool,
    /// The tree this working copy's node belongs (or will belong) to.
    pub tree_id: TreeId,
    /// Staged parent id.
    pub parent_id: NodeId,
    /// Staged node type.
    pub node_type: NodeType,
    /// Staged name.
    pub name: String,
    /// Staged description.
    pub description: Option<String>,
    /// Which entity classes have been copy-on-write staged into the
    /// Ephemeral Store during this session.
    pub staged_classes: std::collections::BTreeSet<EntityClass>,
}

/// A command submitted to [`crate::engine::Engine::submit`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Caller-supplied id; mutations are idempotent per `commandId`.
    pub command_id: String,
    /// Associates atomic undo/redo units.
    pub group_id: String,
    /// Which operation this envelope carries.
    pub kind: CommandKind,
    /// Operation-specific payload.
    pub payload: Value,
    /// When the envelope was issued.
    pub issued_at: Millis,
}

/// The operations the engine recognizes (spec §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    CreateNode,
    UpdateNode,
    MoveNodes,
    DuplicateNodes,
    MoveToTrash,
    RecoverFromTrash,
    Remove,
    PasteNodes,
    ImportNodes,
    CreateWorkingCopyForCreate,
    CreateWorkingCopy,
    UpdateWorkingCopy,
    CommitWorkingCopyForCreate,
    CommitWorkingCopy,
    DiscardWorkingCopy,
    Undo,
    Redo,
}

/// The outcome of a successful `submit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// The sequence number assigned at commit.
    pub seq: u64,
    /// The primary node affected, if a single node is meaningful.
    pub node_id: Option<NodeId>,
    /// Newly created node ids, for operations that create more than one
    /// (duplicate/paste/import).
    pub new_node_ids: Vec<NodeId>,
}

/// What kind of change a [`ChangeEvent`] reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Moved,
}

/// A single change published by the Core Store and delivered to
/// subscribers in `seq` order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub node_id: NodeId,
    pub tree_id: TreeId,
    /// Commit sequence number; subscribers observe events strictly in
    /// this order.
    pub seq: u64,
    /// Node state before the change, if applicable.
    pub before: Option<Node>,
    /// Node state after the change, if applicable.
    pub after: Option<Node>,
}
