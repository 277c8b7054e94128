//! The Command Processor: envelope intake, process-monotone `seq`
//! assignment, and undo/redo.
//!
//! `seq` is a plain monotonic counter over logical commit sequence
//! numbers; each mutation's undo group carries enough pre-image state
//! to reconstruct a rollback, captured in [`InverseOp`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::entities;
use crate::error::Result;
use crate::ids::NodeId;
use crate::lifecycle::LifecycleManager;
use crate::model::{now_millis, ChangeKind, Millis, Node, SubmitOutcome};
use crate::mutation::NodeSnapshot;
use crate::registry::NodeTypeRegistry;
use crate::store::{CoreStore, EphemeralStore};

/// One node-level state transition, usable in either direction: as the
/// inverse of a mutation (to undo it) or as its forward restatement (to
/// redo it). Each variant carries enough pre-image state to reconstruct
/// the node without consulting anything else.
#[derive(Clone, Debug)]
pub enum InverseOp {
    /// Removes a node that a forward operation created.
    DeleteNode { node_id: NodeId },
    /// Recreates a node exactly as it existed before a forward
    /// operation deleted it (full body, including its prior `version`).
    RecreateNode { node: Node },
    /// Reapplies a prior set of mutable fields to an existing node,
    /// bumping its version forward as an ordinary update.
    SetFields {
        node_id: NodeId,
        parent_id: NodeId,
        name: String,
        description: Option<String>,
        is_removed: bool,
        removed_at: Option<Millis>,
        original_parent_id: Option<NodeId>,
        original_name: Option<String>,
    },
    /// Hard-deletes the subtree rooted at `root_id`, identically to
    /// `remove`. Undoes a `duplicateNodes`/`pasteNodes`/`importNodes`;
    /// redoes a `remove`.
    DeleteSubtree { root_id: NodeId },
    /// Recreates an entire subtree from a prior [`NodeSnapshot`]
    /// capture. Undoes a `remove`; redoes a
    /// `duplicateNodes`/`pasteNodes`/`importNodes`.
    RecreateSubtree { snapshots: Vec<NodeSnapshot> },
}

/// One atomic undo/redo unit, keyed by the command's `groupId`.
#[derive(Clone, Debug)]
pub struct UndoGroup {
    pub group_id: String,
    /// Applied, in reverse order, to undo the group.
    pub inverse_ops: Vec<InverseOp>,
    /// Applied, in forward order, to redo the group.
    pub forward_ops: Vec<InverseOp>,
}

/// Borrowed handles an [`InverseOp`] needs to apply itself.
pub struct ApplyContext<'a> {
    pub core: &'a CoreStore,
    pub ephemeral: &'a EphemeralStore,
    pub registry: &'a NodeTypeRegistry,
    pub lifecycle: &'a LifecycleManager,
}

/// The headline change an applied [`InverseOp`] produced, reported back
/// so the caller can publish it at the undo/redo call's single `seq`.
/// Multi-node ops (`DeleteSubtree`/`RecreateSubtree`) report only their
/// root — subscribers to the root or an enclosing subtree still observe
/// the change; per-descendant events are not replayed on undo/redo.
pub(crate) struct AppliedChange {
    pub(crate) kind: ChangeKind,
    pub(crate) node: Node,
    pub(crate) before: Option<Node>,
}

fn apply_op(ctx: &ApplyContext, op: &InverseOp) -> Result<AppliedChange> {
    match op {
        InverseOp::DeleteNode { node_id } => {
            let node = ctx.core.get_node(node_id)?;
            let config = ctx.registry.get(&node.node_type)?;
            ctx.lifecycle.before_delete(&config, &node)?;
            let rel_entity_id = config
                .rel_ref_field
                .as_ref()
                .and_then(|field| crate::mutation::relational_ref_entity_id(ctx.core, field, node_id));
            ctx.lifecycle.decrement_reference(&config, ctx.core, &node, rel_entity_id.as_ref());
            entities::peer::cleanup(ctx.core, node_id);
            entities::group::cleanup(ctx.core, node_id);
            if ctx.ephemeral.has_working_copy(node_id) {
                ctx.ephemeral.purge_working_copy(node_id);
            }
            ctx.core.delete_node(node_id)?;
            ctx.lifecycle.after_delete(&config, &node)?;
            Ok(AppliedChange {
                kind: ChangeKind::Deleted,
                node: node.clone(),
                before: Some(node),
            })
        }
        InverseOp::RecreateNode { node } => {
            let config = ctx.registry.get(&node.node_type)?;
            ctx.lifecycle.before_create(&config, node)?;
            let created = ctx.core.create_node(node.clone())?;
            let rel_entity_id = config
                .rel_ref_field
                .as_ref()
                .and_then(|field| crate::mutation::relational_ref_entity_id(ctx.core, field, &created.id));
            ctx.lifecycle.after_create(&config, ctx.core, &created, rel_entity_id.as_ref())?;
            Ok(AppliedChange {
                kind: ChangeKind::Created,
                node: created,
                before: None,
            })
        }
        InverseOp::SetFields {
            node_id,
            parent_id,
            name,
            description,
            is_removed,
            removed_at,
            original_parent_id,
            original_name,
        } => {
            let current = ctx.core.get_node(node_id)?;
            let config = ctx.registry.get(&current.node_type)?;
            let next = Node {
                parent_id: parent_id.clone(),
                name: name.clone(),
                description: description.clone(),
                updated_at: now_millis(),
                version: current.version + 1,
                is_removed: *is_removed,
                removed_at: *removed_at,
                original_parent_id: original_parent_id.clone(),
                original_name: original_name.clone(),
                ..current.clone()
            };
            let moved = current.parent_id != next.parent_id;
            if moved {
                ctx.lifecycle.before_move(&config, &next, &current)?;
            } else {
                ctx.lifecycle.before_update(&config, &next, &current)?;
            }
            let updated = ctx.core.update_node(next)?;
            if moved {
                ctx.lifecycle.after_move(&config, &updated, &current)?;
            } else {
                ctx.lifecycle.after_update(&config, &updated, &current)?;
            }
            Ok(AppliedChange {
                kind: if moved { ChangeKind::Moved } else { ChangeKind::Updated },
                node: updated,
                before: Some(current),
            })
        }
        InverseOp::DeleteSubtree { root_id } => {
            let root = ctx.core.get_node(root_id)?;
            crate::mutation::remove(ctx.core, ctx.ephemeral, ctx.registry, ctx.lifecycle, std::slice::from_ref(root_id))?;
            Ok(AppliedChange {
                kind: ChangeKind::Deleted,
                node: root.clone(),
                before: Some(root),
            })
        }
        InverseOp::RecreateSubtree { snapshots } => {
            crate::mutation::restore_subtree(ctx.core, ctx.registry, ctx.lifecycle, snapshots)?;
            let root = snapshots
                .first()
                .ok_or_else(|| crate::error::ArborError::InvalidArgument("RecreateSubtree with no snapshots".into()))?;
            let created = ctx.core.get_node(&root.node.id)?;
            Ok(AppliedChange {
                kind: ChangeKind::Created,
                node: created,
                before: None,
            })
        }
    }
}

impl InverseOp {
    /// Builds the `SetFields` restatement of `node`'s current mutable
    /// fields, for use as either the inverse (pre-image) or forward
    /// (post-image) half of an [`UndoGroup`].
    pub fn set_fields_from(node: &Node) -> Self {
        InverseOp::SetFields {
            node_id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            is_removed: node.is_removed,
            removed_at: node.removed_at,
            original_parent_id: node.original_parent_id.clone(),
            original_name: node.original_name.clone(),
        }
    }
}

/// Assigns commit sequence numbers, caches idempotent outcomes by
/// `commandId`, and owns the undo/redo stacks.
pub struct CommandProcessor {
    seq: AtomicU64,
    undo_stack: Mutex<Vec<UndoGroup>>,
    redo_stack: Mutex<Vec<UndoGroup>>,
    processed: Mutex<FxHashMap<String, SubmitOutcome>>,
    undo_stack_capacity: usize,
}

impl CommandProcessor {
    pub fn new(undo_stack_capacity: usize) -> Self {
        Self {
            seq: AtomicU64::new(1),
            undo_stack: Mutex::new(Vec::new()),
            redo_stack: Mutex::new(Vec::new()),
            processed: Mutex::new(FxHashMap::default()),
            undo_stack_capacity,
        }
    }

    /// Process-monotone commit sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the cached outcome for `command_id` if this command was
    /// already processed, implementing idempotence at the
    /// command-envelope level.
    pub fn cached_outcome(&self, command_id: &str) -> Option<SubmitOutcome> {
        self.processed.lock().get(command_id).cloned()
    }

    /// Records a successful mutation: caches its outcome by
    /// `commandId`, pushes `group` onto the undo stack, and clears the
    /// redo stack. `group` may have empty op lists
    /// for mutations with nothing to undo (e.g. read-only commands).
    pub fn complete(&self, command_id: String, outcome: SubmitOutcome, group: UndoGroup) {
        self.processed.lock().insert(command_id, outcome);
        if group.inverse_ops.is_empty() {
            return;
        }
        let mut undo = self.undo_stack.lock();
        undo.push(group);
        if undo.len() > self.undo_stack_capacity {
            let overflow = undo.len() - self.undo_stack_capacity;
            undo.drain(0..overflow);
        }
        drop(undo);
        self.redo_stack.lock().clear();
    }

    /// `undo()`: pops the most recent group, applies its inverse
    /// descriptors in reverse order as ordinary mutations, and pushes
    /// the group onto the redo stack. Returns the assigned `seq` plus
    /// every [`AppliedChange`] produced, in application order, so the
    /// caller can publish them — undo/redo mutations are versioned and
    /// observed exactly like any other mutation (spec §4.8 step 3).
    pub(crate) fn undo(&self, ctx: &ApplyContext) -> Result<Option<(u64, Vec<AppliedChange>)>> {
        let group = self.undo_stack.lock().pop();
        let Some(group) = group else { return Ok(None) };
        let mut applied = Vec::with_capacity(group.inverse_ops.len());
        for op in group.inverse_ops.iter().rev() {
            match apply_op(ctx, op) {
                Ok(change) => applied.push(change),
                Err(e) => {
                    self.undo_stack.lock().push(group);
                    return Err(e);
                }
            }
        }
        let seq = self.next_seq();
        self.redo_stack.lock().push(group);
        Ok(Some((seq, applied)))
    }

    /// `redo()`: symmetric to [`CommandProcessor::undo`].
    pub(crate) fn redo(&self, ctx: &ApplyContext) -> Result<Option<(u64, Vec<AppliedChange>)>> {
        let group = self.redo_stack.lock().pop();
        let Some(group) = group else { return Ok(None) };
        let mut applied = Vec::with_capacity(group.forward_ops.len());
        for op in group.forward_ops.iter() {
            match apply_op(ctx, op) {
                Ok(change) => applied.push(change),
                Err(e) => {
                    self.redo_stack.lock().push(group);
                    return Err(e);
                }
            }
        }
        let seq = self.next_seq();
        self.undo_stack.lock().push(group);
        Ok(Some((seq, applied)))
    }

    /// Diagnostic depth of the undo stack.
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.lock().len()
    }

    /// Diagnostic depth of the redo stack.
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.lock().len()
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new(256)
    }
}
