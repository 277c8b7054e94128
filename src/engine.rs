//! `Engine`: the single value a caller constructs and holds for the
//! lifetime of the process, replacing the source system's module-scoped
//! registry singletons (spec §9's explicit re-architecture note).
//!
//! `Engine` owns the Node Type Registry, the Core and Ephemeral Stores,
//! the Lifecycle Manager, the Command Processor, and the Subscribe
//! Service, and exposes the presented API from spec §6:
//! `submit`/`subscribeNode`/`subscribeSubtree`/`undo`/`redo`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::command::{ApplyContext, CommandProcessor, InverseOp, UndoGroup};
use crate::config::EngineConfig;
use crate::entities::{self, EntityClassBinding};
use crate::error::{ArborError, Result};
use crate::ids::{EntityId, NodeId, TreeId};
use crate::lifecycle::LifecycleManager;
use crate::model::{
    now_millis, ChangeEvent, ChangeKind, CommandEnvelope, CommandKind, Node, NodeType,
    OnNameConflict, RelationalDelta, SubmitOutcome, Tree,
};
use crate::mutation::{self, validate_name, ClipboardNode};
use crate::registry::{NodeTypeConfig, NodeTypeRegistry};
use crate::store::{CoreStore, EphemeralStore};
use crate::subscribe::{SubscribeService, Subscription};
use crate::workingcopy::{self as wcp, DraftSpec, NodeFieldPatch};

/// The engine value every operation in this crate is expressed against.
/// No process-global state exists anywhere else in the crate.
pub struct Engine {
    core: CoreStore,
    ephemeral: EphemeralStore,
    registry: NodeTypeRegistry,
    lifecycle: LifecycleManager,
    command_processor: CommandProcessor,
    subscribe: SubscribeService,
    config: EngineConfig,
}

impl Engine {
    /// Constructs an engine with an empty Node Type Registry; callers
    /// register their own node types before creating trees.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            core: CoreStore::new(),
            ephemeral: EphemeralStore::new(),
            registry: NodeTypeRegistry::new(),
            lifecycle: LifecycleManager::new(config.hook_event_log_capacity),
            command_processor: CommandProcessor::new(config.undo_stack_capacity),
            subscribe: SubscribeService::new(config.subscriber_queue_capacity),
            config,
        }
    }

    /// Constructs an engine pre-registered with the three illustrative
    /// node types SPEC_FULL.md §4.1 names — `folder`, `basemap`,
    /// `stylemap` — so every entity classification and the Lifecycle
    /// Manager's reference-count accounting can be exercised without a
    /// caller first wiring up its own node types.
    pub fn with_default_registry(config: EngineConfig) -> Self {
        let engine = Self::new(config);
        engine.register_builtin_node_types();
        engine
    }

    fn register_builtin_node_types(&self) {
        let mut folder = NodeTypeConfig::new("folder");
        folder.display_name = "Folder".into();
        folder.can_be_root = true;
        self.registry.register(folder);

        let mut basemap = NodeTypeConfig::new("basemap");
        basemap.display_name = "Basemap".into();
        basemap.entity_bindings = vec![
            EntityClassBinding::Peer,
            EntityClassBinding::Relational { field_name: "styleRef".into() },
        ];
        basemap.rel_ref_field = Some("styleRef".into());
        self.registry.register(basemap);

        let mut stylemap = NodeTypeConfig::new("stylemap");
        stylemap.display_name = "Stylemap".into();
        stylemap.entity_bindings = vec![EntityClassBinding::Group];
        self.registry.register(stylemap);
    }

    /// The Node Type Registry, for callers that need to register their
    /// own plugin node types before submitting commands.
    pub fn registry(&self) -> &NodeTypeRegistry {
        &self.registry
    }

    /// The Core Store, for read-only inspection (e.g. `getNode`,
    /// `listChildren`) outside the command-envelope surface.
    pub fn core(&self) -> &CoreStore {
        &self.core
    }

    /// The Ephemeral Store, for read-only inspection of in-flight
    /// working copies.
    pub fn ephemeral(&self) -> &EphemeralStore {
        &self.ephemeral
    }

    /// The Lifecycle Manager's bounded hook-failure diagnostic log.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Creates a new tree and its three distinguished nodes atomically
    /// (spec §3). Not itself a command-envelope operation — trees are
    /// provisioned by the host application, not by end-user commands.
    pub fn create_tree(&self, name: impl Into<String>) -> Result<Tree> {
        let id = self.core.mint_tree_id();
        let tree = Tree {
            id: id.clone(),
            name: name.into(),
            root_id: id.root_id(),
            trash_root_id: id.trash_root_id(),
            super_root_id: id.super_root_id(),
        };
        self.core.create_tree(tree.clone(), now_millis())?;
        Ok(tree)
    }

    fn apply_ctx(&self) -> ApplyContext<'_> {
        ApplyContext {
            core: &self.core,
            ephemeral: &self.ephemeral,
            registry: &self.registry,
            lifecycle: &self.lifecycle,
        }
    }

    fn publish(&self, kind: ChangeKind, node: &Node, before: Option<Node>, seq: u64) {
        self.subscribe.publish(ChangeEvent {
            kind,
            node_id: node.id.clone(),
            tree_id: node.tree_id.clone(),
            seq,
            before,
            after: Some(node.clone()),
        });
    }

    /// `subscribeNode(nodeId)` (spec §4.9).
    pub fn subscribe_node(&self, node_id: NodeId) -> Subscription {
        self.subscribe.subscribe_node(node_id)
    }

    /// `subscribeSubtree(nodeId)` (spec §4.9): the closed descendant set
    /// at subscription time, plus nodes subsequently moved in.
    pub fn subscribe_subtree(&self, node_id: NodeId) -> Subscription {
        let descendants = mutation::descendant_ids(&self.core, &node_id);
        self.subscribe.subscribe_subtree(node_id, descendants)
    }

    /// `undo()` (spec §4.8 step 3 / §6). Every mutation the undo group
    /// replays is published to subscribers at this call's `seq`, the
    /// same as any other mutation: undo/redo are versioned and observed,
    /// not a side channel around the Subscribe Service.
    pub fn undo(&self) -> Result<SubmitOutcome> {
        let ctx = self.apply_ctx();
        let (seq, applied) = self
            .command_processor
            .undo(&ctx)?
            .ok_or_else(|| ArborError::InvalidArgument("nothing to undo".into()))?;
        for change in &applied {
            self.publish(change.kind, &change.node, change.before.clone(), seq);
        }
        Ok(SubmitOutcome { seq, node_id: None, new_node_ids: Vec::new() })
    }

    /// `redo()` (spec §4.8 step 4 / §6). See [`Engine::undo`] on publishing.
    pub fn redo(&self) -> Result<SubmitOutcome> {
        let ctx = self.apply_ctx();
        let (seq, applied) = self
            .command_processor
            .redo(&ctx)?
            .ok_or_else(|| ArborError::InvalidArgument("nothing to redo".into()))?;
        for change in &applied {
            self.publish(change.kind, &change.node, change.before.clone(), seq);
        }
        Ok(SubmitOutcome { seq, node_id: None, new_node_ids: Vec::new() })
    }

    /// `submit(envelope)` (spec §6): the single entry point every
    /// recognized [`CommandKind`] is dispatched through. Idempotent at
    /// the command-envelope level by `commandId` — resubmitting a
    /// `commandId` already processed returns the cached outcome without
    /// re-running the operation.
    pub fn submit(&self, envelope: CommandEnvelope) -> Result<SubmitOutcome> {
        if let Some(cached) = self.command_processor.cached_outcome(&envelope.command_id) {
            return Ok(cached);
        }
        let outcome = self.dispatch(&envelope)?;
        Ok(outcome)
    }

    fn dispatch(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        match envelope.kind {
            CommandKind::CreateNode => self.handle_create_node(envelope),
            CommandKind::UpdateNode => self.handle_update_node(envelope),
            CommandKind::MoveNodes => self.handle_move_nodes(envelope),
            CommandKind::DuplicateNodes => self.handle_duplicate_nodes(envelope),
            CommandKind::MoveToTrash => self.handle_move_to_trash(envelope),
            CommandKind::RecoverFromTrash => self.handle_recover_from_trash(envelope),
            CommandKind::Remove => self.handle_remove(envelope),
            CommandKind::PasteNodes => self.handle_paste_or_import(envelope),
            CommandKind::ImportNodes => self.handle_paste_or_import(envelope),
            CommandKind::CreateWorkingCopyForCreate => self.handle_create_working_copy_for_create(envelope),
            CommandKind::CreateWorkingCopy => self.handle_create_working_copy(envelope),
            CommandKind::UpdateWorkingCopy => self.handle_update_working_copy(envelope),
            CommandKind::CommitWorkingCopyForCreate => self.handle_commit_working_copy(envelope),
            CommandKind::CommitWorkingCopy => self.handle_commit_working_copy(envelope),
            CommandKind::DiscardWorkingCopy => self.handle_discard_working_copy(envelope),
            CommandKind::Undo => self.handle_undo_redo(envelope, true),
            CommandKind::Redo => self.handle_undo_redo(envelope, false),
        }
    }

    fn complete(&self, envelope: &CommandEnvelope, outcome: SubmitOutcome, group: UndoGroup) -> SubmitOutcome {
        self.command_processor.complete(envelope.command_id.clone(), outcome.clone(), group);
        outcome
    }

    // -- createNode / updateNode (direct, no working-copy staging) -----

    fn handle_create_node(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: CreateNodePayload = parse_payload(&envelope.payload)?;
        let config = self.registry.get(&payload.node_type)?;
        let name = resolve_name(&self.core, &payload.parent_id, &payload.name, payload.on_name_conflict)?;
        let now = now_millis();
        let node = Node {
            id: self.core.mint_node_id(),
            tree_id: payload.tree_id,
            parent_id: payload.parent_id,
            node_type: payload.node_type,
            name,
            created_at: now,
            updated_at: now,
            version: 1,
            description: payload.description,
            has_children: None,
            is_draft: false,
            is_removed: false,
            removed_at: None,
            original_parent_id: None,
            original_name: None,
        };
        self.lifecycle.before_create(&config, &node)?;
        let node = self.core.create_node(node)?;
        if let Some(data) = payload.peer_data {
            if config.binding_for(crate::model::EntityClass::Peer).is_some() {
                entities::peer::create(&self.core, &node.id, data)?;
            }
        }
        let rel_entity_id = config
            .rel_ref_field
            .as_ref()
            .and_then(|field| mutation::relational_ref_entity_id(&self.core, field, &node.id));
        self.lifecycle.after_create(&config, &self.core, &node, rel_entity_id.as_ref())?;

        let seq = self.command_processor.next_seq();
        self.publish(ChangeKind::Created, &node, None, seq);
        let outcome = SubmitOutcome { seq, node_id: Some(node.id.clone()), new_node_ids: vec![node.id.clone()] };
        let group = UndoGroup {
            group_id: envelope.group_id.clone(),
            inverse_ops: vec![InverseOp::DeleteNode { node_id: node.id.clone() }],
            forward_ops: vec![InverseOp::RecreateNode { node }],
        };
        Ok(self.complete(envelope, outcome, group))
    }

    fn handle_update_node(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: UpdateNodePayload = parse_payload(&envelope.payload)?;
        let current = self.core.get_node(&payload.node_id)?;
        let config = self.registry.get(&current.node_type)?;
        let target_parent = payload.parent_id.clone().unwrap_or_else(|| current.parent_id.clone());
        let moved = target_parent != current.parent_id;
        let proposed_name = payload.name.clone().unwrap_or_else(|| current.name.clone());
        let name = if proposed_name == current.name && !moved {
            proposed_name
        } else {
            resolve_name(&self.core, &target_parent, &proposed_name, payload.on_name_conflict)?
        };
        let next = Node {
            parent_id: target_parent,
            name,
            description: payload.description.unwrap_or_else(|| current.description.clone()),
            updated_at: now_millis(),
            version: current.version + 1,
            ..current.clone()
        };
        if moved {
            self.lifecycle.before_move(&config, &next, &current)?;
        } else {
            self.lifecycle.before_update(&config, &next, &current)?;
        }
        let node = self.core.update_node(next)?;
        if moved {
            self.lifecycle.after_move(&config, &node, &current)?;
        } else {
            self.lifecycle.after_update(&config, &node, &current)?;
        }

        let seq = self.command_processor.next_seq();
        let kind = if moved { ChangeKind::Moved } else { ChangeKind::Updated };
        self.publish(kind, &node, Some(current.clone()), seq);
        let outcome = SubmitOutcome { seq, node_id: Some(node.id.clone()), new_node_ids: Vec::new() };
        let group = UndoGroup {
            group_id: envelope.group_id.clone(),
            inverse_ops: vec![InverseOp::set_fields_from(&current)],
            forward_ops: vec![InverseOp::set_fields_from(&node)],
        };
        Ok(self.complete(envelope, outcome, group))
    }

    // -- moveNodes -------------------------------------------------------

    fn handle_move_nodes(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: MoveNodesPayload = parse_payload(&envelope.payload)?;
        let before: Vec<Node> = payload
            .node_ids
            .iter()
            .map(|id| self.core.get_node(id))
            .collect::<Result<_>>()?;
        let moved = mutation::move_nodes(
            &self.core,
            &self.registry,
            &self.lifecycle,
            &payload.node_ids,
            &payload.to_parent_id,
            payload.on_name_conflict,
        )?;

        let seq = self.command_processor.next_seq();
        let mut inverse_ops = Vec::with_capacity(moved.len());
        let mut forward_ops = Vec::with_capacity(moved.len());
        for (prev, node) in before.iter().zip(moved.iter()) {
            self.publish(ChangeKind::Moved, node, Some(prev.clone()), seq);
            inverse_ops.push(InverseOp::set_fields_from(prev));
            forward_ops.push(InverseOp::set_fields_from(node));
        }
        let outcome = SubmitOutcome {
            seq,
            node_id: moved.first().map(|n| n.id.clone()),
            new_node_ids: Vec::new(),
        };
        let group = UndoGroup { group_id: envelope.group_id.clone(), inverse_ops, forward_ops };
        Ok(self.complete(envelope, outcome, group))
    }

    // -- duplicateNodes ----------------------------------------------------

    fn handle_duplicate_nodes(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: DuplicateNodesPayload = parse_payload(&envelope.payload)?;
        let new_roots = mutation::duplicate_nodes(
            &self.core,
            &self.registry,
            &self.lifecycle,
            &payload.node_ids,
            &payload.to_parent_id,
            payload.on_name_conflict,
        )?;

        let seq = self.command_processor.next_seq();
        let mut inverse_ops = Vec::with_capacity(new_roots.len());
        let mut forward_ops = Vec::with_capacity(new_roots.len());
        for root_id in &new_roots {
            let node = self.core.get_node(root_id)?;
            self.publish(ChangeKind::Created, &node, None, seq);
            inverse_ops.push(InverseOp::DeleteSubtree { root_id: root_id.clone() });
            let snapshots = mutation::snapshot_subtree(&self.core, &self.registry, root_id)?;
            forward_ops.push(InverseOp::RecreateSubtree { snapshots });
        }
        let outcome = SubmitOutcome { seq, node_id: None, new_node_ids: new_roots };
        let group = UndoGroup { group_id: envelope.group_id.clone(), inverse_ops, forward_ops };
        Ok(self.complete(envelope, outcome, group))
    }

    // -- moveToTrash / recoverFromTrash -----------------------------------

    fn handle_move_to_trash(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: MoveToTrashPayload = parse_payload(&envelope.payload)?;
        let before: Vec<Node> = payload
            .node_ids
            .iter()
            .map(|id| self.core.get_node(id))
            .collect::<Result<_>>()?;
        let trashed = mutation::move_nodes_to_trash(&self.core, &self.registry, &self.lifecycle, &payload.node_ids)?;

        let seq = self.command_processor.next_seq();
        let mut inverse_ops = Vec::with_capacity(trashed.len());
        let mut forward_ops = Vec::with_capacity(trashed.len());
        for (prev, node) in before.iter().zip(trashed.iter()) {
            self.publish(ChangeKind::Moved, node, Some(prev.clone()), seq);
            inverse_ops.push(InverseOp::set_fields_from(prev));
            forward_ops.push(InverseOp::set_fields_from(node));
        }
        let outcome = SubmitOutcome {
            seq,
            node_id: trashed.first().map(|n| n.id.clone()),
            new_node_ids: Vec::new(),
        };
        let group = UndoGroup { group_id: envelope.group_id.clone(), inverse_ops, forward_ops };
        Ok(self.complete(envelope, outcome, group))
    }

    fn handle_recover_from_trash(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: RecoverFromTrashPayload = parse_payload(&envelope.payload)?;
        let before: Vec<Node> = payload
            .node_ids
            .iter()
            .map(|id| self.core.get_node(id))
            .collect::<Result<_>>()?;
        let recovered = mutation::recover_from_trash(
            &self.core,
            &self.registry,
            &self.lifecycle,
            &payload.node_ids,
            payload.to_parent_id,
            payload.on_name_conflict,
        )?;

        let seq = self.command_processor.next_seq();
        let mut inverse_ops = Vec::with_capacity(recovered.len());
        let mut forward_ops = Vec::with_capacity(recovered.len());
        for (prev, node) in before.iter().zip(recovered.iter()) {
            self.publish(ChangeKind::Moved, node, Some(prev.clone()), seq);
            inverse_ops.push(InverseOp::set_fields_from(prev));
            forward_ops.push(InverseOp::set_fields_from(node));
        }
        let outcome = SubmitOutcome {
            seq,
            node_id: recovered.first().map(|n| n.id.clone()),
            new_node_ids: Vec::new(),
        };
        let group = UndoGroup { group_id: envelope.group_id.clone(), inverse_ops, forward_ops };
        Ok(self.complete(envelope, outcome, group))
    }

    // -- remove ------------------------------------------------------------

    fn handle_remove(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: RemovePayload = parse_payload(&envelope.payload)?;
        let mut pre_snapshots = Vec::with_capacity(payload.node_ids.len());
        for node_id in &payload.node_ids {
            pre_snapshots.push((node_id.clone(), mutation::snapshot_subtree(&self.core, &self.registry, node_id)?));
        }
        let removed = mutation::remove(&self.core, &self.ephemeral, &self.registry, &self.lifecycle, &payload.node_ids)?;

        let seq = self.command_processor.next_seq();
        let mut inverse_ops = Vec::with_capacity(pre_snapshots.len());
        let mut forward_ops = Vec::with_capacity(pre_snapshots.len());
        for (root_id, snapshots) in pre_snapshots {
            if let Some(root_snapshot) = snapshots.first() {
                self.publish(ChangeKind::Deleted, &root_snapshot.node, Some(root_snapshot.node.clone()), seq);
            }
            forward_ops.push(InverseOp::DeleteSubtree { root_id });
            inverse_ops.push(InverseOp::RecreateSubtree { snapshots });
        }
        let outcome = SubmitOutcome { seq, node_id: None, new_node_ids: Vec::new() };
        let group = UndoGroup {
            group_id: envelope.group_id.clone(),
            inverse_ops,
            forward_ops,
        };
        let _ = removed;
        Ok(self.complete(envelope, outcome, group))
    }

    // -- pasteNodes / importNodes --------------------------------------------

    fn handle_paste_or_import(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: PasteNodesPayload = parse_payload(&envelope.payload)?;
        let clipboard: Vec<ClipboardNode> = payload.clipboard.into_iter().map(ClipboardNodePayload::into_clipboard_node).collect();
        let roots = if matches!(envelope.kind, CommandKind::ImportNodes) {
            mutation::import_nodes(&self.core, &self.registry, &self.lifecycle, &clipboard, &payload.to_parent_id, payload.on_name_conflict)?
        } else {
            mutation::paste_nodes(&self.core, &self.registry, &self.lifecycle, &clipboard, &payload.to_parent_id, payload.on_name_conflict)?
        };

        let seq = self.command_processor.next_seq();
        let mut inverse_ops = Vec::with_capacity(roots.len());
        let mut forward_ops = Vec::with_capacity(roots.len());
        for root_id in &roots {
            let node = self.core.get_node(root_id)?;
            self.publish(ChangeKind::Created, &node, None, seq);
            inverse_ops.push(InverseOp::DeleteSubtree { root_id: root_id.clone() });
            let snapshots = mutation::snapshot_subtree(&self.core, &self.registry, root_id)?;
            forward_ops.push(InverseOp::RecreateSubtree { snapshots });
        }
        let outcome = SubmitOutcome { seq, node_id: None, new_node_ids: roots };
        let group = UndoGroup { group_id: envelope.group_id.clone(), inverse_ops, forward_ops };
        Ok(self.complete(envelope, outcome, group))
    }

    // -- working-copy protocol ------------------------------------------

    fn handle_create_working_copy_for_create(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: CreateWorkingCopyForCreatePayload = parse_payload(&envelope.payload)?;
        let working_copy_id = wcp::create_draft(
            &self.core,
            &self.ephemeral,
            DraftSpec {
                tree_id: payload.tree_id,
                parent_id: payload.parent_id,
                node_type: payload.node_type,
                name: payload.name,
                description: payload.description,
            },
        )?;
        let seq = self.command_processor.next_seq();
        let outcome = SubmitOutcome { seq, node_id: Some(working_copy_id), new_node_ids: Vec::new() };
        Ok(self.complete(
            envelope,
            outcome,
            UndoGroup { group_id: envelope.group_id.clone(), inverse_ops: Vec::new(), forward_ops: Vec::new() },
        ))
    }

    fn handle_create_working_copy(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: CreateWorkingCopyPayload = parse_payload(&envelope.payload)?;
        let working_copy_id = wcp::create_edit(&self.core, &self.ephemeral, &payload.node_id)?;
        let seq = self.command_processor.next_seq();
        let outcome = SubmitOutcome { seq, node_id: Some(working_copy_id), new_node_ids: Vec::new() };
        Ok(self.complete(
            envelope,
            outcome,
            UndoGroup { group_id: envelope.group_id.clone(), inverse_ops: Vec::new(), forward_ops: Vec::new() },
        ))
    }

    fn handle_update_working_copy(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: UpdateWorkingCopyPayload = parse_payload(&envelope.payload)?;
        wcp::update_working_copy(
            &self.ephemeral,
            &payload.working_copy_id,
            NodeFieldPatch {
                parent_id: payload.parent_id,
                name: payload.name,
                description: payload.description.map(Some),
            },
        )?;
        if let Some(peer_patch) = payload.peer_patch {
            wcp::stage_peer(&self.core, &self.ephemeral, &payload.working_copy_id, peer_patch)?;
        }
        if let Some(group_patch) = payload.group_patch {
            wcp::stage_group(
                &self.core,
                &self.ephemeral,
                &payload.working_copy_id,
                group_patch.entity_id,
                group_patch.data,
            )?;
        }
        if !payload.relational_add.is_empty() || !payload.relational_remove.is_empty() {
            wcp::stage_relational(&self.ephemeral, &payload.working_copy_id)?;
            for entity_id in payload.relational_add {
                self.ephemeral.push_relational_delta(&payload.working_copy_id, RelationalDelta::AddReference(entity_id));
            }
            for entity_id in payload.relational_remove {
                self.ephemeral.push_relational_delta(&payload.working_copy_id, RelationalDelta::RemoveReference(entity_id));
            }
        }
        let seq = self.command_processor.next_seq();
        let outcome = SubmitOutcome { seq, node_id: Some(payload.working_copy_id), new_node_ids: Vec::new() };
        Ok(self.complete(
            envelope,
            outcome,
            UndoGroup { group_id: envelope.group_id.clone(), inverse_ops: Vec::new(), forward_ops: Vec::new() },
        ))
    }

    fn handle_commit_working_copy(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: CommitWorkingCopyPayload = parse_payload(&envelope.payload)?;
        let before = self
            .ephemeral
            .get_working_copy(&payload.working_copy_id)
            .and_then(|wc| wc.working_copy_of)
            .and_then(|node_id| self.core.try_get_node(&node_id));
        let deltas = self.ephemeral.take_relational_deltas(&payload.working_copy_id);
        let outcome_commit = wcp::commit(
            &self.core,
            &self.ephemeral,
            &self.registry,
            &self.lifecycle,
            &payload.working_copy_id,
            payload.on_name_conflict,
            &deltas,
        )?;

        let seq = self.command_processor.next_seq();
        self.publish(outcome_commit.kind, &outcome_commit.node, before.clone(), seq);
        let outcome = SubmitOutcome {
            seq,
            node_id: Some(outcome_commit.node.id.clone()),
            new_node_ids: if matches!(outcome_commit.kind, ChangeKind::Created) {
                vec![outcome_commit.node.id.clone()]
            } else {
                Vec::new()
            },
        };
        let group = match (&before, &outcome_commit.kind) {
            (None, ChangeKind::Created) => UndoGroup {
                group_id: envelope.group_id.clone(),
                inverse_ops: vec![InverseOp::DeleteNode { node_id: outcome_commit.node.id.clone() }],
                forward_ops: vec![InverseOp::RecreateNode { node: outcome_commit.node.clone() }],
            },
            (Some(prev), _) => UndoGroup {
                group_id: envelope.group_id.clone(),
                inverse_ops: vec![InverseOp::set_fields_from(prev)],
                forward_ops: vec![InverseOp::set_fields_from(&outcome_commit.node)],
            },
            _ => UndoGroup { group_id: envelope.group_id.clone(), inverse_ops: Vec::new(), forward_ops: Vec::new() },
        };
        Ok(self.complete(envelope, outcome, group))
    }

    fn handle_discard_working_copy(&self, envelope: &CommandEnvelope) -> Result<SubmitOutcome> {
        let payload: DiscardWorkingCopyPayload = parse_payload(&envelope.payload)?;
        wcp::discard(&self.ephemeral, &payload.working_copy_id)?;
        let seq = self.command_processor.next_seq();
        let outcome = SubmitOutcome { seq, node_id: Some(payload.working_copy_id), new_node_ids: Vec::new() };
        Ok(self.complete(
            envelope,
            outcome,
            UndoGroup { group_id: envelope.group_id.clone(), inverse_ops: Vec::new(), forward_ops: Vec::new() },
        ))
    }

    fn handle_undo_redo(&self, envelope: &CommandEnvelope, is_undo: bool) -> Result<SubmitOutcome> {
        let outcome = if is_undo { self.undo()? } else { self.redo()? };
        Ok(self.complete(
            envelope,
            outcome,
            UndoGroup { group_id: envelope.group_id.clone(), inverse_ops: Vec::new(), forward_ops: Vec::new() },
        ))
    }
}

fn resolve_name(core: &CoreStore, parent_id: &NodeId, proposed: &str, policy: OnNameConflict) -> Result<String> {
    validate_name(proposed)?;
    let siblings = core.sibling_names(parent_id);
    if !siblings.contains(proposed) {
        return Ok(proposed.to_string());
    }
    match policy {
        OnNameConflict::Error => Err(ArborError::NameNotUnique(proposed.to_string(), parent_id.to_string())),
        OnNameConflict::AutoRename => {
            let mut n = 2u32;
            loop {
                let candidate = format!("{proposed} ({n})");
                if !siblings.contains(&candidate) {
                    return Ok(candidate);
                }
                n += 1;
            }
        }
    }
}


fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| ArborError::InvalidArgument(format!("malformed payload: {e}")))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateNodePayload {
    tree_id: TreeId,
    parent_id: NodeId,
    node_type: NodeType,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
    #[serde(default)]
    peer_data: Option<Value>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateNodePayload {
    node_id: NodeId,
    #[serde(default)]
    parent_id: Option<NodeId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveNodesPayload {
    node_ids: Vec<NodeId>,
    to_parent_id: NodeId,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateNodesPayload {
    node_ids: Vec<NodeId>,
    to_parent_id: NodeId,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveToTrashPayload {
    node_ids: Vec<NodeId>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoverFromTrashPayload {
    node_ids: Vec<NodeId>,
    #[serde(default)]
    to_parent_id: Option<NodeId>,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovePayload {
    node_ids: Vec<NodeId>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClipboardNodePayload {
    #[serde(default)]
    parent_ref: Option<usize>,
    node_type: NodeType,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    peer_data: Option<Value>,
}

impl ClipboardNodePayload {
    fn into_clipboard_node(self) -> ClipboardNode {
        ClipboardNode {
            parent_ref: self.parent_ref,
            node_type: self.node_type,
            name: self.name,
            description: self.description,
            peer_data: self.peer_data,
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasteNodesPayload {
    clipboard: Vec<ClipboardNodePayload>,
    to_parent_id: NodeId,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkingCopyForCreatePayload {
    tree_id: TreeId,
    parent_id: NodeId,
    node_type: NodeType,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkingCopyPayload {
    node_id: NodeId,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupPatchPayload {
    #[serde(default)]
    entity_id: Option<EntityId>,
    data: Value,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWorkingCopyPayload {
    working_copy_id: NodeId,
    #[serde(default)]
    parent_id: Option<NodeId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    peer_patch: Option<Value>,
    #[serde(default)]
    group_patch: Option<GroupPatchPayload>,
    #[serde(default)]
    relational_add: Vec<EntityId>,
    #[serde(default)]
    relational_remove: Vec<EntityId>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitWorkingCopyPayload {
    working_copy_id: NodeId,
    #[serde(default)]
    on_name_conflict: OnNameConflict,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscardWorkingCopyPayload {
    working_copy_id: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: CommandKind, payload: Value) -> CommandEnvelope {
        CommandEnvelope {
            command_id: format!("cmd-{}", now_millis()),
            group_id: "g1".into(),
            kind,
            payload,
            issued_at: now_millis(),
        }
    }

    #[test]
    fn s1_draft_to_commit_happy_path() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();

        let create = engine
            .submit(envelope(
                CommandKind::CreateWorkingCopyForCreate,
                json!({
                    "treeId": tree.id,
                    "parentId": tree.root_id,
                    "nodeType": "folder",
                    "name": "Docs",
                }),
            ))
            .unwrap();
        let wc_id = create.node_id.unwrap();

        let sub = engine.subscribe_node(wc_id.clone());
        let commit = engine
            .submit(envelope(
                CommandKind::CommitWorkingCopyForCreate,
                json!({ "workingCopyId": wc_id, "onNameConflict": "error" }),
            ))
            .unwrap();

        let node = engine.core().get_node(&commit.node_id.unwrap()).unwrap();
        assert_eq!(node.node_type, "folder");
        assert_eq!(node.parent_id, tree.root_id);
        assert_eq!(node.version, 1);

        let events = sub.drain();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn s2_optimistic_concurrency_conflict_then_retry() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let create = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "N" }),
            ))
            .unwrap();
        let node_id = create.node_id.unwrap();

        let open = engine
            .submit(envelope(CommandKind::CreateWorkingCopy, json!({ "nodeId": node_id })))
            .unwrap();
        let wc_id = open.node_id.unwrap();

        // external update races ahead of the working copy
        engine
            .submit(envelope(
                CommandKind::UpdateNode,
                json!({ "nodeId": node_id, "name": "N-renamed" }),
            ))
            .unwrap();

        let err = engine
            .submit(envelope(
                CommandKind::CommitWorkingCopy,
                json!({ "workingCopyId": wc_id }),
            ))
            .unwrap_err();
        assert!(matches!(err, ArborError::StaleVersion { .. }));
        assert!(engine.ephemeral().has_working_copy(&wc_id));

        let reopen = engine
            .submit(envelope(
                CommandKind::CreateWorkingCopy,
                json!({ "nodeId": node_id, "commandId": "retry" }),
            ))
            .unwrap_err();
        assert!(matches!(reopen, ArborError::Conflict(_)));

        engine
            .submit(envelope(CommandKind::DiscardWorkingCopy, json!({ "workingCopyId": wc_id })))
            .unwrap();
        let retry_open = engine
            .submit(envelope(CommandKind::CreateWorkingCopy, json!({ "nodeId": node_id })))
            .unwrap();
        let retry_commit = engine
            .submit(envelope(
                CommandKind::CommitWorkingCopy,
                json!({ "workingCopyId": retry_open.node_id.unwrap() }),
            ))
            .unwrap();
        let final_node = engine.core().get_node(&retry_commit.node_id.unwrap()).unwrap();
        assert_eq!(final_node.version, 3);
    }

    #[test]
    fn s3_auto_rename_on_paste() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "Doc" }),
            ))
            .unwrap();

        let outcome = engine
            .submit(envelope(
                CommandKind::PasteNodes,
                json!({
                    "toParentId": tree.root_id,
                    "onNameConflict": "auto-rename",
                    "clipboard": [
                        { "nodeType": "folder", "name": "Doc" },
                        { "nodeType": "folder", "name": "Doc" },
                    ],
                }),
            ))
            .unwrap();

        let mut names: Vec<String> = engine
            .core()
            .list_children(&tree.root_id)
            .into_iter()
            .map(|n| n.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Doc", "Doc (2)", "Doc (3)"]);
        assert_eq!(outcome.new_node_ids.len(), 2);
    }

    #[test]
    fn s4_trash_and_recover_round_trip() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let create = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "x" }),
            ))
            .unwrap();
        let node_id = create.node_id.unwrap();

        engine
            .submit(envelope(CommandKind::MoveToTrash, json!({ "nodeIds": [node_id.clone()] })))
            .unwrap();
        let trashed = engine.core().get_node(&node_id).unwrap();
        assert!(trashed.is_removed);
        assert_eq!(trashed.parent_id, tree.trash_root_id);
        assert_eq!(trashed.original_parent_id.unwrap(), tree.root_id);
        assert_eq!(trashed.original_name.unwrap(), "x");

        engine
            .submit(envelope(CommandKind::RecoverFromTrash, json!({ "nodeIds": [node_id.clone()] })))
            .unwrap();
        let recovered = engine.core().get_node(&node_id).unwrap();
        assert!(!recovered.is_removed);
        assert_eq!(recovered.parent_id, tree.root_id);
        assert_eq!(recovered.name, "x");
        assert!(recovered.original_parent_id.is_none());
    }

    #[test]
    fn s5_relational_refcount_drop_to_zero() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let stylesheet = entities::relational::create(engine.core(), json!({"name": "Dark"}), &tree.root_id);

        let a = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({
                    "treeId": tree.id, "parentId": tree.root_id, "nodeType": "basemap", "name": "A",
                    "peerData": { "styleRef": stylesheet.id.as_str() },
                }),
            ))
            .unwrap();
        let b = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({
                    "treeId": tree.id, "parentId": tree.root_id, "nodeType": "basemap", "name": "B",
                    "peerData": { "styleRef": stylesheet.id.as_str() },
                }),
            ))
            .unwrap();
        entities::relational::add_reference(engine.core(), &stylesheet.id, &a.node_id.clone().unwrap());
        entities::relational::add_reference(engine.core(), &stylesheet.id, &b.node_id.clone().unwrap());
        entities::relational::remove_reference(engine.core(), &stylesheet.id, &tree.root_id);

        engine
            .submit(envelope(CommandKind::Remove, json!({ "nodeIds": [a.node_id.unwrap()] })))
            .unwrap();
        assert_eq!(entities::relational::get(engine.core(), &stylesheet.id).unwrap().ref_count(), 1);

        engine
            .submit(envelope(CommandKind::Remove, json!({ "nodeIds": [b.node_id.unwrap()] })))
            .unwrap();
        assert!(entities::relational::get(engine.core(), &stylesheet.id).is_none());
    }

    #[test]
    fn s6_undo_of_duplicate_nodes() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let root = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "Root" }),
            ))
            .unwrap()
            .node_id
            .unwrap();
        let child_a = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": root, "nodeType": "folder", "name": "A" }),
            ))
            .unwrap()
            .node_id
            .unwrap();
        engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": child_a, "nodeType": "folder", "name": "B" }),
            ))
            .unwrap();

        let dest = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "Dest" }),
            ))
            .unwrap()
            .node_id
            .unwrap();

        let before_children = engine.core().list_children(&tree.root_id).len();
        engine
            .submit(envelope(
                CommandKind::DuplicateNodes,
                json!({ "nodeIds": [root.clone()], "toParentId": dest }),
            ))
            .unwrap();
        assert_eq!(engine.core().list_children(&dest).len(), 1);

        engine.undo().unwrap();
        assert_eq!(engine.core().list_children(&dest).len(), 0);
        assert_eq!(engine.core().list_children(&tree.root_id).len(), before_children);
    }

    #[test]
    fn invalid_name_is_rejected() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let err = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "" }),
            ))
            .unwrap_err();
        assert!(matches!(err, ArborError::InvalidArgument(_)));

        let err = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "a/b" }),
            ))
            .unwrap_err();
        assert!(matches!(err, ArborError::InvalidArgument(_)));
    }

    #[test]
    fn undo_and_redo_publish_change_events() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let node_id = engine
            .submit(envelope(
                CommandKind::CreateNode,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "Docs" }),
            ))
            .unwrap()
            .node_id
            .unwrap();

        let sub = engine.subscribe_node(node_id.clone());
        sub.drain();

        engine.undo().unwrap();
        let undo_events = sub.drain();
        assert_eq!(undo_events.len(), 1);
        assert!(matches!(undo_events[0].kind, ChangeKind::Deleted));

        engine.redo().unwrap();
        let redo_events = sub.drain();
        assert_eq!(redo_events.len(), 1);
        assert!(matches!(redo_events[0].kind, ChangeKind::Created));
    }

    #[test]
    fn paste_rejects_a_reserved_character_in_any_clipboard_name() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let clipboard = vec![ClipboardNode {
            parent_ref: None,
            node_type: "folder".into(),
            name: "a/b".into(),
            description: None,
            peer_data: None,
        }];
        let err = mutation::paste_nodes(engine.core(), engine.registry(), engine.lifecycle(), &clipboard, &tree.root_id, OnNameConflict::Error)
            .unwrap_err();
        assert!(matches!(err, ArborError::InvalidArgument(_)));
        assert!(engine.core().list_children(&tree.root_id).is_empty());
    }

    #[test]
    fn working_copy_draft_rejects_an_invalid_name() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let err = engine
            .submit(envelope(
                CommandKind::CreateWorkingCopyForCreate,
                json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "" }),
            ))
            .unwrap_err();
        assert!(matches!(err, ArborError::InvalidArgument(_)));
    }

    #[test]
    fn resubmitting_a_command_id_is_idempotent() {
        let engine = Engine::with_default_registry(EngineConfig::default());
        let tree = engine.create_tree("Workspace").unwrap();
        let mut env = envelope(
            CommandKind::CreateNode,
            json!({ "treeId": tree.id, "parentId": tree.root_id, "nodeType": "folder", "name": "Once" }),
        );
        env.command_id = "fixed-id".into();
        let first = engine.submit(env.clone()).unwrap();
        let second = engine.submit(env).unwrap();
        assert_eq!(first.seq, second.seq);
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(engine.core().list_children(&tree.root_id).len(), 1);
    }
}
