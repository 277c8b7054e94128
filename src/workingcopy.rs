//! The Working-Copy Protocol: draft/edit creation, copy-on-write staging,
//! optimistic-concurrency commit, and discard (spec §4.5 — "the hardest
//! engineering subsystem").
//!
//! Grounded on spec §4.5 verbatim; the copy-on-write "has this entity
//! class been staged yet" bitset mirrors the teacher's dirty-page
//! tracking (`start_tracking`/`take_recent_dirty_pages` in
//! `sombra::db::core::graphdb`), generalized from pages to entity
//! classes via [`WorkingCopy::staged_classes`].

use serde_json::Value;

use crate::error::{ArborError, Result};
use crate::ids::{EntityId, NodeId, TreeId, WorkingCopyId};
use crate::lifecycle::LifecycleManager;
use crate::model::{now_millis, ChangeEvent, ChangeKind, EntityClass, Node, OnNameConflict, RelationalDelta, WorkingCopy};
use crate::mutation::{relational_ref_entity_id, validate_name};
use crate::registry::NodeTypeRegistry;
use crate::store::{CoreStore, EphemeralStore};

/// Caller-supplied fields for opening a draft working copy (new node).
pub struct DraftSpec {
    pub tree_id: TreeId,
    pub parent_id: NodeId,
    pub node_type: String,
    pub name: String,
    pub description: Option<String>,
}

/// What committing a working copy produced, before the caller assigns
/// a `seq` and publishes it (the Command Processor does both).
pub struct CommitOutcome {
    pub node: Node,
    pub before: Option<Node>,
    pub kind: ChangeKind,
}

/// Opens a draft working copy for a new node. Allocates a fresh NodeId
/// and stages it with `is_draft = true`.
pub fn create_draft(core: &CoreStore, ephemeral: &EphemeralStore, spec: DraftSpec) -> Result<WorkingCopyId> {
    validate_name(&spec.name)?;
    let id = core.mint_node_id();
    let wc = WorkingCopy {
        id: id.clone(),
        working_copy_of: None,
        copied_at: now_millis(),
        base_version: None,
        is_draft: true,
        tree_id: spec.tree_id,
        parent_id: spec.parent_id,
        node_type: spec.node_type,
        name: spec.name,
        description: spec.description,
        staged_classes: Default::default(),
    };
    ephemeral.put_working_copy(wc);
    Ok(id)
}

/// Opens an edit working copy over an existing node, capturing its
/// current `version` as `baseVersion`. Fails `Conflict` if a working
/// copy already exists under this node's id.
pub fn create_edit(core: &CoreStore, ephemeral: &EphemeralStore, node_id: &NodeId) -> Result<WorkingCopyId> {
    if ephemeral.has_working_copy(node_id) {
        return Err(ArborError::Conflict(format!(
            "a working copy already exists for node {node_id}"
        )));
    }
    let node = core.get_node(node_id)?;
    let wc = WorkingCopy {
        id: node_id.clone(),
        working_copy_of: Some(node_id.clone()),
        copied_at: now_millis(),
        base_version: Some(node.version),
        is_draft: false,
        tree_id: node.tree_id,
        parent_id: node.parent_id,
        node_type: node.node_type,
        name: node.name,
        description: node.description,
        staged_classes: Default::default(),
    };
    ephemeral.put_working_copy(wc);
    Ok(node_id.clone())
}

/// A partial update applied to a working copy's node-level fields.
/// Any field left `None` is unchanged.
#[derive(Default)]
pub struct NodeFieldPatch {
    pub parent_id: Option<NodeId>,
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

/// `updateWorkingCopy(nodeId, partial)`: mutates only the Ephemeral
/// record's node-level fields. Entity-body copy-on-write staging is
/// performed by the class-specific `stage_*` functions below, which
/// record the class in `staged_classes` the first time they run.
pub fn update_working_copy(ephemeral: &EphemeralStore, working_copy_id: &WorkingCopyId, patch: NodeFieldPatch) -> Result<WorkingCopy> {
    let mut wc = ephemeral
        .get_working_copy(working_copy_id)
        .ok_or_else(|| ArborError::not_found(format!("working copy {working_copy_id}")))?;
    if let Some(parent_id) = patch.parent_id {
        wc.parent_id = parent_id;
    }
    if let Some(name) = patch.name {
        wc.name = name;
    }
    if let Some(description) = patch.description {
        wc.description = description;
    }
    ephemeral.put_working_copy(wc.clone());
    Ok(wc)
}

/// Copy-on-write staging for a Peer entity body: the first call per
/// session copies the current Core body (or an empty one, for a draft)
/// into the Ephemeral Store and marks the class staged; later calls
/// mutate the Ephemeral copy in place.
pub fn stage_peer(core: &CoreStore, ephemeral: &EphemeralStore, working_copy_id: &WorkingCopyId, patch: Value) -> Result<()> {
    let mut wc = ephemeral
        .get_working_copy(working_copy_id)
        .ok_or_else(|| ArborError::not_found(format!("working copy {working_copy_id}")))?;
    let mut entity = match ephemeral.get_staged_peer(working_copy_id) {
        Some(existing) => existing,
        None => {
            let base = wc
                .working_copy_of
                .as_ref()
                .and_then(|id| core.get_peer_entity(id))
                .unwrap_or_else(|| crate::model::PeerEntity {
                    node_id: working_copy_id.clone(),
                    data: Value::Object(Default::default()),
                    version: 0,
                    updated_at: now_millis(),
                });
            wc.staged_classes.insert(EntityClass::Peer);
            ephemeral.put_working_copy(wc);
            base
        }
    };
    crate::entities::merge_json_pub(&mut entity.data, patch);
    entity.updated_at = now_millis();
    ephemeral.put_staged_peer(working_copy_id, entity);
    Ok(())
}

/// Copy-on-write staging for one Group entity within a session: copies
/// every existing Group entity for this node into the Ephemeral Store
/// the first time any one of them is touched, then applies `patch` to
/// `entity_id` (or appends a fresh entity if `entity_id` is `None`).
pub fn stage_group(
    core: &CoreStore,
    ephemeral: &EphemeralStore,
    working_copy_id: &WorkingCopyId,
    entity_id: Option<EntityId>,
    patch: Value,
) -> Result<EntityId> {
    let mut wc = ephemeral
        .get_working_copy(working_copy_id)
        .ok_or_else(|| ArborError::not_found(format!("working copy {working_copy_id}")))?;
    if !wc.staged_classes.contains(&EntityClass::Group) {
        if let Some(source) = &wc.working_copy_of {
            for entity in core.list_group_entities(source) {
                ephemeral.put_staged_group(entity);
            }
        }
        wc.staged_classes.insert(EntityClass::Group);
        ephemeral.put_working_copy(wc);
    }
    match entity_id {
        Some(id) => {
            let mut entity = ephemeral
                .list_staged_group(working_copy_id)
                .into_iter()
                .find(|g| g.id == id)
                .ok_or_else(|| ArborError::not_found(format!("staged Group entity {id}")))?;
            crate::entities::merge_json_pub(&mut entity.data, patch);
            entity.updated_at = now_millis();
            ephemeral.put_staged_group(entity);
            Ok(id)
        }
        None => {
            let sort_order = ephemeral.list_staged_group(working_copy_id).len() as u32;
            let id = core.mint_entity_id();
            let entity = crate::model::GroupEntity {
                id: id.clone(),
                node_id: working_copy_id.clone(),
                sort_order,
                data: patch,
                version: 1,
                updated_at: now_millis(),
            };
            ephemeral.put_staged_group(entity);
            Ok(id)
        }
    }
}

/// Stages a Relational delta for this session. Unlike Peer/Group there
/// is no body to copy-on-write — only the reference edge changes — so
/// this just records the class as staged and returns the delta for the
/// caller to queue; commit applies deltas in submission order.
pub fn stage_relational(ephemeral: &EphemeralStore, working_copy_id: &WorkingCopyId) -> Result<()> {
    let mut wc = ephemeral
        .get_working_copy(working_copy_id)
        .ok_or_else(|| ArborError::not_found(format!("working copy {working_copy_id}")))?;
    wc.staged_classes.insert(EntityClass::Relational);
    ephemeral.put_working_copy(wc);
    Ok(())
}

/// Commits a working copy per spec §4.5 steps 1–6. `on_name_conflict`
/// governs step 2's draft-name collision; edits always use the current
/// sibling set (an edit's parent rarely changes name collisions, but a
/// caller moving a node through `updateWorkingCopy`'s `parent_id` still
/// goes through the same check). `relational_deltas` carries any
/// Relational reference changes staged during the session, applied in
/// order.
#[allow(clippy::too_many_arguments)]
pub fn commit(
    core: &CoreStore,
    ephemeral: &EphemeralStore,
    registry: &NodeTypeRegistry,
    lifecycle: &LifecycleManager,
    working_copy_id: &WorkingCopyId,
    on_name_conflict: OnNameConflict,
    relational_deltas: &[RelationalDelta],
) -> Result<CommitOutcome> {
    // Step 1
    let wc = ephemeral
        .get_working_copy(working_copy_id)
        .ok_or_else(|| ArborError::not_found(format!("working copy {working_copy_id}")))?;

    let config = registry.get(&wc.node_type)?;
    let now = now_millis();

    let (node, before, kind) = if wc.is_draft {
        // Step 2 (draft branch): resolve a sibling-name collision.
        let resolved_name = resolve_name_conflict(core, &wc.parent_id, &wc.name, on_name_conflict)?;
        let node = Node {
            id: wc.id.clone(),
            tree_id: wc.tree_id.clone(),
            parent_id: wc.parent_id.clone(),
            node_type: wc.node_type.clone(),
            name: resolved_name,
            created_at: now,
            updated_at: now,
            version: 1,
            description: wc.description.clone(),
            has_children: None,
            is_draft: false,
            is_removed: false,
            removed_at: None,
            original_parent_id: None,
            original_name: None,
        };
        lifecycle.before_create(&config, &node)?;
        // Step 3
        let node = core.create_node(node)?;
        (node, None, ChangeKind::Created)
    } else {
        // Step 2 (edit branch): optimistic-concurrency check.
        let current = core.get_node(working_copy_id)?;
        let base_version = wc.base_version.unwrap_or(current.version);
        if current.version > base_version {
            return Err(ArborError::StaleVersion {
                node_id: working_copy_id.to_string(),
                base_version,
                current_version: current.version,
            });
        }
        validate_name(&wc.name)?;
        let next = Node {
            parent_id: wc.parent_id.clone(),
            name: wc.name.clone(),
            description: wc.description.clone(),
            updated_at: now,
            version: current.version + 1,
            ..current.clone()
        };
        lifecycle.before_update(&config, &next, &current)?;
        // Step 3
        let node = core.update_node(next)?;
        (node, Some(current), ChangeKind::Updated)
    };

    // Step 4: apply staged Ephemeral entity bodies to Core.
    if wc.staged_classes.contains(&EntityClass::Peer) {
        if let Some(staged) = ephemeral.get_staged_peer(working_copy_id) {
            core.put_peer_entity(staged);
        }
    }
    if wc.staged_classes.contains(&EntityClass::Group) {
        for entity in ephemeral.list_staged_group(working_copy_id) {
            core.put_group_entity(entity);
        }
    }
    if wc.staged_classes.contains(&EntityClass::Relational) {
        for delta in relational_deltas {
            match delta {
                RelationalDelta::AddReference(entity_id) => {
                    core.add_reference(entity_id, &node.id, now);
                }
                RelationalDelta::RemoveReference(entity_id) => {
                    core.remove_reference(entity_id, &node.id, now);
                }
            }
        }
    }

    // Step 5
    ephemeral.purge_working_copy(working_copy_id);

    // Step 6
    match kind {
        ChangeKind::Created => {
            let rel_entity_id = config.rel_ref_field.as_ref().and_then(|field| relational_ref_entity_id(core, field, &node.id));
            lifecycle.after_create(&config, core, &node, rel_entity_id.as_ref())?
        }
        ChangeKind::Updated => lifecycle.after_update(&config, &node, before.as_ref().unwrap())?,
        _ => unreachable!("commit only ever produces Created or Updated"),
    }

    Ok(CommitOutcome { node, before, kind })
}

/// `discard`: deletes the working-copy record and any staged Ephemeral
/// entity bodies. Never touches Core.
pub fn discard(ephemeral: &EphemeralStore, working_copy_id: &WorkingCopyId) -> Result<()> {
    ephemeral
        .purge_working_copy(working_copy_id)
        .ok_or_else(|| ArborError::not_found(format!("working copy {working_copy_id}")))?;
    Ok(())
}

fn resolve_name_conflict(core: &CoreStore, parent_id: &NodeId, proposed: &str, policy: OnNameConflict) -> Result<String> {
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

/// Helper used only to turn a committed [`ChangeEvent`] out of a
/// [`CommitOutcome`] once the caller (the Command Processor) has
/// assigned a `seq`.
pub fn change_event(outcome: &CommitOutcome, tree_id: TreeId, seq: u64) -> ChangeEvent {
    ChangeEvent {
        kind: outcome.kind,
        node_id: outcome.node.id.clone(),
        tree_id,
        seq,
        before: outcome.before.clone(),
        after: Some(outcome.node.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TreeId;
    use crate::registry::NodeTypeConfig;
    use serde_json::json;

    fn setup() -> (CoreStore, EphemeralStore, NodeTypeRegistry, LifecycleManager, TreeId) {
        let core = CoreStore::new();
        let ephemeral = EphemeralStore::new();
        let registry = NodeTypeRegistry::new();
        registry.register(NodeTypeConfig::new("folder"));
        let lifecycle = LifecycleManager::new(1000);
        let tree_id = core.mint_tree_id();
        let tree = crate::model::Tree {
            id: tree_id.clone(),
            name: "Workspace".into(),
            root_id: tree_id.root_id(),
            trash_root_id: tree_id.trash_root_id(),
            super_root_id: tree_id.super_root_id(),
        };
        core.create_tree(tree, now_millis()).unwrap();
        (core, ephemeral, registry, lifecycle, tree_id)
    }

    #[test]
    fn draft_commit_happy_path_creates_node_at_version_one() {
        let (core, ephemeral, registry, lifecycle, tree_id) = setup();
        let wc_id = create_draft(
            &core,
            &ephemeral,
            DraftSpec {
                tree_id: tree_id.clone(),
                parent_id: tree_id.root_id(),
                node_type: "folder".into(),
                name: "Docs".into(),
                description: None,
            },
        )
        .unwrap();
        let outcome = commit(&core, &ephemeral, &registry, &lifecycle, &wc_id, OnNameConflict::Error, &[]).unwrap();
        assert_eq!(outcome.node.version, 1);
        assert_eq!(outcome.node.name, "Docs");
        assert!(matches!(outcome.kind, ChangeKind::Created));
        assert!(!ephemeral.has_working_copy(&wc_id));
    }

    #[test]
    fn stale_version_fails_and_preserves_working_copy() {
        let (core, ephemeral, registry, lifecycle, tree_id) = setup();
        let wc_id = create_draft(
            &core,
            &ephemeral,
            DraftSpec {
                tree_id: tree_id.clone(),
                parent_id: tree_id.root_id(),
                node_type: "folder".into(),
                name: "Docs".into(),
                description: None,
            },
        )
        .unwrap();
        let outcome = commit(&core, &ephemeral, &registry, &lifecycle, &wc_id, OnNameConflict::Error, &[]).unwrap();
        let node_id = outcome.node.id.clone();

        let edit_id = create_edit(&core, &ephemeral, &node_id).unwrap();
        // external update takes the node to version 2 behind the working copy's back
        let mut node = core.get_node(&node_id).unwrap();
        node.version += 1;
        node.updated_at = now_millis();
        core.update_node(node).unwrap();

        let err = commit(&core, &ephemeral, &registry, &lifecycle, &edit_id, OnNameConflict::Error, &[]).unwrap_err();
        assert!(matches!(err, ArborError::StaleVersion { .. }));
        assert!(ephemeral.has_working_copy(&edit_id));
    }

    #[test]
    fn auto_rename_resolves_a_draft_name_collision() {
        let (core, ephemeral, registry, lifecycle, tree_id) = setup();
        let root_id = tree_id.root_id();
        let first = create_draft(
            &core,
            &ephemeral,
            DraftSpec {
                tree_id: tree_id.clone(),
                parent_id: root_id.clone(),
                node_type: "folder".into(),
                name: "Docs".into(),
                description: None,
            },
        )
        .unwrap();
        commit(&core, &ephemeral, &registry, &lifecycle, &first, OnNameConflict::Error, &[]).unwrap();

        let second = create_draft(
            &core,
            &ephemeral,
            DraftSpec {
                tree_id,
                parent_id: root_id,
                node_type: "folder".into(),
                name: "Docs".into(),
                description: None,
            },
        )
        .unwrap();
        let outcome = commit(&core, &ephemeral, &registry, &lifecycle, &second, OnNameConflict::AutoRename, &[]).unwrap();
        assert_eq!(outcome.node.name, "Docs (2)");
    }

    #[test]
    fn discard_never_touches_core() {
        let (core, ephemeral, _registry, _lifecycle, tree_id) = setup();
        let wc_id = create_draft(
            &core,
            &ephemeral,
            DraftSpec {
                parent_id: tree_id.root_id(),
                tree_id,
                node_type: "folder".into(),
                name: "Docs".into(),
                description: None,
            },
        )
        .unwrap();
        stage_peer(&core, &ephemeral, &wc_id, json!({"k": "v"})).unwrap();
        discard(&ephemeral, &wc_id).unwrap();
        assert!(!ephemeral.has_working_copy(&wc_id));
        assert!(core.try_get_node(&wc_id).is_none());
    }

    #[test]
    fn peer_copy_on_write_stages_only_once() {
        let (core, ephemeral, registry, lifecycle, tree_id) = setup();
        let wc_id = create_draft(
            &core,
            &ephemeral,
            DraftSpec {
                parent_id: tree_id.root_id(),
                tree_id,
                node_type: "folder".into(),
                name: "Docs".into(),
                description: None,
            },
        )
        .unwrap();
        stage_peer(&core, &ephemeral, &wc_id, json!({"a": 1})).unwrap();
        stage_peer(&core, &ephemeral, &wc_id, json!({"b": 2})).unwrap();
        let staged = ephemeral.get_staged_peer(&wc_id).unwrap();
        assert_eq!(staged.data, json!({"a": 1, "b": 2}));
        let outcome = commit(&core, &ephemeral, &registry, &lifecycle, &wc_id, OnNameConflict::Error, &[]).unwrap();
        let entity = core.get_peer_entity(&outcome.node.id).unwrap();
        assert_eq!(entity.data, json!({"a": 1, "b": 2}));
    }
}
