//! The Core Store: durable tables for trees, nodes, and per-classification
//! entity bodies.
//!
//! Write paths follow one shape throughout: bump counters, write the
//! row, update secondary indexes, then let the caller publish a change
//! event once the version bump has landed. "Durable" here means "the
//! authoritative copy this process treats as committed" — there is no
//! requirement on the physical backing store, and this crate ships only
//! an in-memory one (see [`crate::store::table::InMemoryTable`]).

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{ArborError, Result};
use crate::ids::{EntityId, IdGenerator, NodeId, TreeId};
use crate::model::{GroupEntity, Node, PeerEntity, RelationalEntity, Tree};
use crate::store::table::{InMemoryTable, Table};

/// Durable tables for trees, nodes, and attached entities.
pub struct CoreStore {
    trees: InMemoryTable<TreeId, Tree>,
    nodes: InMemoryTable<NodeId, Node>,
    /// parentId -> sorted set of child NodeIds, maintained alongside
    /// `nodes` so `listChildren` doesn't need a full table scan.
    children_index: RwLock<FxHashMap<NodeId, BTreeSet<NodeId>>>,
    peer_entities: InMemoryTable<NodeId, PeerEntity>,
    group_entities: InMemoryTable<EntityId, GroupEntity>,
    /// nodeId -> entity ids in `sortOrder`, maintained gap-free.
    group_index: RwLock<FxHashMap<NodeId, Vec<EntityId>>>,
    relational_entities: InMemoryTable<EntityId, RelationalEntity>,
    tree_ids: IdGenerator,
    node_ids: IdGenerator,
    entity_ids: IdGenerator,
}

impl CoreStore {
    pub fn new() -> Self {
        Self {
            trees: InMemoryTable::new(),
            nodes: InMemoryTable::new(),
            children_index: RwLock::new(FxHashMap::default()),
            peer_entities: InMemoryTable::new(),
            group_entities: InMemoryTable::new(),
            group_index: RwLock::new(FxHashMap::default()),
            relational_entities: InMemoryTable::new(),
            tree_ids: IdGenerator::new("tree"),
            node_ids: IdGenerator::new("n"),
            entity_ids: IdGenerator::new("e"),
        }
    }

    pub fn mint_tree_id(&self) -> TreeId {
        TreeId::new(self.tree_ids.next_raw())
    }

    pub fn mint_node_id(&self) -> NodeId {
        NodeId::new(self.node_ids.next_raw())
    }

    pub fn mint_entity_id(&self) -> EntityId {
        EntityId::new(self.entity_ids.next_raw())
    }

    // -- trees ---------------------------------------------------------

    /// Creates `tree` and its three distinguished nodes atomically. The
    /// distinguished nodes bypass the normal name/uniqueness rules and
    /// carry the permissive sentinel node type `"__root__"`.
    pub fn create_tree(&self, tree: Tree, now: crate::model::Millis) -> Result<()> {
        if self.trees.contains(&tree.id) {
            return Err(ArborError::Conflict(format!("tree {} already exists", tree.id)));
        }
        let super_root = Self::distinguished_node(&tree, tree.super_root_id.clone(), tree.super_root_id.clone(), now);
        let root = Self::distinguished_node(&tree, tree.root_id.clone(), tree.super_root_id.clone(), now);
        let trash = Self::distinguished_node(&tree, tree.trash_root_id.clone(), tree.super_root_id.clone(), now);

        self.nodes.insert(super_root.id.clone(), super_root);
        self.nodes.insert(root.id.clone(), root.clone());
        self.nodes.insert(trash.id.clone(), trash.clone());
        self.children_index
            .write()
            .entry(tree.super_root_id.clone())
            .or_default()
            .extend([root.id, trash.id]);
        self.trees.insert(tree.id.clone(), tree);
        Ok(())
    }

    fn distinguished_node(tree: &Tree, id: NodeId, parent_id: NodeId, now: crate::model::Millis) -> Node {
        Node {
            id,
            tree_id: tree.id.clone(),
            parent_id,
            node_type: "__root__".to_string(),
            name: tree.name.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
            description: None,
            has_children: None,
            is_draft: false,
            is_removed: false,
            removed_at: None,
            original_parent_id: None,
            original_name: None,
        }
    }

    pub fn get_tree(&self, tree_id: &TreeId) -> Result<Tree> {
        self.trees
            .get(tree_id)
            .ok_or_else(|| ArborError::not_found(format!("tree {tree_id}")))
    }

    // -- nodes -----------------------------------------------------------

    pub fn get_node(&self, node_id: &NodeId) -> Result<Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| ArborError::not_found(format!("node {node_id}")))
    }

    pub fn try_get_node(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.get(node_id)
    }

    /// Children of `parent_id`, order unspecified unless the caller sorts.
    pub fn list_children(&self, parent_id: &NodeId) -> Vec<Node> {
        let ids = self
            .children_index
            .read()
            .get(parent_id)
            .cloned()
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.nodes.get(&id)).collect()
    }

    pub fn sibling_names(&self, parent_id: &NodeId) -> BTreeSet<String> {
        self.list_children(parent_id).into_iter().map(|n| n.name).collect()
    }

    /// Creates `node` atomically: rejects a name collision under its
    /// parent, inserts into the node table and the children index.
    pub fn create_node(&self, node: Node) -> Result<Node> {
        if self.nodes.contains(&node.id) {
            return Err(ArborError::Conflict(format!("node {} already exists", node.id)));
        }
        if self.sibling_names(&node.parent_id).contains(&node.name) {
            return Err(ArborError::NameNotUnique(node.name.clone(), node.parent_id.to_string()));
        }
        self.children_index
            .write()
            .entry(node.parent_id.clone())
            .or_default()
            .insert(node.id.clone());
        self.nodes.insert(node.id.clone(), node.clone());
        debug!(node_id = %node.id, "core store: node created");
        Ok(node)
    }

    /// Updates `node` atomically; rejects a write whose `version` does
    /// not equal `stored.version + 1` (the optimistic-concurrency
    /// contract every caller writes against).
    pub fn update_node(&self, node: Node) -> Result<Node> {
        let current = self.get_node(&node.id)?;
        if node.version != current.version + 1 {
            return Err(ArborError::StaleVersion {
                node_id: node.id.to_string(),
                base_version: node.version.saturating_sub(1),
                current_version: current.version,
            });
        }
        if current.parent_id != node.parent_id {
            self.reindex_parent(&node.id, &current.parent_id, &node.parent_id);
        } else if current.name != node.name
            && self.sibling_names(&node.parent_id).contains(&node.name)
        {
            return Err(ArborError::NameNotUnique(node.name.clone(), node.parent_id.to_string()));
        }
        self.nodes.insert(node.id.clone(), node.clone());
        debug!(node_id = %node.id, version = node.version, "core store: node updated");
        Ok(node)
    }

    fn reindex_parent(&self, node_id: &NodeId, old_parent: &NodeId, new_parent: &NodeId) {
        let mut index = self.children_index.write();
        if let Some(set) = index.get_mut(old_parent) {
            set.remove(node_id);
        }
        index.entry(new_parent.clone()).or_default().insert(node_id.clone());
    }

    /// Hard-deletes `node_id` and drops it from the children index. Does
    /// not cascade to entities or descendants; callers (the Tree
    /// Mutation Service) are responsible for those.
    pub fn delete_node(&self, node_id: &NodeId) -> Result<Node> {
        let node = self.get_node(node_id)?;
        let mut index = self.children_index.write();
        if let Some(set) = index.get_mut(&node.parent_id) {
            set.remove(node_id);
        }
        index.remove(node_id);
        drop(index);
        self.nodes.remove(node_id);
        debug!(node_id = %node_id, "core store: node deleted");
        Ok(node)
    }

    // -- Peer entities -----------------------------------------------------

    pub fn get_peer_entity(&self, node_id: &NodeId) -> Option<PeerEntity> {
        self.peer_entities.get(node_id)
    }

    pub fn put_peer_entity(&self, entity: PeerEntity) {
        self.peer_entities.insert(entity.node_id.clone(), entity);
    }

    pub fn delete_peer_entity(&self, node_id: &NodeId) -> Option<PeerEntity> {
        self.peer_entities.remove(node_id)
    }

    // -- Group entities ----------------------------------------------------

    pub fn get_group_entity(&self, entity_id: &EntityId) -> Option<GroupEntity> {
        self.group_entities.get(entity_id)
    }

    pub fn list_group_entities(&self, node_id: &NodeId) -> Vec<GroupEntity> {
        self.group_index
            .read()
            .get(node_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.group_entities.get(&id))
            .collect()
    }

    /// Inserts or replaces a Group entity, appending to its node's
    /// ordered index if new.
    pub fn put_group_entity(&self, entity: GroupEntity) {
        let mut index = self.group_index.write();
        let list = index.entry(entity.node_id.clone()).or_default();
        if !list.contains(&entity.id) {
            list.push(entity.id.clone());
        }
        drop(index);
        self.group_entities.insert(entity.id.clone(), entity);
    }

    pub fn delete_group_entity(&self, entity_id: &EntityId) -> Option<GroupEntity> {
        let entity = self.group_entities.remove(entity_id)?;
        if let Some(list) = self.group_index.write().get_mut(&entity.node_id) {
            list.retain(|id| id != entity_id);
        }
        Some(entity)
    }

    /// Renumbers `node_id`'s group in a single pass so `sortOrder`
    /// remains gap-free, per the caller-supplied new ordering.
    pub fn reorder_group(&self, node_id: &NodeId, ordered_ids: &[EntityId]) -> Result<()> {
        let mut index = self.group_index.write();
        let current: BTreeSet<EntityId> = index.get(node_id).cloned().unwrap_or_default().into_iter().collect();
        let proposed: BTreeSet<EntityId> = ordered_ids.iter().cloned().collect();
        if current != proposed {
            return Err(ArborError::InvalidArgument(
                "reorder_group: proposed ordering does not match the node's existing entity set".into(),
            ));
        }
        index.insert(node_id.clone(), ordered_ids.to_vec());
        drop(index);
        for (i, id) in ordered_ids.iter().enumerate() {
            if let Some(mut entity) = self.group_entities.get(id) {
                entity.sort_order = i as u32;
                self.group_entities.insert(id.clone(), entity);
            }
        }
        Ok(())
    }

    // -- Relational entities -------------------------------------------------

    pub fn get_relational_entity(&self, entity_id: &EntityId) -> Option<RelationalEntity> {
        self.relational_entities.get(entity_id)
    }

    pub fn put_relational_entity(&self, entity: RelationalEntity) {
        self.relational_entities.insert(entity.id.clone(), entity);
    }

    pub fn delete_relational_entity(&self, entity_id: &EntityId) -> Option<RelationalEntity> {
        self.relational_entities.remove(entity_id)
    }

    /// Adds `node_id` to the entity's referring set, creating an empty
    /// entity body if `entity_id` is new. Idempotent.
    pub fn add_reference(&self, entity_id: &EntityId, node_id: &NodeId, now: crate::model::Millis) -> RelationalEntity {
        let mut entity = self.relational_entities.get(entity_id).unwrap_or_else(|| RelationalEntity {
            id: entity_id.clone(),
            data: serde_json::Value::Null,
            referring_node_ids: BTreeSet::new(),
            version: 0,
            updated_at: now,
        });
        entity.referring_node_ids.insert(node_id.clone());
        entity.version += 1;
        entity.updated_at = now;
        self.relational_entities.insert(entity_id.clone(), entity.clone());
        entity
    }

    /// Removes `node_id` from the entity's referring set; deletes the
    /// entity when the set becomes empty. Idempotent on the set (spec
    /// §8's round-trip law).
    pub fn remove_reference(&self, entity_id: &EntityId, node_id: &NodeId, now: crate::model::Millis) -> Option<RelationalEntity> {
        let mut entity = self.relational_entities.get(entity_id)?;
        entity.referring_node_ids.remove(node_id);
        if entity.referring_node_ids.is_empty() {
            self.relational_entities.remove(entity_id);
            return None;
        }
        entity.version += 1;
        entity.updated_at = now;
        self.relational_entities.insert(entity_id.clone(), entity.clone());
        Some(entity)
    }

    /// Diagnostic snapshot of every tree currently registered.
    pub fn trees_snapshot(&self) -> BTreeMap<TreeId, Tree> {
        self.trees.values().into_iter().map(|t| (t.id.clone(), t)).collect()
    }
}

impl Default for CoreStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tree(core: &CoreStore) -> Tree {
        let id = core.mint_tree_id();
        let tree = Tree {
            id: id.clone(),
            name: "Workspace".into(),
            root_id: id.root_id(),
            trash_root_id: id.trash_root_id(),
            super_root_id: id.super_root_id(),
        };
        core.create_tree(tree.clone(), 0).unwrap();
        tree
    }

    fn leaf(core: &CoreStore, tree: &Tree, parent_id: &NodeId, name: &str) -> Node {
        core.create_node(Node {
            id: core.mint_node_id(),
            tree_id: tree.id.clone(),
            parent_id: parent_id.clone(),
            node_type: "folder".into(),
            name: name.into(),
            created_at: 0,
            updated_at: 0,
            version: 1,
            description: None,
            has_children: None,
            is_draft: false,
            is_removed: false,
            removed_at: None,
            original_parent_id: None,
            original_name: None,
        })
        .unwrap()
    }

    #[test]
    fn create_tree_wires_the_three_distinguished_nodes_under_super_root() {
        let core = CoreStore::new();
        let tree = new_tree(&core);
        let super_children = core.list_children(&tree.super_root_id);
        let super_child_ids: BTreeSet<NodeId> = super_children.into_iter().map(|n| n.id).collect();
        assert!(super_child_ids.contains(&tree.root_id));
        assert!(super_child_ids.contains(&tree.trash_root_id));
        assert_eq!(core.get_node(&tree.root_id).unwrap().parent_id, tree.super_root_id);
    }

    #[test]
    fn create_node_rejects_duplicate_sibling_name() {
        let core = CoreStore::new();
        let tree = new_tree(&core);
        leaf(&core, &tree, &tree.root_id, "Docs");
        let dup = Node {
            id: core.mint_node_id(),
            tree_id: tree.id.clone(),
            parent_id: tree.root_id.clone(),
            node_type: "folder".into(),
            name: "Docs".into(),
            created_at: 0,
            updated_at: 0,
            version: 1,
            description: None,
            has_children: None,
            is_draft: false,
            is_removed: false,
            removed_at: None,
            original_parent_id: None,
            original_name: None,
        };
        let err = core.create_node(dup).unwrap_err();
        assert!(matches!(err, ArborError::NameNotUnique(_, _)));
    }

    #[test]
    fn update_node_rejects_a_version_that_is_not_exactly_plus_one() {
        let core = CoreStore::new();
        let tree = new_tree(&core);
        let a = leaf(&core, &tree, &tree.root_id, "A");
        let mut stale = a.clone();
        stale.version = a.version + 2;
        let err = core.update_node(stale).unwrap_err();
        assert!(matches!(err, ArborError::StaleVersion { .. }));
    }

    #[test]
    fn update_node_reindexes_children_on_reparent() {
        let core = CoreStore::new();
        let tree = new_tree(&core);
        let a = leaf(&core, &tree, &tree.root_id, "A");
        let b = leaf(&core, &tree, &tree.root_id, "B");
        let moved = Node {
            parent_id: a.id.clone(),
            version: b.version + 1,
            ..b.clone()
        };
        core.update_node(moved).unwrap();
        assert!(core.list_children(&tree.root_id).iter().all(|n| n.id != b.id));
        assert!(core.list_children(&a.id).iter().any(|n| n.id == b.id));
    }

    #[test]
    fn delete_node_drops_it_from_the_children_index() {
        let core = CoreStore::new();
        let tree = new_tree(&core);
        let a = leaf(&core, &tree, &tree.root_id, "A");
        core.delete_node(&a.id).unwrap();
        assert!(core.try_get_node(&a.id).is_none());
        assert!(core.list_children(&tree.root_id).is_empty());
    }

    #[test]
    fn reorder_group_rejects_a_set_that_does_not_match() {
        let core = CoreStore::new();
        let node_id = NodeId::new("n1");
        let a = core.mint_entity_id();
        core.put_group_entity(GroupEntity {
            id: a.clone(),
            node_id: node_id.clone(),
            sort_order: 0,
            data: serde_json::Value::Null,
            version: 1,
            updated_at: 0,
        });
        let bogus = core.mint_entity_id();
        let err = core.reorder_group(&node_id, &[bogus]).unwrap_err();
        assert!(matches!(err, ArborError::InvalidArgument(_)));
    }
}
