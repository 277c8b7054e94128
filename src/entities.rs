//! Entity Handlers: per-classification CRUD and cleanup.
//!
//! [`EntityClassBinding`] is a tagged variant over the four
//! classifications {Peer, Group, Relational, Ephemeral}, each carrying
//! its concrete table bindings; a [`crate::registry::NodeTypeConfig`]
//! carries a `Vec` of them (one per entity class the node type
//! attaches). The CRUD logic itself is generic free functions below —
//! every node type's Peer entities share the same storage shape, so
//! there is no need for a second layer of per-type dynamic dispatch on
//! top of the tagged variant.

use serde_json::Value;

use crate::error::{ArborError, Result};
use crate::ids::{EntityId, NodeId};
use crate::model::{now_millis, EntityClass, GroupEntity, PeerEntity, RelationalEntity};
use crate::store::CoreStore;

/// Which entity class a node type attaches, and any class-specific
/// configuration (currently only Relational's field name, used by the
/// Lifecycle Manager's reference-count accounting).
#[derive(Clone, Debug)]
pub enum EntityClassBinding {
    /// Exactly one per node.
    Peer,
    /// Zero-or-more per node, ordered.
    Group,
    /// Many-to-many, reference-counted. `field_name` names the field on
    /// the owning node type that the Lifecycle Manager auto-accounts
    /// (`relRefField`).
    Relational { field_name: String },
    /// Tied to a working-copy session.
    Ephemeral,
}

impl EntityClassBinding {
    pub fn class(&self) -> EntityClass {
        match self {
            EntityClassBinding::Peer => EntityClass::Peer,
            EntityClassBinding::Group => EntityClass::Group,
            EntityClassBinding::Relational { .. } => EntityClass::Relational,
            EntityClassBinding::Ephemeral => EntityClass::Ephemeral,
        }
    }
}

/// Peer entity CRUD against the Core Store: exactly one per node.
pub mod peer {
    use super::*;

    /// Creates the node's Peer entity. Enforces one-per-node.
    pub fn create(store: &CoreStore, node_id: &NodeId, data: Value) -> Result<PeerEntity> {
        if store.get_peer_entity(node_id).is_some() {
            return Err(ArborError::Conflict(format!(
                "node {node_id} already has a Peer entity"
            )));
        }
        let now = now_millis();
        let entity = PeerEntity {
            node_id: node_id.clone(),
            data,
            version: 1,
            updated_at: now,
        };
        store.put_peer_entity(entity.clone());
        Ok(entity)
    }

    pub fn get(store: &CoreStore, node_id: &NodeId) -> Option<PeerEntity> {
        store.get_peer_entity(node_id)
    }

    pub fn update(store: &CoreStore, node_id: &NodeId, patch: Value) -> Result<PeerEntity> {
        let mut entity = store
            .get_peer_entity(node_id)
            .ok_or_else(|| ArborError::not_found(format!("Peer entity for node {node_id}")))?;
        merge_json(&mut entity.data, patch);
        entity.version += 1;
        entity.updated_at = now_millis();
        store.put_peer_entity(entity.clone());
        Ok(entity)
    }

    pub fn delete(store: &CoreStore, node_id: &NodeId) -> Option<PeerEntity> {
        store.delete_peer_entity(node_id)
    }

    /// Idempotent: deletes the one Peer entity for this node, if any.
    pub fn cleanup(store: &CoreStore, node_id: &NodeId) {
        store.delete_peer_entity(node_id);
    }
}

/// Group entity CRUD against the Core Store: zero-or-more per node,
/// totally ordered by `sortOrder`.
pub mod group {
    use super::*;

    pub fn create(store: &CoreStore, node_id: &NodeId, data: Value) -> GroupEntity {
        let sort_order = store.list_group_entities(node_id).len() as u32;
        let now = now_millis();
        let entity = GroupEntity {
            id: store.mint_entity_id(),
            node_id: node_id.clone(),
            sort_order,
            data,
            version: 1,
            updated_at: now,
        };
        store.put_group_entity(entity.clone());
        entity
    }

    pub fn get(store: &CoreStore, entity_id: &EntityId) -> Option<GroupEntity> {
        store.get_group_entity(entity_id)
    }

    pub fn list(store: &CoreStore, node_id: &NodeId) -> Vec<GroupEntity> {
        store.list_group_entities(node_id)
    }

    pub fn update(store: &CoreStore, entity_id: &EntityId, patch: Value) -> Result<GroupEntity> {
        let mut entity = store
            .get_group_entity(entity_id)
            .ok_or_else(|| ArborError::not_found(format!("Group entity {entity_id}")))?;
        merge_json(&mut entity.data, patch);
        entity.version += 1;
        entity.updated_at = now_millis();
        store.put_group_entity(entity.clone());
        Ok(entity)
    }

    pub fn delete(store: &CoreStore, entity_id: &EntityId) -> Option<GroupEntity> {
        store.delete_group_entity(entity_id)
    }

    /// Renumbers the node's group in one transactional pass; `new_order`
    /// must be a permutation of the node's existing entity ids.
    pub fn reorder(store: &CoreStore, node_id: &NodeId, new_order: &[EntityId]) -> Result<()> {
        store.reorder_group(node_id, new_order)
    }

    /// Idempotent: batch-deletes every Group entity attached to this node.
    pub fn cleanup(store: &CoreStore, node_id: &NodeId) {
        for entity in store.list_group_entities(node_id) {
            store.delete_group_entity(&entity.id);
        }
    }
}

/// Relational entity CRUD against the Core Store: many-to-many,
/// reference-counted, auto-deleted at refcount zero.
pub mod relational {
    use super::*;

    /// Creates a Relational entity already referenced by `owner`. Spec
    /// §8 invariant 5 requires the entity to exist iff its refcount is
    /// positive, so construction and the first reference happen
    /// together rather than leaving a momentarily-unreferenced entity.
    pub fn create(store: &CoreStore, data: Value, owner: &NodeId) -> RelationalEntity {
        let id = store.mint_entity_id();
        let now = now_millis();
        let mut referring_node_ids = std::collections::BTreeSet::new();
        referring_node_ids.insert(owner.clone());
        let entity = RelationalEntity {
            id: id.clone(),
            data,
            referring_node_ids,
            version: 1,
            updated_at: now,
        };
        store.put_relational_entity(entity.clone());
        entity
    }

    pub fn get(store: &CoreStore, entity_id: &EntityId) -> Option<RelationalEntity> {
        store.get_relational_entity(entity_id)
    }

    pub fn update(store: &CoreStore, entity_id: &EntityId, patch: Value) -> Result<RelationalEntity> {
        let mut entity = store
            .get_relational_entity(entity_id)
            .ok_or_else(|| ArborError::not_found(format!("Relational entity {entity_id}")))?;
        merge_json(&mut entity.data, patch);
        entity.version += 1;
        entity.updated_at = now_millis();
        store.put_relational_entity(entity.clone());
        Ok(entity)
    }

    /// Adds `node_id` to the entity's referring set. Idempotent.
    pub fn add_reference(store: &CoreStore, entity_id: &EntityId, node_id: &NodeId) -> RelationalEntity {
        store.add_reference(entity_id, node_id, now_millis())
    }

    /// Removes `node_id` from the entity's referring set, deleting the
    /// entity if the set becomes empty. Idempotent.
    pub fn remove_reference(store: &CoreStore, entity_id: &EntityId, node_id: &NodeId) -> Option<RelationalEntity> {
        store.remove_reference(entity_id, node_id, now_millis())
    }

    /// Idempotent: decrements the node's reference wherever it holds
    /// one. Relational entities don't belong to a single node, so
    /// "cleanup" for this class is always expressed as `remove_reference`
    /// against the specific entity the node referenced — callers (the
    /// Lifecycle Manager) drive this via `rel_ref_field`.
    pub fn cleanup(store: &CoreStore, entity_id: &EntityId, node_id: &NodeId) {
        store.remove_reference(entity_id, node_id, now_millis());
    }
}

/// Ephemeral entity CRUD against the Ephemeral Store: tied to a working
/// copy, purged when the working copy ends.
pub mod ephemeral {
    use super::*;
    use crate::ids::WorkingCopyId;
    use crate::model::EphemeralEntity;
    use crate::store::EphemeralStore;

    pub fn create(store: &EphemeralStore, working_copy_id: &WorkingCopyId, data: Value) -> EphemeralEntity {
        let now = now_millis();
        let entity = EphemeralEntity {
            id: EntityId::new(format!("eph-{}-{}", working_copy_id, store.list_ephemeral(working_copy_id).len())),
            working_copy_id: working_copy_id.clone(),
            data,
            version: 1,
            updated_at: now,
        };
        store.put_ephemeral(entity.clone());
        entity
    }

    pub fn get(store: &EphemeralStore, entity_id: &EntityId) -> Option<EphemeralEntity> {
        store.get_ephemeral(entity_id)
    }

    pub fn list(store: &EphemeralStore, working_copy_id: &WorkingCopyId) -> Vec<EphemeralEntity> {
        store.list_ephemeral(working_copy_id)
    }

    pub fn update(store: &EphemeralStore, entity_id: &EntityId, patch: Value) -> Result<EphemeralEntity> {
        let mut entity = store
            .get_ephemeral(entity_id)
            .ok_or_else(|| ArborError::not_found(format!("Ephemeral entity {entity_id}")))?;
        merge_json(&mut entity.data, patch);
        entity.version += 1;
        entity.updated_at = now_millis();
        store.put_ephemeral(entity.clone());
        Ok(entity)
    }

    pub fn delete(store: &EphemeralStore, entity_id: &EntityId) -> Option<EphemeralEntity> {
        store.delete_ephemeral(entity_id)
    }

    /// Idempotent: batch-deletes every Ephemeral entity under this
    /// working copy. In practice `EphemeralStore::purge_working_copy`
    /// already does this as part of commit/discard; this exists so the
    /// common handler surface (`cleanup(nodeId)`) is uniform across all
    /// four classes.
    pub fn cleanup(store: &EphemeralStore, working_copy_id: &WorkingCopyId) {
        for entity in store.list_ephemeral(working_copy_id) {
            store.delete_ephemeral(&entity.id);
        }
    }
}

/// Shallow merge of a JSON patch into a JSON body: object keys
/// overwrite, everything else replaces wholesale. Good enough for the
/// opaque, plugin-defined entity bodies this crate stores but never
/// interprets.
///
/// Exposed crate-wide as `merge_json_pub` so the Working-Copy Protocol
/// can apply the same merge semantics to Ephemeral-staged bodies
/// before they're copied into Core.
pub(crate) fn merge_json_pub(target: &mut Value, patch: Value) {
    merge_json(target, patch)
}

fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                target_map.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}
