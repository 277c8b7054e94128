//! The Ephemeral Store: working copies and copy-on-write entity bodies.
//!
//! Mirrors [`crate::store::core::CoreStore`]'s shape but carries no
//! durability guarantee; purging every record is always a valid
//! recovery path, so there is no version-conflict checking here — a
//! working copy is owned by exactly one session.

use tracing::debug;

use crate::ids::{EntityId, NodeId, WorkingCopyId};
use crate::model::{EphemeralEntity, GroupEntity, PeerEntity, RelationalDelta, WorkingCopy};
use crate::store::table::{InMemoryTable, Table};

/// Working copies and entity bodies staged by copy-on-write, keyed
/// identically to their Core Store counterparts.
pub struct EphemeralStore {
    working_copies: InMemoryTable<WorkingCopyId, WorkingCopy>,
    staged_peer: InMemoryTable<NodeId, PeerEntity>,
    staged_group: InMemoryTable<EntityId, GroupEntity>,
    staged_ephemeral: InMemoryTable<EntityId, EphemeralEntity>,
    /// Relational add/remove reference deltas queued during a session,
    /// applied in order against Core at commit (spec §4.5 step 4).
    relational_deltas: InMemoryTable<WorkingCopyId, Vec<RelationalDelta>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self {
            working_copies: InMemoryTable::new(),
            staged_peer: InMemoryTable::new(),
            staged_group: InMemoryTable::new(),
            staged_ephemeral: InMemoryTable::new(),
            relational_deltas: InMemoryTable::new(),
        }
    }

    /// Appends a Relational delta to the working copy's pending queue.
    pub fn push_relational_delta(&self, working_copy_id: &WorkingCopyId, delta: RelationalDelta) {
        let mut deltas = self.relational_deltas.get(working_copy_id).unwrap_or_default();
        deltas.push(delta);
        self.relational_deltas.insert(working_copy_id.clone(), deltas);
    }

    /// Removes and returns every Relational delta queued for this
    /// working copy, in the order they were pushed.
    pub fn take_relational_deltas(&self, working_copy_id: &WorkingCopyId) -> Vec<RelationalDelta> {
        self.relational_deltas.remove(working_copy_id).unwrap_or_default()
    }

    // -- working copies ----------------------------------------------------

    pub fn get_working_copy(&self, id: &WorkingCopyId) -> Option<WorkingCopy> {
        self.working_copies.get(id)
    }

    pub fn has_working_copy(&self, id: &WorkingCopyId) -> bool {
        self.working_copies.contains(id)
    }

    pub fn put_working_copy(&self, wc: WorkingCopy) {
        debug!(working_copy_id = %wc.id, is_draft = wc.is_draft, "ephemeral store: working copy staged");
        self.working_copies.insert(wc.id.clone(), wc);
    }

    /// Removes the working copy record and every entity body staged
    /// under it, regardless of class. Used by both commit (step 5) and
    /// discard.
    pub fn purge_working_copy(&self, id: &WorkingCopyId) -> Option<WorkingCopy> {
        let wc = self.working_copies.remove(id)?;
        self.staged_peer.remove(id);
        let group_ids: Vec<EntityId> = self
            .staged_group
            .values()
            .into_iter()
            .filter(|g| &g.node_id == id)
            .map(|g| g.id)
            .collect();
        for gid in group_ids {
            self.staged_group.remove(&gid);
        }
        let ephemeral_ids: Vec<EntityId> = self
            .staged_ephemeral
            .values()
            .into_iter()
            .filter(|e| &e.working_copy_id == id)
            .map(|e| e.id)
            .collect();
        for eid in ephemeral_ids {
            self.staged_ephemeral.remove(&eid);
        }
        self.relational_deltas.remove(id);
        debug!(working_copy_id = %id, "ephemeral store: working copy purged");
        Some(wc)
    }

    // -- staged Peer ---------------------------------------------------------

    pub fn get_staged_peer(&self, working_copy_id: &WorkingCopyId) -> Option<PeerEntity> {
        self.staged_peer.get(working_copy_id)
    }

    pub fn put_staged_peer(&self, working_copy_id: &WorkingCopyId, entity: PeerEntity) {
        self.staged_peer.insert(working_copy_id.clone(), entity);
    }

    // -- staged Group --------------------------------------------------------

    pub fn list_staged_group(&self, working_copy_id: &WorkingCopyId) -> Vec<GroupEntity> {
        self.staged_group
            .values()
            .into_iter()
            .filter(|g| &g.node_id == working_copy_id)
            .collect()
    }

    pub fn put_staged_group(&self, entity: GroupEntity) {
        self.staged_group.insert(entity.id.clone(), entity);
    }

    // -- Ephemeral entities ------------------------------------------------

    pub fn list_ephemeral(&self, working_copy_id: &WorkingCopyId) -> Vec<EphemeralEntity> {
        self.staged_ephemeral
            .values()
            .into_iter()
            .filter(|e| &e.working_copy_id == working_copy_id)
            .collect()
    }

    pub fn get_ephemeral(&self, entity_id: &EntityId) -> Option<EphemeralEntity> {
        self.staged_ephemeral.get(entity_id)
    }

    pub fn put_ephemeral(&self, entity: EphemeralEntity) {
        self.staged_ephemeral.insert(entity.id.clone(), entity);
    }

    pub fn delete_ephemeral(&self, entity_id: &EntityId) -> Option<EphemeralEntity> {
        self.staged_ephemeral.remove(entity_id)
    }

    /// Map used by tests/diagnostics, not in the spec's public contract.
    #[cfg(test)]
    pub fn working_copy_count(&self) -> usize {
        self.working_copies.len()
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_millis;

    fn sample_working_copy(id: &WorkingCopyId) -> WorkingCopy {
        WorkingCopy {
            id: id.clone(),
            working_copy_of: None,
            copied_at: now_millis(),
            base_version: None,
            is_draft: true,
            tree_id: crate::ids::TreeId::new("t1"),
            parent_id: NodeId::new("t1Root"),
            node_type: "folder".into(),
            name: "Docs".into(),
            description: None,
            staged_classes: Default::default(),
        }
    }

    #[test]
    fn purge_working_copy_removes_staged_bodies_of_every_class() {
        let store = EphemeralStore::new();
        let id = NodeId::new("wc1");
        store.put_working_copy(sample_working_copy(&id));
        store.put_staged_peer(
            &id,
            PeerEntity {
                node_id: id.clone(),
                data: serde_json::json!({"a": 1}),
                version: 1,
                updated_at: 0,
            },
        );
        store.put_staged_group(GroupEntity {
            id: EntityId::new("g1"),
            node_id: id.clone(),
            sort_order: 0,
            data: serde_json::Value::Null,
            version: 1,
            updated_at: 0,
        });
        assert_eq!(store.working_copy_count(), 1);

        store.purge_working_copy(&id);
        assert!(!store.has_working_copy(&id));
        assert!(store.get_staged_peer(&id).is_none());
        assert!(store.list_staged_group(&id).is_empty());
        assert_eq!(store.working_copy_count(), 0);
    }

    #[test]
    fn relational_deltas_drain_in_push_order() {
        let store = EphemeralStore::new();
        let id = NodeId::new("wc1");
        store.push_relational_delta(&id, RelationalDelta::AddReference(EntityId::new("e1")));
        store.push_relational_delta(&id, RelationalDelta::RemoveReference(EntityId::new("e2")));
        let deltas = store.take_relational_deltas(&id);
        assert!(matches!(deltas[0], RelationalDelta::AddReference(_)));
        assert!(matches!(deltas[1], RelationalDelta::RemoveReference(_)));
        assert!(store.take_relational_deltas(&id).is_empty());
    }
}

