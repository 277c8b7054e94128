//! The Node Type Registry: process-wide, read-mostly configuration per
//! registered node type.
//!
//! Grounded on the teacher's guarded shared-state pattern generalized
//! per spec §9's re-architecture note: registration is serialized
//! against lookups via a single `RwLock`, and a registration replaces
//! the whole map entry (copy-on-write at the entry granularity) rather
//! than mutating it in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::entities::EntityClassBinding;
use crate::error::{ArborError, Result};
use crate::model::NodeType;

/// Lifecycle hook set for a node type. Every hook is optional; absent
/// hooks are simply not invoked.
#[derive(Clone, Default)]
pub struct HookSet {
    pub before_create: Option<Hook>,
    pub after_create: Option<Hook>,
    pub before_update: Option<Hook>,
    pub after_update: Option<Hook>,
    pub before_delete: Option<Hook>,
    pub after_delete: Option<Hook>,
    pub before_move: Option<Hook>,
    pub after_move: Option<Hook>,
}

/// A single lifecycle hook.
///
/// Modeled as a synchronous callback rather than an `async fn`: see
/// DESIGN.md's "hooks as synchronous callbacks" entry for why.
pub type Hook = Arc<dyn Fn(&crate::lifecycle::HookContext) -> Result<()> + Send + Sync>;

/// Per-node-type configuration, as returned by [`NodeTypeRegistry::get`].
#[derive(Clone)]
pub struct NodeTypeConfig {
    /// The registered type identifier.
    pub node_type: NodeType,
    /// Human-readable display name; inert metadata.
    pub display_name: String,
    /// Icon identifier; inert metadata.
    pub icon: String,
    /// Allowed child node types, or `None` for unrestricted.
    pub allowed_children: Option<Vec<NodeType>>,
    /// Entity class bindings this node type attaches.
    pub entity_bindings: Vec<EntityClassBinding>,
    /// Lifecycle hooks for this node type.
    pub hooks: HookSet,
    /// If set, names the Relational entity field the Lifecycle Manager
    /// auto-accounts reference counts against on create/delete (spec
    /// §4.7's `relRefField`).
    pub rel_ref_field: Option<String>,
    /// A failing `before*` hook aborts the operation and propagates.
    pub stop_on_error: bool,
    pub can_be_root: bool,
    pub can_be_deleted: bool,
    pub can_be_renamed: bool,
    pub can_be_moved: bool,
    pub max_children: Option<usize>,
}

impl NodeTypeConfig {
    /// A minimal config with every flag permissive and no hooks/entities.
    pub fn new(node_type: impl Into<NodeType>) -> Self {
        Self {
            node_type: node_type.into(),
            display_name: String::new(),
            icon: String::new(),
            allowed_children: None,
            entity_bindings: Vec::new(),
            hooks: HookSet::default(),
            rel_ref_field: None,
            stop_on_error: false,
            can_be_root: false,
            can_be_deleted: true,
            can_be_renamed: true,
            can_be_moved: true,
            max_children: None,
        }
    }

    pub fn binding_for(&self, class: crate::model::EntityClass) -> Option<&EntityClassBinding> {
        self.entity_bindings.iter().find(|b| b.class() == class)
    }
}

/// The process-wide Node Type Registry.
pub struct NodeTypeRegistry {
    entries: RwLock<FxHashMap<NodeType, Arc<NodeTypeConfig>>>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers `config`, replacing any existing configuration for the
    /// same node type. Does not cascade to existing data.
    pub fn register(&self, config: NodeTypeConfig) {
        let node_type = config.node_type.clone();
        let mut entries = self.entries.write();
        let mut next: FxHashMap<NodeType, Arc<NodeTypeConfig>> = entries.clone();
        next.insert(node_type, Arc::new(config));
        *entries = next;
    }

    /// Removes a registration. Existing nodes/entities of this type are
    /// left untouched.
    pub fn unregister(&self, node_type: &str) {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        next.remove(node_type);
        *entries = next;
    }

    /// Looks up a registered type's configuration.
    pub fn get(&self, node_type: &str) -> Result<Arc<NodeTypeConfig>> {
        self.entries
            .read()
            .get(node_type)
            .cloned()
            .ok_or_else(|| ArborError::InvalidArgument(format!("unregistered node type: {node_type}")))
    }

    /// Snapshot of all registered types, for diagnostics.
    pub fn snapshot(&self) -> BTreeMap<NodeType, Arc<NodeTypeConfig>> {
        self.entries.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_existing_config() {
        let registry = NodeTypeRegistry::new();
        registry.register(NodeTypeConfig::new("folder"));
        assert!(!registry.get("folder").unwrap().can_be_root);

        let mut replacement = NodeTypeConfig::new("folder");
        replacement.can_be_root = true;
        registry.register(replacement);
        assert!(registry.get("folder").unwrap().can_be_root);
    }

    #[test]
    fn unregister_does_not_error_on_missing_type() {
        let registry = NodeTypeRegistry::new();
        registry.unregister("nonexistent");
    }

    #[test]
    fn lookup_of_unregistered_type_is_invalid_argument() {
        let registry = NodeTypeRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(ArborError::InvalidArgument(_))
        ));
    }
}
