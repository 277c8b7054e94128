//! The Lifecycle Manager: ordered before/after hook dispatch and
//! reference-count accounting on Relational links (spec §4.7).
//!
//! ```text
//! beforeCreate → (perform write) → [refcount increment] → afterCreate
//! beforeUpdate → (perform write) → afterUpdate
//! beforeDelete → [refcount decrement] → (perform write) → afterDelete
//! beforeMove   → (perform write) → afterMove
//! ```
//!
//! Default error policy is "continue": a failing hook is recorded in
//! the bounded event log but does not abort the operation. A node type
//! opting into `stopOnError` aborts on a failing `before*` hook and
//! propagates the error; a failing `after*` hook under `stopOnError` is
//! still only recorded — the write has already committed and this
//! crate does not roll it back (spec §4.7, §7).

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::ids::{EntityId, NodeId};
use crate::model::{now_millis, Millis, Node};
use crate::registry::{Hook, NodeTypeConfig};
use crate::store::CoreStore;

/// The operation phase a hook was invoked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookPhase {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeMove,
    AfterMove,
}

/// What a hook is told about the operation in flight.
pub struct HookContext {
    pub phase: HookPhase,
    pub node: Node,
    pub previous: Option<Node>,
}

/// One entry in the bounded diagnostic event log.
#[derive(Clone, Debug)]
pub struct HookEvent {
    pub node_id: NodeId,
    pub node_type: String,
    pub phase: HookPhase,
    pub ok: bool,
    pub error: Option<String>,
    pub at: Millis,
}

/// Dispatches lifecycle hooks and performs reference-count accounting.
pub struct LifecycleManager {
    event_log: Mutex<VecDeque<HookEvent>>,
    event_log_capacity: usize,
}

impl LifecycleManager {
    pub fn new(event_log_capacity: usize) -> Self {
        Self {
            event_log: Mutex::new(VecDeque::with_capacity(event_log_capacity.min(1024))),
            event_log_capacity,
        }
    }

    fn record(&self, event: HookEvent) {
        if !event.ok {
            warn!(node_id = %event.node_id, phase = ?event.phase, error = ?event.error, "lifecycle hook failed");
        }
        let mut log = self.event_log.lock();
        if log.len() >= self.event_log_capacity {
            log.pop_front();
        }
        log.push_back(event);
    }

    /// Snapshot of the last (up to) 1000 hook invocations, most recent last.
    pub fn event_log_snapshot(&self) -> Vec<HookEvent> {
        self.event_log.lock().iter().cloned().collect()
    }

    fn run(&self, hook: &Hook, config: &NodeTypeConfig, ctx: HookContext) -> Result<()> {
        let phase = ctx.phase;
        let node_id = ctx.node.id.clone();
        let node_type = ctx.node.node_type.clone();
        let result = hook(&ctx);
        match &result {
            Ok(()) => self.record(HookEvent {
                node_id,
                node_type,
                phase,
                ok: true,
                error: None,
                at: now_millis(),
            }),
            Err(e) => self.record(HookEvent {
                node_id,
                node_type,
                phase,
                ok: false,
                error: Some(e.to_string()),
                at: now_millis(),
            }),
        }
        let is_before = matches!(
            phase,
            HookPhase::BeforeCreate | HookPhase::BeforeUpdate | HookPhase::BeforeDelete | HookPhase::BeforeMove
        );
        if result.is_err() && is_before && config.stop_on_error {
            return result;
        }
        Ok(())
    }

    /// Runs `beforeCreate` if configured. A failure aborts the create
    /// when `config.stop_on_error`, otherwise is recorded only.
    pub fn before_create(&self, config: &NodeTypeConfig, node: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.before_create {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::BeforeCreate,
                    node: node.clone(),
                    previous: None,
                },
            )?;
        }
        Ok(())
    }

    /// Runs the reference-count increment (if `rel_ref_field` is set)
    /// then `afterCreate`.
    pub fn after_create(
        &self,
        config: &NodeTypeConfig,
        store: &CoreStore,
        node: &Node,
        rel_entity_id: Option<&EntityId>,
    ) -> Result<()> {
        if config.rel_ref_field.is_some() {
            if let Some(entity_id) = rel_entity_id {
                crate::entities::relational::add_reference(store, entity_id, &node.id);
            }
        }
        if let Some(hook) = &config.hooks.after_create {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::AfterCreate,
                    node: node.clone(),
                    previous: None,
                },
            )?;
        }
        Ok(())
    }

    pub fn before_update(&self, config: &NodeTypeConfig, node: &Node, previous: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.before_update {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::BeforeUpdate,
                    node: node.clone(),
                    previous: Some(previous.clone()),
                },
            )?;
        }
        Ok(())
    }

    pub fn after_update(&self, config: &NodeTypeConfig, node: &Node, previous: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.after_update {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::AfterUpdate,
                    node: node.clone(),
                    previous: Some(previous.clone()),
                },
            )?;
        }
        Ok(())
    }

    pub fn before_delete(&self, config: &NodeTypeConfig, node: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.before_delete {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::BeforeDelete,
                    node: node.clone(),
                    previous: None,
                },
            )?;
        }
        Ok(())
    }

    /// Runs the reference-count decrement (if `rel_ref_field` is set)
    /// then `afterDelete`. Spec order places the decrement before the
    /// physical delete but after `beforeDelete`; the caller is
    /// responsible for performing the store delete between this call
    /// and `after_delete`, matching the documented hook order.
    pub fn decrement_reference(&self, config: &NodeTypeConfig, store: &CoreStore, node: &Node, rel_entity_id: Option<&EntityId>) {
        if config.rel_ref_field.is_some() {
            if let Some(entity_id) = rel_entity_id {
                crate::entities::relational::remove_reference(store, entity_id, &node.id);
            }
        }
    }

    pub fn after_delete(&self, config: &NodeTypeConfig, node: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.after_delete {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::AfterDelete,
                    node: node.clone(),
                    previous: None,
                },
            )?;
        }
        Ok(())
    }

    pub fn before_move(&self, config: &NodeTypeConfig, node: &Node, previous: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.before_move {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::BeforeMove,
                    node: node.clone(),
                    previous: Some(previous.clone()),
                },
            )?;
        }
        Ok(())
    }

    pub fn after_move(&self, config: &NodeTypeConfig, node: &Node, previous: &Node) -> Result<()> {
        if let Some(hook) = &config.hooks.after_move {
            self.run(
                hook,
                config,
                HookContext {
                    phase: HookPhase::AfterMove,
                    node: node.clone(),
                    previous: Some(previous.clone()),
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TreeId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_node() -> Node {
        Node {
            id: NodeId::new("n1"),
            tree_id: TreeId::new("t1"),
            parent_id: NodeId::new("t1Root"),
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
        }
    }

    #[test]
    fn failing_before_hook_continues_by_default() {
        let manager = LifecycleManager::new(1000);
        let mut config = NodeTypeConfig::new("folder");
        config.hooks.before_create = Some(Arc::new(|_ctx| {
            Err(crate::error::ArborError::InvalidArgument("boom".into()))
        }));
        assert!(manager.before_create(&config, &sample_node()).is_ok());
        assert_eq!(manager.event_log_snapshot().len(), 1);
        assert!(!manager.event_log_snapshot()[0].ok);
    }

    #[test]
    fn failing_before_hook_aborts_under_stop_on_error() {
        let manager = LifecycleManager::new(1000);
        let mut config = NodeTypeConfig::new("folder");
        config.stop_on_error = true;
        config.hooks.before_create = Some(Arc::new(|_ctx| {
            Err(crate::error::ArborError::InvalidArgument("boom".into()))
        }));
        assert!(manager.before_create(&config, &sample_node()).is_err());
    }

    #[test]
    fn event_log_is_capped() {
        let manager = LifecycleManager::new(3);
        let mut config = NodeTypeConfig::new("folder");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        config.hooks.after_create = Some(Arc::new(move |_ctx| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let store = CoreStore::new();
        for _ in 0..5 {
            manager.after_create(&config, &store, &sample_node(), None).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(manager.event_log_snapshot().len(), 3);
    }
}
