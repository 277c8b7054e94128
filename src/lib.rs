//! # arbor - embeddable tree-store engine
//!
//! arbor is a library for applications that model their domain as one or
//! more named trees of typed nodes: a filesystem-like hierarchy, a layer
//! panel, a scene graph, a document outline. It provides the pieces such
//! an application otherwise reinvents every time — stable node identity,
//! pluggable per-node-type entity bodies, copy-on-write editing sessions
//! with optimistic concurrency, move/duplicate/trash/paste mutations with
//! cycle detection, ordered lifecycle hooks, command-level undo/redo, and
//! change subscriptions — behind a single [`Engine`] value.
//!
//! ## Quick start
//!
//! ```rust
//! use arbor::{CommandEnvelope, CommandKind, Engine, EngineConfig};
//! use serde_json::json;
//!
//! let engine = Engine::with_default_registry(EngineConfig::default());
//! let tree = engine.create_tree("Workspace").unwrap();
//!
//! let outcome = engine
//!     .submit(CommandEnvelope {
//!         command_id: "cmd-1".into(),
//!         group_id: "g-1".into(),
//!         kind: CommandKind::CreateNode,
//!         payload: json!({
//!             "treeId": tree.id,
//!             "parentId": tree.root_id,
//!             "nodeType": "folder",
//!             "name": "Docs",
//!         }),
//!         issued_at: 0,
//!     })
//!     .unwrap();
//! assert!(outcome.node_id.is_some());
//! ```
//!
//! ## Architecture
//!
//! arbor is organized around the same split its specification draws
//! between durability tiers and subsystem responsibilities:
//! - [`store`] — the Core Store (durable) and Ephemeral Store (session-
//!   scoped working copies and staged entity bodies).
//! - [`entities`] — CRUD and cleanup for the four entity classifications
//!   a node type can attach: Peer, Group, Relational, Ephemeral.
//! - [`workingcopy`] — the copy-on-write Working-Copy Protocol:
//!   draft/edit sessions, staged edits, optimistic-concurrency commit.
//! - [`mutation`] — the Tree Mutation Service: move, duplicate, trash,
//!   recover, remove, paste, import.
//! - [`lifecycle`] — the Lifecycle Manager: ordered before/after hooks
//!   per node type and Relational reference-count accounting.
//! - [`command`] — the Command Processor: idempotent dispatch, sequence
//!   numbering, and the undo/redo stack.
//! - [`subscribe`] — the Subscribe Service: bounded, ordered change
//!   notification fan-out, scoped to a node or a subtree.
//! - [`engine`] — [`Engine`], the single value tying every subsystem
//!   together behind `submit`/`subscribeNode`/`subscribeSubtree`/
//!   `undo`/`redo`.

pub mod command;
pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod model;
pub mod mutation;
pub mod registry;
pub mod store;
pub mod subscribe;
pub mod workingcopy;

// Re-export the main public API.
pub use crate::command::{ApplyContext, CommandProcessor, InverseOp, UndoGroup};
pub use crate::config::EngineConfig;
pub use crate::engine::Engine;
pub use crate::entities::EntityClassBinding;
pub use crate::error::{ArborError, Result};
pub use crate::ids::{EntityId, IdGenerator, NodeId, TreeId, WorkingCopyId};
pub use crate::lifecycle::{HookContext, HookPhase, LifecycleManager};
pub use crate::model::{
    now_millis, ChangeEvent, ChangeKind, CommandEnvelope, CommandKind, EntityClass, EphemeralEntity,
    GroupEntity, Millis, Node, NodeType, OnNameConflict, PeerEntity, RelationalDelta, RelationalEntity,
    SubmitOutcome, Tree, WorkingCopy,
};
pub use crate::registry::{HookSet, NodeTypeConfig, NodeTypeRegistry};
pub use crate::store::{CoreStore, EphemeralStore};
pub use crate::subscribe::{Delivery, GapNotification, SubscribeService, Subscription};
