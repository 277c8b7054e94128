//! Engine-wide configuration.
//!
//! Mirrors the teacher's `db::config::Config`: one explicitly
//! constructed value, no global statics, sensible defaults for every
//! field the spec names a default for.

use crate::model::OnNameConflict;

/// Construction-time configuration for an [`crate::engine::Engine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Per-subscriber bounded queue capacity (spec §4.9).
    pub subscriber_queue_capacity: usize,
    /// Lifecycle hook diagnostic event-log capacity (spec §4.7: "cap:
    /// last 1000").
    pub hook_event_log_capacity: usize,
    /// Maximum input nodes accepted by a single `pasteNodes`/
    /// `importNodes` call (spec §4.6: "caps at 1000 input nodes").
    pub max_batch_size: usize,
    /// Default `onNameConflict` policy applied when a command envelope
    /// doesn't specify one.
    pub default_on_name_conflict: OnNameConflict,
    /// Maximum depth of the undo stack before the oldest group is
    /// discarded.
    pub undo_stack_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
            hook_event_log_capacity: 1000,
            max_batch_size: crate::mutation::MAX_BATCH_SIZE,
            default_on_name_conflict: OnNameConflict::Error,
            undo_stack_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec_stated_values() {
        let config = EngineConfig::default();
        assert_eq!(config.hook_event_log_capacity, 1000);
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.default_on_name_conflict, OnNameConflict::Error);
    }
}
