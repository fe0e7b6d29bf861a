//! Identifier generation
//!
//! Client tokens and node-name suffixes come from an [`IdSource`] so tests
//! can pin them.

use crate::model::MachineRole;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Length of the random suffix in generated node names
pub const NODE_SUFFIX_LEN: usize = 4;

/// Source of fresh identifiers
pub trait IdSource: Send + Sync {
    /// A new, unique identifier
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic identifiers: `0001-<prefix>`, `0002-<prefix>`, ...
#[derive(Debug, Default)]
pub struct SequenceSource {
    prefix: String,
    counter: AtomicU64,
}

impl SequenceSource {
    /// Create a sequence with a fixed tail
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdSource for SequenceSource {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{:04}-{}", n, self.prefix)
    }
}

/// First [`NODE_SUFFIX_LEN`] alphanumeric characters of an identifier
pub fn short_suffix(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(NODE_SUFFIX_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// Node name: `<cluster>-<role>-<suffix>`
pub fn make_node_name(cluster_name: &str, suffix: &str, role: MachineRole) -> String {
    format!("{}-{}-{}", cluster_name, role.as_str(), suffix)
}

/// Fresh node name drawing its suffix from `ids`
pub fn generate_node_name(ids: &dyn IdSource, cluster_name: &str, role: MachineRole) -> String {
    make_node_name(cluster_name, &short_suffix(&ids.next_id()), role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_deterministic() {
        let ids = SequenceSource::new("token");
        assert_eq!(ids.next_id(), "0001-token");
        assert_eq!(ids.next_id(), "0002-token");
    }

    #[test]
    fn test_short_suffix_skips_separators() {
        assert_eq!(short_suffix("3F-2a9c-11ee"), "3f2a");
        assert_eq!(short_suffix("ab"), "ab");
    }

    #[test]
    fn test_generated_names() {
        let ids = SequenceSource::new("x");
        assert_eq!(generate_node_name(&ids, "prod", MachineRole::Node), "prod-node-0001");
        assert_eq!(generate_node_name(&ids, "prod", MachineRole::Master), "prod-master-0002");
    }

    #[test]
    fn test_uuid_source_is_unique() {
        let ids = UuidSource;
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert_eq!(short_suffix(&a).len(), NODE_SUFFIX_LEN);
    }
}
