//! Slot descriptors exchanged with the topology controller.

use crate::error::RoutingError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replication group identifier.
pub type GroupId = u32;

/// Fixed cardinality of the slot space. Every key deterministically
/// belongs to one of these slots.
pub const MAX_SLOT_NUM: usize = 1024;

/// Forwarding discipline installed on a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardKind {
    /// Await the migration probe before forwarding the real request.
    #[default]
    #[serde(rename = "sync")]
    Sync,

    /// Enqueue the probe and let its completion trigger the forward;
    /// dispatch itself never suspends on the probe.
    #[serde(rename = "semi-async")]
    SemiAsync,
}

impl ForwardKind {
    /// Parse a forwarding-kind tag as pushed by the controller.
    pub fn from_name(name: &str) -> Result<Self, RoutingError> {
        match name {
            "sync" => Ok(ForwardKind::Sync),
            "semi-async" => Ok(ForwardKind::SemiAsync),
            other => Err(RoutingError::InvalidMethod(other.to_string())),
        }
    }

    /// The controller-facing tag for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            ForwardKind::Sync => "sync",
            ForwardKind::SemiAsync => "semi-async",
        }
    }
}

impl fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Routing state of one slot, as pushed by the controller on fill and as
/// returned by snapshots.
///
/// An absent address means the binding is empty. A descriptor carrying
/// `migrate_from` must also carry `backend_addr`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub id: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_addr: Option<String>,

    #[serde(default)]
    pub backend_group: GroupId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_from: Option<String>,

    #[serde(default)]
    pub migrate_from_group: GroupId,

    /// Replica groups as lists of addresses; the outer order is the
    /// preference order used by replica selection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_groups: Vec<Vec<String>>,

    #[serde(default)]
    pub forward_method: ForwardKind,

    /// Leave the slot blocked after reconfiguration, awaiting a follow-up
    /// fill with `locked = false`.
    #[serde(default)]
    pub locked: bool,

    /// Snapshot-only: the slot's last reconfiguration was triggered by a
    /// master switch. Ignored on fill input.
    #[serde(default)]
    pub switched: bool,
}

impl SlotDescriptor {
    /// An empty descriptor for the given slot; filling with it unbinds
    /// everything.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Bind the primary backend.
    pub fn with_backend(mut self, addr: impl Into<String>, group: GroupId) -> Self {
        self.backend_addr = Some(addr.into());
        self.backend_group = group;
        self
    }

    /// Bind the migration source.
    pub fn with_migrate_from(mut self, addr: impl Into<String>, group: GroupId) -> Self {
        self.migrate_from = Some(addr.into());
        self.migrate_from_group = group;
        self
    }

    /// Append one replica group.
    pub fn with_replica_group(mut self, addrs: Vec<String>) -> Self {
        self.replica_groups.push(addrs);
        self
    }

    /// Select the forwarding discipline.
    pub fn with_forward_method(mut self, method: ForwardKind) -> Self {
        self.forward_method = method;
        self
    }

    /// Request a persistent lock after the fill.
    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_kind_tags_round_trip() {
        assert_eq!(ForwardKind::from_name("sync").unwrap(), ForwardKind::Sync);
        assert_eq!(
            ForwardKind::from_name("semi-async").unwrap(),
            ForwardKind::SemiAsync
        );
        assert_eq!(ForwardKind::Sync.name(), "sync");
        assert_eq!(ForwardKind::SemiAsync.name(), "semi-async");
    }

    #[test]
    fn unknown_forward_kind_is_invalid_method() {
        let err = ForwardKind::from_name("async").unwrap_err();
        assert_eq!(err, RoutingError::InvalidMethod("async".to_string()));
    }

    #[test]
    fn descriptor_json_shape() {
        let d = SlotDescriptor::new(7)
            .with_backend("10.0.0.2:6379", 2)
            .with_migrate_from("10.0.0.1:6379", 1)
            .with_replica_group(vec!["10.0.0.3:6379".to_string()])
            .with_forward_method(ForwardKind::SemiAsync);

        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"semi-async\""));
        let back: SlotDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn descriptor_defaults_fill_in() {
        let d: SlotDescriptor = serde_json::from_str(r#"{"id": 3}"#).unwrap();
        assert_eq!(d.id, 3);
        assert!(d.backend_addr.is_none());
        assert_eq!(d.forward_method, ForwardKind::Sync);
        assert!(!d.locked);
    }
}
