//! Session labels.
//!
//! Every container created by a provider carries the same two labels: a
//! managed-by marker and the owning session's identifier. The reaper sidecar
//! receives the exact same pairs as its filter, so both uses are derived
//! from [`labels_for`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace for all labels managed by this crate.
pub const LABEL_NAMESPACE: &str = "org.testbox";

/// Marker label present (set to `"true"`) on every managed container.
pub const LABEL_MANAGED: &str = LABEL_NAMESPACE;

/// Label carrying the owning session's identifier.
pub const LABEL_SESSION_ID: &str = "org.testbox.sessionId";

/// Label map attached to containers. Ordered so filters serialize deterministically.
pub type Labels = BTreeMap<String, String>;

/// Identifier of one provider lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Labels identifying resources owned by `session`.
pub fn labels_for(session: &SessionId) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_SESSION_ID.to_string(), session.to_string());
    labels
}

/// Merge caller-supplied labels with the session labels.
///
/// Extra labels are additive; the session keys always win.
pub fn merge_labels(session: &SessionId, extra: &Labels) -> Labels {
    let mut merged = extra.clone();
    merged.extend(labels_for(session));
    merged
}

/// Serialize labels as a reaper filter line body: `label=k=v&label=k=v`.
pub fn filter_expression(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("label={}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}
