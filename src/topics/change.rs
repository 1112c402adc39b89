//! Row-level change payload shared by the built-in topic kinds.

use serde::{Deserialize, Serialize};

/// One row change, as delivered by the database changefeed.
///
/// Wire shape: `{"eventType": "INSERT" | "UPDATE" | "DELETE", "new": {..}, "old": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "UPPERCASE")]
pub enum ChangeEvent<R> {
    /// A row was inserted.
    Insert {
        /// The inserted row.
        new: R,
    },
    /// A row was updated. `old` is present only when the table replicates full rows.
    Update {
        /// The row after the update.
        new: R,
        /// The row before the update, if replicated.
        old: Option<R>,
    },
    /// A row was deleted.
    Delete {
        /// The deleted row (often only its key columns).
        old: R,
    },
}

impl<R> ChangeEvent<R> {
    /// The most recent known version of the row.
    pub fn row(&self) -> &R {
        match self {
            ChangeEvent::Insert { new } | ChangeEvent::Update { new, .. } => new,
            ChangeEvent::Delete { old } => old,
        }
    }

    /// True for deletions.
    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeEvent::Delete { .. })
    }
}
