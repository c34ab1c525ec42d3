//! Write operations and their outcomes.
//!
//! A [`PendingOperation`] is a fully validated and transformed write, ready to run either
//! immediately or later as part of a staged transaction. Staged operations are stored as
//! BSON, so every variant carries only serializable data.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::query::{Expr, Update};

/// Kind of a write, as reported in change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    BulkCreate,
    Update,
    Replace,
    Delete,
    BulkDelete,
    Sort,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::BulkCreate => "bulk_create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Delete => "delete",
            Action::BulkDelete => "bulk_delete",
            Action::Sort => "sort",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write captured for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOperation {
    Create {
        collection: String,
        document: Document,
    },
    BulkCreate {
        collection: String,
        documents: Vec<Document>,
    },
    /// Update every document matching `filter`; `None` matches all.
    Update {
        collection: String,
        filter: Option<Expr>,
        update: Update,
    },
    UpdateById {
        collection: String,
        id: Bson,
        update: Update,
    },
    Replace {
        collection: String,
        id: Bson,
        document: Document,
    },
    Delete {
        collection: String,
        id: Bson,
    },
    /// Delete every deletable document matching `filter`; `None` matches all.
    BulkDelete {
        collection: String,
        filter: Option<Expr>,
    },
    /// Set `key` on each listed document to its position in `ids`.
    Sort {
        collection: String,
        key: String,
        ids: Vec<Bson>,
    },
}

impl PendingOperation {
    pub fn collection(&self) -> &str {
        match self {
            PendingOperation::Create { collection, .. }
            | PendingOperation::BulkCreate { collection, .. }
            | PendingOperation::Update { collection, .. }
            | PendingOperation::UpdateById { collection, .. }
            | PendingOperation::Replace { collection, .. }
            | PendingOperation::Delete { collection, .. }
            | PendingOperation::BulkDelete { collection, .. }
            | PendingOperation::Sort { collection, .. } => collection,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            PendingOperation::Create { .. } => Action::Create,
            PendingOperation::BulkCreate { .. } => Action::BulkCreate,
            PendingOperation::Update { .. } | PendingOperation::UpdateById { .. } => Action::Update,
            PendingOperation::Replace { .. } => Action::Replace,
            PendingOperation::Delete { .. } => Action::Delete,
            PendingOperation::BulkDelete { .. } => Action::BulkDelete,
            PendingOperation::Sort { .. } => Action::Sort,
        }
    }
}

/// Result of one executed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted { id: Bson },
    InsertedMany { ids: Vec<Bson> },
    Updated { matched: u64, modified: u64 },
    Deleted { deleted: u64 },
}
