//! Convenient re-exports of commonly used types from reslayer.
//!
//! ```ignore
//! use reslayer::prelude::*;
//! ```

pub use reslayer_core::{
    backend::{StoreBackend, StoreBackendBuilder, StoreOps, StoreTransaction, UpdateCounts},
    error::{ResourceError, ResourceResult},
    event::{ChangeEvent, EventPublisher, EventSink},
    gateway::DocumentGateway,
    operation::{Action, PendingOperation, WriteOutcome},
    policy::{CollectionPolicy, PolicyStore, PolicyTable},
    query::{Expr, FieldOp, Filter, Query, QueryBuilder, Sort, SortDirection, Update},
    service::{Execution, FindRequest, ResourceService},
    settings::Settings,
    staging::StagingLog,
    transaction::{TransactionCoordinator, TxnId},
    transform::{CoercionKind, TransformRules, Transformer},
};
