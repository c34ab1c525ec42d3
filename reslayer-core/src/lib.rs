//! A resource layer over JSON document stores.
//!
//! This crate is the core of the reslayer project and provides:
//!
//! - **Store backend abstraction** ([`backend`]) - Traits for document stores and their transactions
//! - **Query and update API** ([`query`]) - Filter, query and update construction and parsing
//! - **Access policy** ([`policy`]) - Per-collection reachability, events and field allow-lists
//! - **Transform pipeline** ([`transform`], [`secret`]) - Path-based coercion of request documents
//! - **Document gateway** ([`gateway`]) - CRUD primitives enforcing the server-side write rules
//! - **Change events** ([`event`]) - Publication of change records to an event log
//! - **Staged transactions** ([`staging`], [`transaction`], [`operation`]) - Cross-request transactions
//! - **Resource service** ([`service`]) - The entry point tying everything together
//! - **Settings** ([`settings`]) - Layered file and environment configuration
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use reslayer_core::transform::{CoercionKind, TransformRules};
//! use bson::doc;
//!
//! let rules = TransformRules::new().rule("owner", CoercionKind::Oid);
//!
//! let txn = service.begin().await?;
//! service.create("orders", doc! { "owner": "64b7f0c2a1b2c3d4e5f60718" }, &rules, Some(&txn)).await?;
//! service.update("stock", doc! { "sku": "A1" }, doc! { "$inc": { "count": -1 } }, &rules, Some(&txn)).await?;
//! let outcomes = service.commit(&txn).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as reslayer_core;

pub mod backend;
pub mod error;
pub mod event;
pub mod gateway;
pub mod operation;
pub mod policy;
pub mod query;
pub mod secret;
pub mod service;
pub mod settings;
pub mod staging;
pub mod transaction;
pub mod transform;
