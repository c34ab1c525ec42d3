//! MongoDB backend implementation for reslayer.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait.
//! Filters and updates are rendered to native MongoDB documents and run by the server.
//! Transactions are client-session transactions with majority read and write concerns.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! reslayer = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! Multi-document transactions need a replica set or a sharded cluster.
//!
//! # Example
//!
//! ```ignore
//! use reslayer::{backend::StoreBackendBuilder, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017/?replicaSet=rs0", "app")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as reslayer_mongodb;

mod query;
pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder, MongoDbTransaction};
