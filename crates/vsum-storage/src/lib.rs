//! Object storage for uploaded media.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait (put/get/bucket checks)
//! - An S3-compatible client for MinIO, R2 and AWS
//! - An in-memory store for tests
//! - Collision-free object key generation

pub mod client;
pub mod error;
pub mod key;
pub mod memory;
pub mod store;

pub use client::{S3Config, S3ObjectStore};
pub use error::{StorageError, StorageResult};
pub use key::generate_object_key;
pub use memory::MemoryObjectStore;
pub use store::ObjectStore;
