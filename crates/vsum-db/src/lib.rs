//! Media store: the video table the pipeline reads and writes.
//!
//! This crate provides:
//! - The [`VideoRepository`] trait
//! - A PostgreSQL implementation (sqlx) with an embedded schema
//! - An in-memory implementation for tests

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryVideoRepository;
pub use postgres::{DbConfig, PgVideoRepository};
pub use repo::{Inserted, VideoRepository};
