//! # Critiq Common Library
//!
//! Shared code for the Critiq pipeline stages including:
//! - Schema and label model (items, gold annotations, predictions, clusters)
//! - Run manifests and provenance records
//! - Run registry (SQLite)
//! - Configuration loading
//! - Hashing and timestamp utilities

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod hash;
pub mod jsonl;
pub mod manifest;
pub mod schema;
pub mod time;

pub use error::{Error, Result};
pub use manifest::{RunManifest, Stage};
pub use schema::{Label, PredictionRecord};
