//! Run registry database
//!
//! A single `registry.db` in the root folder records every run directory so
//! downstream stages can resolve an upstream run by its id.

pub mod registry;

pub use registry::{init_registry_pool, RegistryEntry, Registry, REGISTRY_FILE};
