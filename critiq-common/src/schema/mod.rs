//! Schema and label model
//!
//! Record types shared by every stage. Types whose invariants matter
//! downstream (predictions, clusters) normalize or validate themselves on
//! deserialization so a hand-edited table cannot smuggle an invalid row
//! past a stage boundary.

pub mod cluster;
pub mod item;
pub mod label;
pub mod prediction;
pub mod taxonomy;

pub use cluster::{
    Cluster, ClusterKey, GlobalIssueInstance, UnassignedCluster, UnassignedReason,
};
pub use item::{token_count, GoldAnnotation, Item};
pub use label::Label;
pub use prediction::{PredictionFlags, PredictionRecord};
pub use taxonomy::{normalize_label, Taxonomy, TaxonomyFamily};
