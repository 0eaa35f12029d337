//! Context-level clusters and global issue instances

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identity of a context-level cluster
///
/// `cluster_id` is only unique within its `context_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub context_id: String,
    pub cluster_id: String,
}

impl ClusterKey {
    pub fn new(context_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            cluster_id: cluster_id.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context_id, self.cluster_id)
    }
}

/// Group of accepted items within one context
///
/// Members may also appear in other clusters of the same context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ClusterRow")]
pub struct Cluster {
    pub cluster_id: String,
    pub context_id: String,
    pub summary_text: String,
    pub member_item_ids: BTreeSet<String>,
    /// Always equal to `member_item_ids.len()`
    pub member_count: usize,
}

impl Cluster {
    pub fn new(
        context_id: impl Into<String>,
        cluster_id: impl Into<String>,
        summary_text: impl Into<String>,
        member_item_ids: BTreeSet<String>,
    ) -> Self {
        let member_count = member_item_ids.len();
        Self {
            cluster_id: cluster_id.into(),
            context_id: context_id.into(),
            summary_text: summary_text.into(),
            member_item_ids,
            member_count,
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(&self.context_id, &self.cluster_id)
    }
}

#[derive(Deserialize)]
struct ClusterRow {
    cluster_id: String,
    context_id: String,
    summary_text: String,
    member_item_ids: BTreeSet<String>,
    member_count: usize,
}

impl TryFrom<ClusterRow> for Cluster {
    type Error = String;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        if row.member_count != row.member_item_ids.len() {
            return Err(format!(
                "cluster {}/{} reports {} members but lists {}",
                row.context_id,
                row.cluster_id,
                row.member_count,
                row.member_item_ids.len()
            ));
        }
        Ok(Cluster::new(
            row.context_id,
            row.cluster_id,
            row.summary_text,
            row.member_item_ids,
        ))
    }
}

/// Cross-context theme produced by normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalIssueInstance {
    pub global_id: String,
    pub taxonomy_label: String,
    pub taxonomy_version: String,
    /// True when the label is not one of the taxonomy families
    pub is_new_label: bool,
    pub description: String,
    pub member_cluster_keys: BTreeSet<ClusterKey>,
    pub cluster_count: usize,
    /// Sum of member cluster sizes (items in several clusters count repeatedly)
    pub item_mentions: usize,
    pub distinct_item_count: usize,
    pub context_count: usize,
    pub source_batches: BTreeSet<usize>,
}

/// Why a cluster key ended up outside every global group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// The service explicitly listed the key as unassigned
    DeclinedByService,
    /// The service response did not mention the key
    OmittedByService,
    BatchServiceFailure,
    BatchParseError,
    BatchSchemaError,
    /// The stage deadline passed before the batch was sent
    BatchSkipped,
    /// Caught by the final coverage pass
    NotFoundInAnyGroup,
}

/// Cluster key outside every global group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedCluster {
    pub key: ClusterKey,
    pub reason: UnassignedReason,
    pub batch_index: Option<usize>,
    pub taxonomy_version: String,
}
