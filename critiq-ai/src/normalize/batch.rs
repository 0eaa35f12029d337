//! Cluster ordering, batching and batch prompts

use crate::prompt::PromptTemplate;
use critiq_common::schema::{Cluster, ClusterKey, Taxonomy};
use critiq_common::Result;
use serde::Serialize;

/// Clusters sent together in one normalization call
#[derive(Debug, Clone)]
pub struct ClusterBatch<'a> {
    pub index: usize,
    pub clusters: Vec<&'a Cluster>,
}

impl ClusterBatch<'_> {
    pub fn keys(&self) -> Vec<ClusterKey> {
        self.clusters.iter().map(|c| c.key()).collect()
    }
}

/// Order by member count (descending), context id, cluster id
pub fn order_clusters(clusters: &[Cluster]) -> Vec<&Cluster> {
    let mut ordered: Vec<&Cluster> = clusters.iter().collect();
    ordered.sort_by(|a, b| {
        b.member_count
            .cmp(&a.member_count)
            .then_with(|| a.context_id.cmp(&b.context_id))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });
    ordered
}

/// Fixed-size batches of the ordered clusters; the last may be shorter
pub fn partition(clusters: &[Cluster], batch_size: usize) -> Vec<ClusterBatch<'_>> {
    order_clusters(clusters)
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| ClusterBatch {
            index,
            clusters: chunk.to_vec(),
        })
        .collect()
}

#[derive(Serialize)]
struct PromptCluster<'a> {
    context_id: &'a str,
    cluster_id: &'a str,
    summary: &'a str,
    member_count: usize,
}

/// Render a batch prompt with the taxonomy vocabulary
pub fn render_batch(template: &PromptTemplate, taxonomy: &Taxonomy, batch: &ClusterBatch<'_>) -> Result<String> {
    let vocabulary = taxonomy
        .families
        .iter()
        .map(|f| {
            if f.description.is_empty() {
                format!("- {}", f.label)
            } else {
                format!("- {}: {}", f.label, f.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let clusters = batch
        .clusters
        .iter()
        .map(|c| {
            serde_json::to_string(&PromptCluster {
                context_id: &c.context_id,
                cluster_id: &c.cluster_id,
                summary: &c.summary_text,
                member_count: c.member_count,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?
        .join("\n");

    Ok(template.render(|name| match name {
        "taxonomy_version" => taxonomy.version.as_str(),
        "taxonomy" => vocabulary.as_str(),
        "clusters" => clusters.as_str(),
        _ => "",
    }))
}
