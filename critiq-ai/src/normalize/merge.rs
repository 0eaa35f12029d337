//! Cross-batch merge and the final coverage pass

use super::validate::ProposedGroup;
use super::NormalizationError;
use critiq_common::schema::{
    normalize_label, Cluster, ClusterKey, GlobalIssueInstance, Taxonomy, UnassignedCluster, UnassignedReason,
};
use std::collections::{BTreeMap, BTreeSet};

struct MergedGroup {
    label: String,
    is_new_label: bool,
    description: String,
    members: BTreeSet<ClusterKey>,
    source_batches: BTreeSet<usize>,
}

/// Merge groups of every successful batch by normalized label
///
/// `groups` is in batch order; the first description seen for a label wins,
/// falling back to the taxonomy family's description.
pub fn merge_groups(
    taxonomy: &Taxonomy,
    groups: &[(usize, ProposedGroup)],
    clusters: &BTreeMap<ClusterKey, &Cluster>,
) -> Result<Vec<GlobalIssueInstance>, NormalizationError> {
    let mut merged: BTreeMap<String, MergedGroup> = BTreeMap::new();
    let mut owner: BTreeMap<ClusterKey, String> = BTreeMap::new();

    for (batch_index, group) in groups {
        let (label, is_new_label, family_description) = match taxonomy.resolve(&group.label) {
            Some(family) => (family.label.clone(), false, family.description.clone()),
            None => (group.label.split_whitespace().collect::<Vec<_>>().join(" "), true, String::new()),
        };
        let merge_key = normalize_label(&label);

        for key in &group.members {
            if let Some(previous) = owner.insert(key.clone(), merge_key.clone()) {
                if previous != merge_key {
                    return Err(NormalizationError::DuplicateAssignment { key: key.clone() });
                }
            }
        }

        let entry = merged.entry(merge_key).or_insert_with(|| MergedGroup {
            label,
            is_new_label,
            description: String::new(),
            members: BTreeSet::new(),
            source_batches: BTreeSet::new(),
        });
        if entry.description.is_empty() {
            entry.description = if group.description.is_empty() {
                family_description
            } else {
                group.description.clone()
            };
        }
        entry.members.extend(group.members.iter().cloned());
        entry.source_batches.insert(*batch_index);
    }

    let mut ordered: Vec<(String, MergedGroup)> = merged.into_iter().collect();
    ordered.sort_by(|(ka, a), (kb, b)| b.members.len().cmp(&a.members.len()).then_with(|| ka.cmp(kb)));

    let mut instances = Vec::with_capacity(ordered.len());
    for (position, (_, group)) in ordered.into_iter().enumerate() {
        let mut item_mentions = 0;
        let mut items = BTreeSet::new();
        let mut contexts = BTreeSet::new();
        for key in &group.members {
            let cluster = clusters
                .get(key)
                .ok_or_else(|| NormalizationError::ForeignAssignment { key: key.clone() })?;
            item_mentions += cluster.member_count;
            items.extend(cluster.member_item_ids.iter().cloned());
            contexts.insert(key.context_id.clone());
        }
        instances.push(GlobalIssueInstance {
            global_id: format!("G{:04}", position + 1),
            taxonomy_label: group.label,
            taxonomy_version: taxonomy.version.clone(),
            is_new_label: group.is_new_label,
            description: group.description,
            cluster_count: group.members.len(),
            member_cluster_keys: group.members,
            item_mentions,
            distinct_item_count: items.len(),
            context_count: contexts.len(),
            source_batches: group.source_batches,
        });
    }
    Ok(instances)
}

/// Enforce exclusivity and total coverage over the input key set
///
/// Keys in neither an instance nor `unassigned` are added with
/// `not_found_in_any_group`. The result is sorted by key.
pub fn enforce_coverage(
    input: &BTreeSet<ClusterKey>,
    instances: &[GlobalIssueInstance],
    mut unassigned: Vec<UnassignedCluster>,
    taxonomy_version: &str,
) -> Result<Vec<UnassignedCluster>, NormalizationError> {
    let mut seen: BTreeSet<&ClusterKey> = BTreeSet::new();
    let keys = instances
        .iter()
        .flat_map(|i| i.member_cluster_keys.iter())
        .chain(unassigned.iter().map(|u| &u.key));
    for key in keys {
        if !input.contains(key) {
            return Err(NormalizationError::ForeignAssignment { key: key.clone() });
        }
        if !seen.insert(key) {
            return Err(NormalizationError::DuplicateAssignment { key: key.clone() });
        }
    }

    let missing: Vec<ClusterKey> = input.iter().filter(|k| !seen.contains(k)).cloned().collect();
    for key in missing {
        tracing::warn!(cluster = %key, "Cluster key not found in any group");
        unassigned.push(UnassignedCluster {
            key,
            reason: UnassignedReason::NotFoundInAnyGroup,
            batch_index: None,
            taxonomy_version: taxonomy_version.to_string(),
        });
    }
    unassigned.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(unassigned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> Taxonomy {
        Taxonomy::from_toml_str(
            "version = \"v2\"\n[[families]]\nlabel = \"Assessment & Grading\"\ndescription = \"exams\"\n",
        )
        .unwrap()
    }

    fn cluster(context: &str, id: &str, members: &[&str]) -> Cluster {
        Cluster::new(context, id, "s", members.iter().map(|m| m.to_string()).collect())
    }

    fn group(label: &str, keys: &[(&str, &str)]) -> ProposedGroup {
        ProposedGroup {
            label: label.to_string(),
            description: String::new(),
            members: keys.iter().map(|(c, k)| ClusterKey::new(*c, *k)).collect(),
        }
    }

    #[test]
    fn test_merge_across_batches_by_normalized_label() {
        let clusters = vec![
            cluster("A", "A-1", &["x", "y"]),
            cluster("B", "B-1", &["y", "z"]),
            cluster("B", "B-2", &["w"]),
        ];
        let index: BTreeMap<ClusterKey, &Cluster> = clusters.iter().map(|c| (c.key(), c)).collect();
        let groups = vec![
            (0, group("assessment  & GRADING", &[("A", "A-1")])),
            (1, group("Assessment & Grading", &[("B", "B-1")])),
            (1, group("Room temperature", &[("B", "B-2")])),
        ];
        let instances = merge_groups(&taxonomy(), &groups, &index).unwrap();
        assert_eq!(instances.len(), 2);

        let grading = &instances[0];
        assert_eq!(grading.global_id, "G0001");
        assert_eq!(grading.taxonomy_label, "Assessment & Grading");
        assert!(!grading.is_new_label);
        assert_eq!(grading.description, "exams");
        assert_eq!(grading.cluster_count, 2);
        assert_eq!(grading.item_mentions, 4);
        assert_eq!(grading.distinct_item_count, 3);
        assert_eq!(grading.context_count, 2);
        assert_eq!(grading.source_batches, [0, 1].into_iter().collect());

        assert!(instances[1].is_new_label);
        assert_eq!(instances[1].taxonomy_version, "v2");
    }

    #[test]
    fn test_coverage_adds_missing_and_rejects_duplicates() {
        let input: BTreeSet<ClusterKey> = [ClusterKey::new("A", "A-1"), ClusterKey::new("A", "A-2")].into_iter().collect();
        let unassigned = enforce_coverage(&input, &[], Vec::new(), "v2").unwrap();
        assert_eq!(unassigned.len(), 2);
        assert!(unassigned.iter().all(|u| u.reason == UnassignedReason::NotFoundInAnyGroup));

        let twice = vec![
            UnassignedCluster {
                key: ClusterKey::new("A", "A-1"),
                reason: UnassignedReason::DeclinedByService,
                batch_index: Some(0),
                taxonomy_version: "v2".into(),
            };
            2
        ];
        assert!(matches!(
            enforce_coverage(&input, &[], twice, "v2"),
            Err(NormalizationError::DuplicateAssignment { .. })
        ));
    }
}
