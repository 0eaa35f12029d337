//! Validation of a clustering response against its input set

use crate::parse::fields::{optional_count, required_array, required_string, Object};
use critiq_common::schema::Cluster;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// Validate every cluster of a response; any violation rejects all of them
pub fn validate_clusters(
    context_id: &str,
    input: &BTreeSet<String>,
    obj: &Object,
) -> Result<Vec<Cluster>, Vec<String>> {
    let mut violations = Vec::new();

    let entries = match required_array(obj, "clusters") {
        Ok(entries) => entries,
        Err(v) => return Err(vec![v]),
    };

    let mut clusters = Vec::with_capacity(entries.len());
    let mut seen_ids = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let Value::Object(entry) = entry else {
            violations.push(format!("clusters[{}] is not an object", index));
            continue;
        };
        let before = violations.len();

        let cluster_id = match required_string(entry, "cluster_id") {
            Ok(id) => id.trim(),
            Err(v) => {
                violations.push(format!("clusters[{}]: {}", index, v));
                ""
            }
        };
        if !cluster_id.is_empty() {
            if !cluster_id.starts_with(context_id) {
                violations.push(format!(
                    "cluster id '{}' is not prefixed by context '{}'",
                    cluster_id, context_id
                ));
            }
            if !seen_ids.insert(cluster_id.to_string()) {
                violations.push(format!("cluster id '{}' appears more than once", cluster_id));
            }
        }

        let summary = match required_string(entry, "summary") {
            Ok(s) if s.trim().is_empty() => {
                violations.push(format!("clusters[{}]: empty summary", index));
                ""
            }
            Ok(s) => s.trim(),
            Err(v) => {
                violations.push(format!("clusters[{}]: {}", index, v));
                ""
            }
        };

        let mut members = BTreeSet::new();
        match required_array(entry, "member_item_ids") {
            Ok(raw_members) => {
                for member in raw_members {
                    match member {
                        Value::String(id) if input.contains(id) => {
                            members.insert(id.clone());
                        }
                        Value::String(id) => violations.push(format!(
                            "clusters[{}]: member '{}' is not an accepted item of this context",
                            index, id
                        )),
                        _ => violations.push(format!("clusters[{}]: member ids must be strings", index)),
                    }
                }
                if raw_members.is_empty() {
                    violations.push(format!("clusters[{}]: no members", index));
                }
            }
            Err(v) => violations.push(format!("clusters[{}]: {}", index, v)),
        }

        match optional_count(entry, "member_count") {
            Ok(Some(reported)) if reported as usize != members.len() => violations.push(format!(
                "clusters[{}]: member_count {} but {} distinct members",
                index,
                reported,
                members.len()
            )),
            Ok(_) => {}
            Err(v) => violations.push(format!("clusters[{}]: {}", index, v)),
        }

        if violations.len() == before {
            clusters.push(Cluster::new(context_id, cluster_id, summary, members));
        }
    }

    let covered: BTreeSet<&String> = clusters.iter().flat_map(|c| c.member_item_ids.iter()).collect();
    match optional_count(obj, "unique_member_count") {
        Ok(Some(reported)) if violations.is_empty() && reported as usize != covered.len() => {
            violations.push(format!(
                "unique_member_count {} but {} distinct items are clustered",
                reported,
                covered.len()
            ))
        }
        Ok(_) => {}
        Err(v) => violations.push(v),
    }

    if violations.is_empty() {
        Ok(clusters)
    } else {
        Err(violations)
    }
}
