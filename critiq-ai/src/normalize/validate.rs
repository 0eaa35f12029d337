//! Validation of one batch response
//!
//! Every batch key ends up grouped, declined, or omitted. Keys outside the
//! batch are ignored and reported back. A key placed twice, an empty group
//! label, or a malformed member rejects the whole response.

use crate::parse::fields::{optional_array, optional_string, required_array, required_string, Object};
use critiq_common::schema::ClusterKey;
use serde_json::Value;
use std::collections::BTreeSet;

/// Group proposed by the service, restricted to batch keys
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedGroup {
    pub label: String,
    pub description: String,
    pub members: BTreeSet<ClusterKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchAssignment {
    pub groups: Vec<ProposedGroup>,
    /// Listed under `unassigned` by the service
    pub declined: BTreeSet<ClusterKey>,
    /// Not mentioned anywhere in the response
    pub omitted: BTreeSet<ClusterKey>,
    /// Mentioned but not part of this batch
    pub foreign: BTreeSet<ClusterKey>,
}

fn member_key(value: &Value) -> Result<ClusterKey, String> {
    let Value::Object(member) = value else {
        return Err("member must be an object with context_id and cluster_id".to_string());
    };
    let context_id = required_string(member, "context_id")?.trim();
    let cluster_id = required_string(member, "cluster_id")?.trim();
    if context_id.is_empty() || cluster_id.is_empty() {
        return Err("member context_id and cluster_id must not be empty".to_string());
    }
    Ok(ClusterKey::new(context_id, cluster_id))
}

pub fn validate_batch(batch_keys: &BTreeSet<ClusterKey>, obj: &Object) -> Result<BatchAssignment, Vec<String>> {
    let mut violations = Vec::new();
    let mut assignment = BatchAssignment::default();
    let mut placed: BTreeSet<ClusterKey> = BTreeSet::new();

    let mut place = |key: ClusterKey, violations: &mut Vec<String>, foreign: &mut BTreeSet<ClusterKey>| -> bool {
        if !batch_keys.contains(&key) {
            foreign.insert(key);
            return false;
        }
        if !placed.insert(key.clone()) {
            violations.push(format!("cluster {} is placed more than once", key));
            return false;
        }
        true
    };

    let groups = match required_array(obj, "groups") {
        Ok(groups) => groups,
        Err(v) => return Err(vec![v]),
    };

    for (index, group) in groups.iter().enumerate() {
        let Value::Object(group) = group else {
            violations.push(format!("groups[{}] is not an object", index));
            continue;
        };
        let label = match required_string(group, "label") {
            Ok(label) if label.trim().is_empty() => {
                violations.push(format!("groups[{}]: empty label", index));
                String::new()
            }
            Ok(label) => label.trim().to_string(),
            Err(v) => {
                violations.push(format!("groups[{}]: {}", index, v));
                String::new()
            }
        };
        let description = match optional_string(group, "description") {
            Ok(d) => d.unwrap_or("").trim().to_string(),
            Err(v) => {
                violations.push(format!("groups[{}]: {}", index, v));
                String::new()
            }
        };

        let mut members = BTreeSet::new();
        match required_array(group, "members") {
            Ok(raw) => {
                for value in raw {
                    match member_key(value) {
                        Ok(key) => {
                            if place(key.clone(), &mut violations, &mut assignment.foreign) {
                                members.insert(key);
                            }
                        }
                        Err(v) => violations.push(format!("groups[{}]: {}", index, v)),
                    }
                }
            }
            Err(v) => violations.push(format!("groups[{}]: {}", index, v)),
        }

        if !members.is_empty() {
            assignment.groups.push(ProposedGroup {
                label,
                description,
                members,
            });
        }
    }

    match optional_array(obj, "unassigned") {
        Ok(raw) => {
            for value in raw {
                match member_key(value) {
                    Ok(key) => {
                        if place(key.clone(), &mut violations, &mut assignment.foreign) {
                            assignment.declined.insert(key);
                        }
                    }
                    Err(v) => violations.push(format!("unassigned: {}", v)),
                }
            }
        }
        Err(v) => violations.push(v),
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    assignment.omitted = batch_keys.difference(&placed).cloned().collect();
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> BTreeSet<ClusterKey> {
        (1..=n).map(|i| ClusterKey::new("C", format!("C-{}", i))).collect()
    }

    fn object(raw: &str) -> Object {
        match serde_json::from_str(raw).unwrap() {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_omitted_key_detected() {
        let obj = object(
            r#"{"groups": [
                {"label": "Workload", "description": "d", "members": [
                    {"context_id": "C", "cluster_id": "C-1"},
                    {"context_id": "C", "cluster_id": "C-2"}]},
                {"label": "Grading", "members": [{"context_id": "C", "cluster_id": "C-3"}]}
            ], "unassigned": [{"context_id": "C", "cluster_id": "C-4"}]}"#,
        );
        let assignment = validate_batch(&keys(5), &obj).unwrap();
        assert_eq!(assignment.groups.len(), 2);
        assert_eq!(assignment.declined.len(), 1);
        assert_eq!(assignment.omitted, [ClusterKey::new("C", "C-5")].into_iter().collect());
    }

    #[test]
    fn test_foreign_keys_ignored() {
        let obj = object(
            r#"{"groups": [{"label": "Workload", "members": [
                {"context_id": "C", "cluster_id": "C-1"},
                {"context_id": "Z", "cluster_id": "Z-9"}]}]}"#,
        );
        let assignment = validate_batch(&keys(1), &obj).unwrap();
        assert_eq!(assignment.groups[0].members.len(), 1);
        assert_eq!(assignment.foreign.len(), 1);
    }

    #[test]
    fn test_duplicate_placement_rejected() {
        let obj = object(
            r#"{"groups": [
                {"label": "A", "members": [{"context_id": "C", "cluster_id": "C-1"}]},
                {"label": "B", "members": []}
            ], "unassigned": [{"context_id": "C", "cluster_id": "C-1"}]}"#,
        );
        let violations = validate_batch(&keys(1), &obj).unwrap_err();
        assert!(violations[0].contains("more than once"));
    }

    #[test]
    fn test_empty_label_and_malformed_member_rejected() {
        let obj = object(r#"{"groups": [{"label": " ", "members": ["C-1"]}]}"#);
        let violations = validate_batch(&keys(1), &obj).unwrap_err();
        assert_eq!(violations.len(), 2);
    }
}
