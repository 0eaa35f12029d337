//! Test helper utilities
//!
//! Synthetic corpora, a temp root folder with its own registry, and scripted
//! services that answer classification, clustering and normalization prompts.

#![allow(dead_code)]

use critiq_ai::service::{GenerationResponse, ScriptedService};
use critiq_ai::stages::StageContext;
use critiq_common::config::{load_toml_config, CritiqConfig};
use critiq_common::db::Registry;
use critiq_common::jsonl;
use critiq_common::schema::{GoldAnnotation, Item, Label};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const CONTEXTS: [&str; 3] = ["CS101", "CS102", "CS103"];

/// Positive items mention something broken
pub fn is_positive(index: usize) -> bool {
    index % 5 != 0
}

/// `n` items spread over three contexts and three length buckets
pub fn corpus(n: usize) -> Vec<Item> {
    (0..n)
        .map(|i| {
            let words = match i % 3 {
                0 => 6,
                1 => 24,
                _ => 60,
            };
            let mut text = if is_positive(i) {
                String::from("the lab projector is broken again")
            } else {
                String::from("the lectures are clear and well paced")
            };
            for w in 0..words {
                text.push_str(&format!(" w{}", w));
            }
            Item {
                item_id: format!("item-{:03}", i),
                context_id: CONTEXTS[(i / 3) % CONTEXTS.len()].to_string(),
                text,
                numeric_filter_score: if is_positive(i) { -0.5 } else { 0.5 },
            }
        })
        .collect()
}

/// Gold rows for every item, all annotated for `split`
pub fn gold(items: &[Item], split: &str) -> Vec<GoldAnnotation> {
    items
        .iter()
        .map(|item| GoldAnnotation {
            item_id: item.item_id.clone(),
            split: split.to_string(),
            context_id: Some(item.context_id.clone()),
            label: if item.text.contains("broken") {
                Label::Positive
            } else {
                Label::Negative
            },
            rationale_text: String::new(),
            ambiguity_flag: false,
        })
        .collect()
}

pub const TAXONOMY: &str = r#"
version = "2024.1"

[[families]]
label = "Facilities"
description = "Rooms, equipment, lab hardware"

[[families]]
label = "Workload"
description = "Amount and pacing of assigned work"
"#;

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self, config_id: &str) -> CritiqConfig {
        let path = self.root().join(format!("critiq-{}.toml", config_id));
        let content = format!(
            r#"
[service]
base_url = "http://127.0.0.1:9/v1"
model = "scripted-model"
max_retries = 1
initial_backoff_ms = 1
max_backoff_ms = 2
concurrency = 4

[classification]
config_id = "{}"

[normalization]
batch_size = 2
"#,
            config_id
        );
        std::fs::write(&path, content).unwrap();
        load_toml_config(&path).unwrap()
    }

    pub async fn context(&self, config_id: &str, service: ScriptedService) -> StageContext {
        self.context_with(self.config(config_id), service).await
    }

    pub async fn context_with(&self, config: CritiqConfig, service: ScriptedService) -> StageContext {
        let registry = Registry::open(self.root()).await.unwrap();
        StageContext::new(config, self.root().to_path_buf(), registry, Arc::new(service))
    }

    pub fn write_rows<T: serde::Serialize>(&self, name: &str, rows: &[T]) -> PathBuf {
        let path = self.root().join("inputs").join(name);
        jsonl::write_rows(&path, rows).unwrap();
        path
    }

    pub fn write_taxonomy(&self) -> PathBuf {
        let path = self.root().join("taxonomy.toml");
        std::fs::write(&path, TAXONOMY).unwrap();
        path
    }
}

fn post_text(prompt: &str) -> &str {
    prompt
        .split("\"\"\"")
        .nth(1)
        .unwrap_or(prompt)
}

/// Classifier that recognises criticisms; with `miss_positives` it calls
/// every criticism negative
pub fn classifier(miss_positives: bool) -> ScriptedService {
    ScriptedService::new(move |request| {
        let body = if post_text(&request.prompt).contains("broken") && !miss_positives {
            json!({
                "label": "positive",
                "confidence": 0.9,
                "rationale_summary": "broken lab equipment",
                "evidence_snippet": "projector is broken"
            })
        } else {
            json!({"label": "negative", "confidence": 0.8})
        };
        Ok(GenerationResponse::text(body.to_string()))
    })
}

/// JSON objects on their own prompt lines
fn prompt_objects(prompt: &str, key: &str) -> Vec<serde_json::Map<String, Value>> {
    prompt
        .lines()
        .filter_map(|line| match serde_json::from_str::<Value>(line.trim()) {
            Ok(Value::Object(map)) if map.contains_key(key) => Some(map),
            _ => None,
        })
        .collect()
}

/// One cluster per context holding every listed item
pub fn clusterer() -> ScriptedService {
    ScriptedService::new(|request| {
        let context = request
            .prompt
            .split("criticisms of course ")
            .nth(1)
            .and_then(|rest| rest.split(',').next())
            .unwrap_or("")
            .to_string();
        let ids: Vec<String> = prompt_objects(&request.prompt, "item_id")
            .iter()
            .filter_map(|obj| obj.get("item_id").and_then(Value::as_str).map(str::to_string))
            .collect();
        let count = ids.len();
        let body = json!({
            "clusters": [{
                "cluster_id": format!("{}-1", context),
                "summary": "Lab equipment is broken",
                "member_item_ids": ids,
                "member_count": count,
            }],
            "unique_member_count": count,
        });
        Ok(GenerationResponse::text(format!("Here you go:\n{}", body)))
    })
}

/// Maps CS101/CS102 clusters to "facilities" and declines CS103
pub fn normalizer() -> ScriptedService {
    ScriptedService::new(|request| {
        let mut grouped = Vec::new();
        let mut declined = Vec::new();
        for obj in prompt_objects(&request.prompt, "cluster_id") {
            let key = json!({"context_id": obj["context_id"], "cluster_id": obj["cluster_id"]});
            if obj["context_id"] == "CS103" {
                declined.push(key);
            } else {
                grouped.push(key);
            }
        }
        let mut groups = Vec::new();
        if !grouped.is_empty() {
            groups.push(json!({"label": "  facilities ", "description": "", "members": grouped}));
        }
        let body = json!({"groups": groups, "unassigned": declined});
        Ok(GenerationResponse::text(body.to_string()))
    })
}

/// Count rows of a JSONL file by a string field
pub fn count_by(path: &Path, field: &str) -> BTreeMap<String, usize> {
    let rows: Vec<Value> = jsonl::read_rows(path).unwrap();
    let mut counts = BTreeMap::new();
    for row in rows {
        let key = row[field].as_str().unwrap_or("").to_string();
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}
