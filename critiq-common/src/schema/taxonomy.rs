//! Versioned taxonomy families
//!
//! File format (TOML):
//!
//! ```toml
//! version = "2024.2"
//!
//! [[families]]
//! label = "Assessment & Grading"
//! description = "Exams, rubrics, grade turnaround"
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One permissible taxonomy label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyFamily {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// Fixed, versioned label vocabulary for normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub version: String,
    pub families: Vec<TaxonomyFamily>,
}

impl Taxonomy {
    /// Load and validate a taxonomy file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("Taxonomy file missing: {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let taxonomy: Taxonomy = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse taxonomy failed: {}", e)))?;
        taxonomy.validate()?;
        Ok(taxonomy)
    }

    fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::Config("Taxonomy version must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for family in &self.families {
            let normalized = normalize_label(&family.label);
            if normalized.is_empty() {
                return Err(Error::Config("Taxonomy family label must not be empty".to_string()));
            }
            if !seen.insert(normalized) {
                return Err(Error::Config(format!(
                    "Duplicate taxonomy family label: {}",
                    family.label
                )));
            }
        }
        Ok(())
    }

    /// Find the family matching a proposed label (case/whitespace-insensitive)
    pub fn resolve(&self, proposed: &str) -> Option<&TaxonomyFamily> {
        let wanted = normalize_label(proposed);
        self.families
            .iter()
            .find(|f| normalize_label(&f.label) == wanted)
    }
}

/// Merge key for labels: trimmed, lower-cased, internal whitespace collapsed
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
