//! Tri-state label

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Tri-state classification label
///
/// `Unknown` means failure or genuine indeterminacy, never a default "no".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Positive,
    Negative,
    #[default]
    Unknown,
}

impl Label {
    /// All labels in confusion-matrix order
    pub const ALL: [Label; 3] = [Label::Positive, Label::Negative, Label::Unknown];

    /// Normalize a raw label string
    ///
    /// Trims and lower-cases; anything outside the label set is `Unknown`.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" => Label::Positive,
            "negative" => Label::Negative,
            _ => Label::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Positive => "positive",
            Label::Negative => "negative",
            Label::Unknown => "unknown",
        }
    }

    /// Position in [`Label::ALL`]
    pub fn index(self) -> usize {
        match self {
            Label::Positive => 0,
            Label::Negative => 1,
            Label::Unknown => 2,
        }
    }

    pub fn is_known(self) -> bool {
        self != Label::Unknown
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Lenient: any JSON value is accepted, invalid ones become Unknown
impl<'de> Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => Label::normalize(&s),
            _ => Label::Unknown,
        })
    }
}
