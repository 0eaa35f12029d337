//! `{{placeholder}}` prompt templates
//!
//! Templates are parsed once into literal and placeholder segments, so
//! rendering is a single pass: substituted values are never re-scanned and
//! a value containing `{{text}}` stays literal.

use serde::{Serialize, Serializer};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("Unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("Unknown placeholder '{{{{{0}}}}}'")]
    UnknownPlaceholder(String),

    #[error("Template is missing required placeholder '{{{{{0}}}}}'")]
    MissingPlaceholder(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(&'static str),
}

/// Parsed template; serializes as its source text
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    /// Parse `source`, accepting only `allowed` names and requiring `required`
    pub fn parse(
        source: &str,
        allowed: &[&'static str],
        required: &[&'static str],
    ) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or(TemplateError::Unclosed(offset + open))?;
            let name = after_open[..close].trim();
            let known = allowed
                .iter()
                .find(|candidate| **candidate == name)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            segments.push(Segment::Placeholder(*known));

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        for name in required {
            if !segments.contains(&Segment::Placeholder(*name)) {
                return Err(TemplateError::MissingPlaceholder(name.to_string()));
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Parse the template file at `path`, or `default` when none is configured
    pub fn load(
        path: Option<&Path>,
        default: &str,
        allowed: &[&'static str],
        required: &[&'static str],
    ) -> critiq_common::Result<Self> {
        let source = match path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                critiq_common::Error::Config(format!("Cannot read template {}: {}", path.display(), e))
            })?,
            None => default.to_string(),
        };
        Self::parse(&source, allowed, required)
            .map_err(|e| critiq_common::Error::Config(format!("Invalid template: {}", e)))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// sha256 of the template source
    pub fn hash(&self) -> String {
        critiq_common::hash::sha256_hex(self.source.as_bytes())
    }

    /// Substitute every placeholder with `value(name)`
    pub fn render<'a, F>(&self, value: F) -> String
    where
        F: Fn(&str) -> &'a str,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => out.push_str(value(name)),
            }
        }
        out
    }
}

impl Serialize for PromptTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: &[&str] = &["text", "item_id"];

    #[test]
    fn test_render_single_pass() {
        let template = PromptTemplate::parse("Post {{ item_id }}: {{text}}!", ALLOWED, &["text"]).unwrap();
        let rendered = template.render(|name| match name {
            "text" => "says {{item_id}}",
            _ => "42",
        });
        assert_eq!(rendered, "Post 42: says {{item_id}}!");
    }

    #[test]
    fn test_rejects_unknown_placeholder() {
        let err = PromptTemplate::parse("{{text}} {{author}}", ALLOWED, &["text"]).unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder("author".into()));
    }

    #[test]
    fn test_rejects_missing_required() {
        let err = PromptTemplate::parse("{{item_id}} only", ALLOWED, &["text"]).unwrap_err();
        assert_eq!(err, TemplateError::MissingPlaceholder("text".into()));
    }

    #[test]
    fn test_rejects_unclosed() {
        let err = PromptTemplate::parse("abc {{text", ALLOWED, &["text"]).unwrap_err();
        assert_eq!(err, TemplateError::Unclosed(4));
    }

    #[test]
    fn test_serializes_as_source() {
        let template = PromptTemplate::parse("{{text}}", ALLOWED, &["text"]).unwrap();
        assert_eq!(serde_json::to_string(&template).unwrap(), "\"{{text}}\"");
    }
}
