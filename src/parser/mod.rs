//! Artifact parsers
//!
//! A parser claims artifact paths and turns their content into the generic
//! [`ElementTree`]. The registry picks the first parser claiming a path;
//! paths nobody claims are not indexed.

pub mod json;

pub use json::JsonModelParser;

use crate::model::ElementTree;
use crate::repository::Artifact;
use anyhow::Result;
use std::sync::Arc;

pub trait ArtifactParser: Send + Sync {
    fn name(&self) -> &str;

    fn can_parse(&self, path: &str) -> bool;

    fn parse(&self, artifact: &Artifact) -> Result<ElementTree>;
}

/// Ordered set of parsers.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn ArtifactParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in JSON parser.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonModelParser::default()));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn ArtifactParser>) {
        self.parsers.push(parser);
    }

    pub fn parser_for(&self, path: &str) -> Option<Arc<dyn ArtifactParser>> {
        self.parsers.iter().find(|p| p.can_parse(path)).cloned()
    }

    pub fn can_parse(&self, path: &str) -> bool {
        self.parsers.iter().any(|p| p.can_parse(path))
    }

    pub fn names(&self) -> Vec<&str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claiming_parser_wins() {
        let mut registry = ParserRegistry::with_defaults();
        registry.register(Arc::new(JsonModelParser::with_suffix(".json")));

        let parser = registry.parser_for("a.model.json").unwrap();
        assert_eq!(parser.name(), "json-model");
        assert!(registry.can_parse("plain.json"));
        assert!(!registry.can_parse("README.md"));
        assert_eq!(registry.names().len(), 2);
    }
}
