//! Structure loader
//!
//! Materializes a declarative YAML concept tree into the graph:
//!
//! ```yaml
//! relationships:
//!   - name: Eats
//!     description: Consumes as food
//! concepts:
//!   - name: Animal
//!     type: Category
//!     children:
//!       - name: Dog
//!         type: Species
//!         relationships:
//!           - type: Eats
//!             target: Meat
//! ```
//!
//! Names resolve to GUIDs through [`generate_guid`], so an edge may point at
//! any concept created by this or an earlier load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::engine::RelationshipEngine;
use crate::error::{GraphError, Result};
use crate::identity::generate_guid;
use crate::model::{Concept, Guid, IS_A};
use crate::store::ConceptRepository;

/// Relationship-type declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipTypeNode {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Typed edge from the enclosing concept to a named target.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConceptNode {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub children: Vec<ConceptNode>,
    #[serde(default)]
    pub relationships: Vec<EdgeSpec>,
}

/// A forest of concept nodes plus the relationship types they use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConceptStructure {
    #[serde(default)]
    pub relationships: Vec<RelationshipTypeNode>,
    #[serde(default)]
    pub concepts: Vec<ConceptNode>,
}

/// Where a structure comes from.
#[derive(Debug, Clone)]
pub enum StructureSource {
    File(PathBuf),
    Inline(String),
}

impl From<&Path> for StructureSource {
    fn from(path: &Path) -> Self {
        StructureSource::File(path.to_path_buf())
    }
}

impl ConceptStructure {
    pub fn parse(yaml: &str) -> Result<Self> {
        let structure: ConceptStructure = serde_yaml::from_str(yaml)
            .map_err(|e| GraphError::MalformedInput(format!("invalid structure YAML: {}", e)))?;
        structure.validate()?;
        Ok(structure)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await?;
        Self::parse(&yaml)
    }

    pub async fn load(source: &StructureSource) -> Result<Self> {
        match source {
            StructureSource::File(path) => Self::from_file(path).await,
            StructureSource::Inline(yaml) => Self::parse(yaml),
        }
    }

    /// Reject empty names and half-specified edges.
    pub fn validate(&self) -> Result<()> {
        for rel in &self.relationships {
            if rel.name.trim().is_empty() {
                return Err(GraphError::MalformedInput(
                    "relationship type with empty name".into(),
                ));
            }
        }
        for node in self.nodes() {
            if node.name.trim().is_empty() {
                return Err(GraphError::MalformedInput("concept with empty name".into()));
            }
            for edge in &node.relationships {
                if edge.kind.trim().is_empty() || edge.target.trim().is_empty() {
                    return Err(GraphError::MalformedInput(format!(
                        "edge from {:?} needs both type and target",
                        node.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Depth-first, pre-order walk with each node's parent.
    pub fn walk(&self) -> Vec<(&ConceptNode, Option<&ConceptNode>)> {
        let mut order = Vec::new();
        let mut stack: Vec<(&ConceptNode, Option<&ConceptNode>)> =
            self.concepts.iter().rev().map(|n| (n, None)).collect();
        while let Some((node, parent)) = stack.pop() {
            order.push((node, parent));
            stack.extend(node.children.iter().rev().map(|c| (c, Some(node))));
        }
        order
    }

    fn nodes(&self) -> impl Iterator<Item = &ConceptNode> {
        self.walk().into_iter().map(|(node, _)| node)
    }
}

/// What a bootstrap created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub relationship_types: usize,
    pub concepts: usize,
    pub hierarchy_edges: usize,
    pub edges: usize,
}

pub struct StructureLoader {
    concepts: Arc<ConceptRepository>,
    engine: Arc<RelationshipEngine>,
}

impl StructureLoader {
    pub fn new(concepts: Arc<ConceptRepository>, engine: Arc<RelationshipEngine>) -> Self {
        Self { concepts, engine }
    }

    /// Parse and materialize a structure.
    pub async fn bootstrap_from(&self, source: &StructureSource) -> Result<BootstrapReport> {
        let structure = ConceptStructure::load(source).await?;
        self.bootstrap(&structure).await
    }

    /// Materialize a structure. Stops at the first failure; whatever was
    /// created before it stays.
    pub async fn bootstrap(&self, structure: &ConceptStructure) -> Result<BootstrapReport> {
        structure.validate()?;
        let mut report = BootstrapReport::default();

        for rel in &structure.relationships {
            self.engine
                .ensure_relationship_type(&rel.name, &rel.description)
                .await
                .map_err(|e| {
                    GraphError::bootstrap(format!("creating relationship type {}", rel.name), e)
                })?;
            report.relationship_types += 1;
        }
        if !structure.relationships.iter().any(|r| r.name == IS_A) {
            self.engine
                .ensure_relationship_type(IS_A, "")
                .await
                .map_err(|e| GraphError::bootstrap("creating relationship type Is A", e))?;
            report.relationship_types += 1;
        }
        let is_a = generate_guid(IS_A);

        for (node, parent) in structure.walk() {
            let guid = self
                .create_concept(node)
                .await
                .map_err(|e| GraphError::bootstrap(format!("creating concept {}", node.name), e))?;
            report.concepts += 1;

            if let Some(parent) = parent {
                let parent_guid = generate_guid(&parent.name);
                self.engine
                    .create_relationship(&parent_guid, &guid, &is_a)
                    .await
                    .map_err(|e| {
                        GraphError::bootstrap(
                            format!("linking {} Is A {}", parent.name, node.name),
                            e,
                        )
                    })?;
                report.hierarchy_edges += 1;
            }
        }

        for (node, _) in structure.walk() {
            let source = generate_guid(&node.name);
            for edge in &node.relationships {
                let target = generate_guid(&edge.target);
                let kind = generate_guid(&edge.kind);
                self.engine
                    .create_relationship(&source, &target, &kind)
                    .await
                    .map_err(|e| {
                        GraphError::bootstrap(
                            format!("creating edge {} -[{}]-> {}", node.name, edge.kind, edge.target),
                            e,
                        )
                    })?;
                debug!(source = %node.name, kind = %edge.kind, target = %edge.target, "Created edge");
                report.edges += 1;
            }
        }

        info!(
            relationship_types = report.relationship_types,
            concepts = report.concepts,
            hierarchy_edges = report.hierarchy_edges,
            edges = report.edges,
            "Bootstrapped concept structure"
        );
        Ok(report)
    }

    /// Create a node's concept, keeping the adjacency list of an existing one.
    async fn create_concept(&self, node: &ConceptNode) -> Result<Guid> {
        let mut concept = Concept::named(&node.name, &node.description, &node.kind)
            .with_content(&node.content);
        if let Ok(existing) = self.concepts.get(&concept.guid).await {
            concept.relationships = existing.relationships;
        }
        let stored = self.concepts.add_or_update(concept).await?;
        Ok(stored.guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
relationships:
  - name: Eats
concepts:
  - name: Animal
    children:
      - name: Dog
        children:
          - name: Puppy
      - name: Cat
  - name: Food
"#;

    #[test]
    fn test_walk_is_pre_order_with_parents() {
        let structure = ConceptStructure::parse(SAMPLE).unwrap();
        let order: Vec<(&str, Option<&str>)> = structure
            .walk()
            .into_iter()
            .map(|(n, p)| (n.name.as_str(), p.map(|p| p.name.as_str())))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Animal", None),
                ("Dog", Some("Animal")),
                ("Puppy", Some("Dog")),
                ("Cat", Some("Animal")),
                ("Food", None),
            ]
        );
    }

    #[test]
    fn test_rejects_empty_names() {
        let result = ConceptStructure::parse("concepts:\n  - name: ''\n");
        assert!(matches!(result, Err(GraphError::MalformedInput(_))));
    }

    #[test]
    fn test_rejects_half_edges() {
        let yaml = "concepts:\n  - name: Dog\n    relationships:\n      - type: Eats\n        target: ''\n";
        assert!(matches!(
            ConceptStructure::parse(yaml),
            Err(GraphError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_rejects_bad_yaml() {
        assert!(matches!(
            ConceptStructure::parse("concepts: [unclosed"),
            Err(GraphError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_optional_fields_default() {
        let structure = ConceptStructure::parse("concepts:\n  - name: Dog\n").unwrap();
        let dog = &structure.concepts[0];
        assert!(dog.description.is_empty());
        assert!(dog.kind.is_empty());
        assert!(structure.relationships.is_empty());
    }
}
