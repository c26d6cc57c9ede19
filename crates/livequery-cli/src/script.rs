//! Timed mutation scripts.
//!
//! A script is a JSON array of steps. Each step names the element it acts on
//! with a query (the first match in document order is used) and the time,
//! relative to the start of the replay, at which it runs:
//!
//! ```json
//! [
//!   { "at_ms": 0,  "op": "append", "target": "//ul", "element": { "tag": "li", "text": "new" } },
//!   { "at_ms": 50, "op": "set_attribute", "target": "//li[1]", "name": "hidden", "value": "" },
//!   { "at_ms": 90, "op": "remove", "target": "//li[2]" }
//! ]
//! ```

use std::path::Path;

use livequery_core::element::ElementSpec;
use livequery_core::error::QueryError;
use livequery_core::memory::MemoryTree;
use livequery_core::tree::{NodeId, Tree};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One mutation and the time it runs at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Milliseconds after the start of the replay.
    #[serde(default)]
    pub at_ms: u64,

    /// What to do.
    #[serde(flatten)]
    pub mutation: Mutation,
}

/// A single tree mutation, addressed by query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Appends `element` (and its subtree) as the last child of the target.
    Append { target: String, element: ElementSpec },
    /// Detaches the target from its parent.
    Remove { target: String },
    /// Sets an attribute on the target.
    SetAttribute {
        target: String,
        name: String,
        #[serde(default)]
        value: String,
    },
    /// Removes an attribute from the target.
    RemoveAttribute { target: String, name: String },
    /// Replaces the target's own text.
    SetText { target: String, text: String },
}

/// Why a step could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("target `{0}` matched nothing")]
    NoTarget(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl Mutation {
    /// Short operation name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Append { .. } => "append",
            Mutation::Remove { .. } => "remove",
            Mutation::SetAttribute { .. } => "set_attribute",
            Mutation::RemoveAttribute { .. } => "remove_attribute",
            Mutation::SetText { .. } => "set_text",
        }
    }

    /// The query addressing the element this mutation acts on.
    pub fn target(&self) -> &str {
        match self {
            Mutation::Append { target, .. }
            | Mutation::Remove { target }
            | Mutation::SetAttribute { target, .. }
            | Mutation::RemoveAttribute { target, .. }
            | Mutation::SetText { target, .. } => target,
        }
    }

    /// Resolves the target and applies the mutation to `tree`.
    ///
    /// Returns the node the mutation acted on.
    pub fn apply(&self, tree: &MemoryTree) -> Result<NodeId, StepError> {
        let node = resolve(tree, self.target())?;
        match self {
            Mutation::Append { element, .. } => {
                tree.append_child(node, element)?;
            }
            Mutation::Remove { .. } => tree.remove(node)?,
            Mutation::SetAttribute { name, value, .. } => tree.set_attribute(node, name, value)?,
            Mutation::RemoveAttribute { name, .. } => tree.remove_attribute(node, name)?,
            Mutation::SetText { text, .. } => tree.set_text(node, text)?,
        }
        Ok(node)
    }
}

fn resolve(tree: &MemoryTree, target: &str) -> Result<NodeId, StepError> {
    tree.evaluate(target)?
        .first()
        .copied()
        .ok_or_else(|| StepError::NoTarget(target.to_string()))
}

/// Parses a script from JSON text, ordering steps by time.
///
/// Steps sharing the same `at_ms` keep their order in the file.
pub fn parse(json: &str) -> Result<Vec<Step>, serde_json::Error> {
    let mut steps: Vec<Step> = serde_json::from_str(json)?;
    steps.sort_by_key(|step| step.at_ms);
    Ok(steps)
}

/// Reads and parses a script file.
pub fn load(path: &Path) -> std::io::Result<Vec<Step>> {
    let json = std::fs::read_to_string(path)?;
    parse(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
