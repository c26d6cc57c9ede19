//! Element types shared by the engine and its hosts.
//!
//! [`ElementInfo`] is the per-match snapshot handed to consumers of a live
//! query. [`ElementSpec`] is the serialized description of an element tree,
//! used to seed a [`MemoryTree`](crate::memory::MemoryTree) from JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::AttachmentKey;
use crate::tree::NodeId;

/// Snapshot of one query match.
///
/// Carries enough information for consumers to act on the match without
/// re-querying the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementInfo {
    /// The matched element.
    pub element: NodeId,
    /// Whether the element was visible at evaluation time.
    #[serde(rename = "isVisible")]
    pub is_visible: bool,
}

/// Visibility counts over one match set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VisibilitySummary {
    /// Number of matched elements.
    pub total: usize,
    /// Number of matched elements that are visible.
    pub visible: usize,
}

impl VisibilitySummary {
    /// Folds a match set into its visibility counts.
    pub fn of(infos: &[ElementInfo]) -> Self {
        Self {
            total: infos.len(),
            visible: infos.iter().filter(|info| info.is_visible).count(),
        }
    }

    /// Returns whether there are matches and none of them is visible.
    pub fn all_hidden(&self) -> bool {
        self.total > 0 && self.visible == 0
    }
}

/// Attachment carrying the [`VisibilitySummary`] of a live query result.
pub const VISIBILITY: AttachmentKey<VisibilitySummary> = AttachmentKey::new("visibility");

/// Serialized description of an element and its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSpec {
    /// Element tag name (e.g. `button`, `div`).
    pub tag: String,

    /// Attributes by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Text directly owned by this element.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,

    /// Child elements nested within this element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementSpec>,
}

impl ElementSpec {
    /// An element with no attributes, text or children.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Adds an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Sets the element's own text.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Appends a child.
    pub fn child(mut self, child: ElementSpec) -> Self {
        self.children.push(child);
        self
    }
}
