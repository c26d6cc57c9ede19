//! The external, mutable tree the engine queries and watches.
//!
//! The engine never mutates the tree. It needs four capabilities from the
//! host:
//!
//! - navigation (`root`, `parent`, `children`)
//! - query evaluation to an ordered list of elements
//! - per-element derived facts (visibility, text content)
//! - change listeners that deliver [`MutationRecord`] batches asynchronously
//!
//! [`MemoryTree`](crate::memory::MemoryTree) implements this trait in memory.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Opaque handle to a node in a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to one registered physical listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Options of one physical change listener.
///
/// `attribute_filter` narrows attribute watching to the listed names; it is
/// only meaningful together with `attributes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverOptions {
    /// Also observe every descendant of the target.
    pub subtree: bool,
    /// Report children being added or removed.
    pub child_list: bool,
    /// Report attribute changes.
    pub attributes: bool,
    /// Only report changes to these attribute names.
    pub attribute_filter: Option<BTreeSet<String>>,
    /// Include the previous attribute value in records.
    pub attribute_old_value: bool,
    /// Report text changes.
    pub character_data: bool,
    /// Include the previous text in records.
    pub character_data_old_value: bool,
}

impl ObserverOptions {
    /// Returns whether these options observe nothing at all.
    pub fn is_empty(&self) -> bool {
        !self.child_list && !self.attributes && !self.character_data
    }

    /// Returns whether a change to attribute `name` is reported.
    pub fn watches_attribute(&self, name: &str) -> bool {
        self.attributes
            && self
                .attribute_filter
                .as_ref()
                .map_or(true, |filter| filter.contains(name))
    }

    /// The record as a listener with these options would receive it, or
    /// `None` if these options do not report it.
    ///
    /// Old values are stripped unless the matching `*_old_value` flag is set.
    /// Scope (`subtree`) is not checked here.
    pub fn report(&self, record: &MutationRecord) -> Option<MutationRecord> {
        let kind = match &record.kind {
            MutationKind::ChildList { .. } if self.child_list => record.kind.clone(),
            MutationKind::Attributes { name, old_value } if self.watches_attribute(name) => {
                MutationKind::Attributes {
                    name: name.clone(),
                    old_value: old_value.clone().filter(|_| self.attribute_old_value),
                }
            }
            MutationKind::CharacterData { old_value } if self.character_data => MutationKind::CharacterData {
                old_value: old_value.clone().filter(|_| self.character_data_old_value),
            },
            _ => return None,
        };
        Some(MutationRecord {
            target: record.target,
            kind,
        })
    }
}

/// What kind of change a [`MutationRecord`] describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationKind {
    /// Children of `target` were added and/or removed.
    ChildList {
        /// Nodes inserted under the target.
        added: Vec<NodeId>,
        /// Nodes detached from the target.
        removed: Vec<NodeId>,
    },
    /// An attribute of `target` changed.
    Attributes {
        /// The attribute name.
        name: String,
        /// The previous value, when requested.
        old_value: Option<String>,
    },
    /// The text of `target` changed.
    CharacterData {
        /// The previous text, when requested.
        old_value: Option<String>,
    },
}

/// One change reported by a physical listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationRecord {
    /// The node that changed.
    pub target: NodeId,
    /// What changed.
    #[serde(flatten)]
    pub kind: MutationKind,
}

impl MutationRecord {
    /// Returns whether this record reports `node` being detached.
    pub fn removes(&self, node: NodeId) -> bool {
        matches!(&self.kind, MutationKind::ChildList { removed, .. } if removed.contains(&node))
    }

    /// Returns whether this record reports any node being inserted.
    pub fn adds_nodes(&self) -> bool {
        matches!(&self.kind, MutationKind::ChildList { added, .. } if !added.is_empty())
    }
}

/// Shared batch of records delivered in one host turn.
pub type MutationBatch = Rc<[MutationRecord]>;

/// Callback invoked by the host with each delivered batch.
pub type ListenerCallback = Rc<dyn Fn(Vec<MutationRecord>)>;

/// A mutable element tree hosting queries and change listeners.
///
/// Implementations must deliver listener callbacks outside of any borrow of
/// their own state: callbacks re-enter the tree to re-evaluate queries.
pub trait Tree {
    /// The document root. Never removed.
    fn root(&self) -> NodeId;

    /// The parent of `node`, or `None` for the root and detached nodes.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// The children of `node` in document order.
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Evaluates `query` against the attached tree, in document order.
    fn evaluate(&self, query: &str) -> Result<Vec<NodeId>, QueryError>;

    /// Whether `node` is currently rendered visible.
    fn is_visible(&self, node: NodeId) -> bool;

    /// Concatenated text of `node` and its descendants.
    fn text_content(&self, node: NodeId) -> String;

    /// Registers a physical listener on `node`.
    fn connect(&self, node: NodeId, options: &ObserverOptions, callback: ListenerCallback) -> ListenerId;

    /// Removes and returns records queued for `listener` but not yet delivered.
    fn take_records(&self, listener: ListenerId) -> Vec<MutationRecord>;

    /// Unregisters `listener`. Undelivered records are dropped.
    fn disconnect(&self, listener: ListenerId);
}

/// The chain `node, parent(node), …` up to but excluding the root.
///
/// Returns an empty chain for the root itself. A detached node yields the
/// chain up to its topmost detached ancestor.
pub fn ancestor_chain(tree: &dyn Tree, node: NodeId) -> Vec<NodeId> {
    let root = tree.root();
    let mut chain = Vec::new();
    let mut current = Some(node);
    while let Some(candidate) = current {
        if candidate == root {
            break;
        }
        chain.push(candidate);
        current = tree.parent(candidate);
    }
    chain
}
