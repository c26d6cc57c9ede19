//! In-memory [`Tree`] host.
//!
//! [`MemoryTree`] models a document: a `#document` root node owning a tree of
//! elements with a tag, attributes and their own text. Mutations queue
//! [`MutationRecord`]s for every listener that asked for them, and the queued
//! records are delivered in one batch per listener:
//!
//! - [`DeliveryMode::Spawned`] delivers from a task spawned with
//!   [`tokio::task::spawn_local`] the next time the current task yields,
//!   mirroring a browser's microtask-batched observers. Requires a
//!   [`tokio::task::LocalSet`].
//! - [`DeliveryMode::Manual`] holds records until
//!   [`MemoryTree::deliver_pending`] is called.
//!
//! Queries use the path syntax described in [`crate::selector`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::element::ElementSpec;
use crate::error::QueryError;
use crate::selector::{Axis, Operand, Path, Predicate, Step};
use crate::tree::{ListenerCallback, ListenerId, MutationKind, MutationRecord, NodeId, ObserverOptions, Tree};

const ROOT: NodeId = NodeId(0);
const DOCUMENT_TAG: &str = "#document";

/// How queued mutation records reach listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver from a local task after the mutating task yields.
    Spawned,
    /// Deliver only on [`MemoryTree::deliver_pending`].
    Manual,
}

#[derive(Debug)]
struct NodeData {
    tag: String,
    attributes: BTreeMap<String, String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

struct Listener {
    target: NodeId,
    options: ObserverOptions,
    callback: ListenerCallback,
    queue: Vec<MutationRecord>,
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<NodeId, NodeData>,
    next_node: u64,
    listeners: BTreeMap<u64, Listener>,
    next_listener: u64,
}

struct Inner {
    state: RefCell<TreeState>,
    mode: DeliveryMode,
    flush_scheduled: Cell<bool>,
}

/// A mutable in-memory document implementing [`Tree`].
#[derive(Clone)]
pub struct MemoryTree {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for MemoryTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("MemoryTree")
            .field("nodes", &state.nodes.len())
            .field("listeners", &state.listeners.len())
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    /// An empty document delivering records from spawned local tasks.
    pub fn new() -> Self {
        Self::with_mode(DeliveryMode::Spawned)
    }

    /// An empty document with the given delivery mode.
    pub fn with_mode(mode: DeliveryMode) -> Self {
        let mut state = TreeState::default();
        state.nodes.insert(
            ROOT,
            NodeData {
                tag: DOCUMENT_TAG.to_string(),
                attributes: BTreeMap::new(),
                text: String::new(),
                parent: None,
                children: Vec::new(),
            },
        );
        state.next_node = 1;
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(state),
                mode,
                flush_scheduled: Cell::new(false),
            }),
        }
    }

    /// A document whose root holds `spec` as its only element.
    pub fn from_spec(spec: &ElementSpec, mode: DeliveryMode) -> Self {
        let tree = Self::with_mode(mode);
        // The root always exists, so appending to it cannot fail.
        let _ = tree.append_child(ROOT, spec);
        tree
    }

    /// Builds `spec` and appends it as the last child of `parent`.
    pub fn append_child(&self, parent: NodeId, spec: &ElementSpec) -> Result<NodeId, QueryError> {
        let node = {
            let mut state = self.inner.state.borrow_mut();
            if !state.nodes.contains_key(&parent) {
                return Err(QueryError::UnknownNode(parent.0));
            }
            let node = build(&mut state, spec, Some(parent));
            if let Some(parent_data) = state.nodes.get_mut(&parent) {
                parent_data.children.push(node);
            }
            node
        };
        self.record(MutationRecord {
            target: parent,
            kind: MutationKind::ChildList {
                added: vec![node],
                removed: Vec::new(),
            },
        });
        Ok(node)
    }

    /// Detaches `node` from its parent. Detaching a detached node is a no-op.
    pub fn remove(&self, node: NodeId) -> Result<(), QueryError> {
        if node == ROOT {
            return Err(QueryError::UnknownNode(node.0));
        }
        let parent = {
            let mut state = self.inner.state.borrow_mut();
            let parent = state
                .nodes
                .get_mut(&node)
                .ok_or(QueryError::UnknownNode(node.0))?
                .parent
                .take();
            if let Some(parent) = parent {
                if let Some(parent_data) = state.nodes.get_mut(&parent) {
                    parent_data.children.retain(|child| *child != node);
                }
            }
            parent
        };
        if let Some(parent) = parent {
            self.record(MutationRecord {
                target: parent,
                kind: MutationKind::ChildList {
                    added: Vec::new(),
                    removed: vec![node],
                },
            });
        }
        Ok(())
    }

    /// Sets attribute `name` on `node`.
    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), QueryError> {
        let old_value = {
            let mut state = self.inner.state.borrow_mut();
            let data = state.nodes.get_mut(&node).ok_or(QueryError::UnknownNode(node.0))?;
            data.attributes.insert(name.to_string(), value.to_string())
        };
        self.record(MutationRecord {
            target: node,
            kind: MutationKind::Attributes {
                name: name.to_string(),
                old_value,
            },
        });
        Ok(())
    }

    /// Removes attribute `name` from `node`, if present.
    pub fn remove_attribute(&self, node: NodeId, name: &str) -> Result<(), QueryError> {
        let old_value = {
            let mut state = self.inner.state.borrow_mut();
            let data = state.nodes.get_mut(&node).ok_or(QueryError::UnknownNode(node.0))?;
            data.attributes.remove(name)
        };
        if old_value.is_some() {
            self.record(MutationRecord {
                target: node,
                kind: MutationKind::Attributes {
                    name: name.to_string(),
                    old_value,
                },
            });
        }
        Ok(())
    }

    /// Replaces the own text of `node`.
    pub fn set_text(&self, node: NodeId, text: &str) -> Result<(), QueryError> {
        let old_value = {
            let mut state = self.inner.state.borrow_mut();
            let data = state.nodes.get_mut(&node).ok_or(QueryError::UnknownNode(node.0))?;
            std::mem::replace(&mut data.text, text.to_string())
        };
        self.record(MutationRecord {
            target: node,
            kind: MutationKind::CharacterData {
                old_value: Some(old_value),
            },
        });
        Ok(())
    }

    /// The tag of `node`.
    pub fn tag(&self, node: NodeId) -> Option<String> {
        let state = self.inner.state.borrow();
        state.nodes.get(&node).map(|data| data.tag.clone())
    }

    /// Number of registered physical listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.state.borrow().listeners.len()
    }

    /// Options of every listener registered on `node`.
    pub fn listeners_on(&self, node: NodeId) -> Vec<ObserverOptions> {
        self.inner
            .state
            .borrow()
            .listeners
            .values()
            .filter(|listener| listener.target == node)
            .map(|listener| listener.options.clone())
            .collect()
    }

    /// Returns whether any listener has undelivered records.
    pub fn has_pending(&self) -> bool {
        self.inner
            .state
            .borrow()
            .listeners
            .values()
            .any(|listener| !listener.queue.is_empty())
    }

    /// Delivers every queued batch now.
    pub fn deliver_pending(&self) {
        deliver(&self.inner);
    }

    fn record(&self, record: MutationRecord) {
        let queued = {
            let mut state = self.inner.state.borrow_mut();
            let lineage = inclusive_ancestors(&state, record.target);
            let mut queued = false;
            for listener in state.listeners.values_mut() {
                let in_scope = listener.target == record.target
                    || (listener.options.subtree && lineage.contains(&listener.target));
                if !in_scope {
                    continue;
                }
                if let Some(filtered) = listener.options.report(&record) {
                    listener.queue.push(filtered);
                    queued = true;
                }
            }
            queued
        };
        if queued {
            self.schedule();
        }
    }

    fn schedule(&self) {
        if self.inner.mode == DeliveryMode::Manual || self.inner.flush_scheduled.replace(true) {
            return;
        }
        let weak: Weak<Inner> = Rc::downgrade(&self.inner);
        tokio::task::spawn_local(async move {
            if let Some(inner) = weak.upgrade() {
                deliver(&inner);
            }
        });
    }

    fn evaluate_path(&self, path: &Path) -> Vec<NodeId> {
        let state = self.inner.state.borrow();
        let order: HashMap<NodeId, usize> = preorder(&state, ROOT)
            .into_iter()
            .enumerate()
            .map(|(index, node)| (node, index))
            .collect();

        let mut context = vec![ROOT];
        for step in &path.steps {
            let mut seen = HashSet::new();
            let mut selected = Vec::new();
            for node in &context {
                for candidate in step_candidates(&state, *node, step) {
                    if seen.insert(candidate) {
                        selected.push(candidate);
                    }
                }
            }
            selected.sort_by_key(|node| order.get(node).copied().unwrap_or(usize::MAX));
            context = selected;
        }
        context
    }
}

impl Tree for MemoryTree {
    fn root(&self) -> NodeId {
        ROOT
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.inner.state.borrow().nodes.get(&node)?.parent
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .state
            .borrow()
            .nodes
            .get(&node)
            .map(|data| data.children.clone())
            .unwrap_or_default()
    }

    fn evaluate(&self, query: &str) -> Result<Vec<NodeId>, QueryError> {
        let path = Path::parse(query)?;
        Ok(self.evaluate_path(&path))
    }

    fn is_visible(&self, node: NodeId) -> bool {
        let state = self.inner.state.borrow();
        let lineage = inclusive_ancestors(&state, node);
        if lineage.last() != Some(&ROOT) {
            return false;
        }
        lineage
            .iter()
            .filter_map(|ancestor| state.nodes.get(ancestor))
            .all(|data| !hides(data))
    }

    fn text_content(&self, node: NodeId) -> String {
        let state = self.inner.state.borrow();
        let mut text = String::new();
        for member in preorder(&state, node) {
            if let Some(data) = state.nodes.get(&member) {
                text.push_str(&data.text);
            }
        }
        text
    }

    fn connect(&self, node: NodeId, options: &ObserverOptions, callback: ListenerCallback) -> ListenerId {
        let mut state = self.inner.state.borrow_mut();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(
            id,
            Listener {
                target: node,
                options: options.clone(),
                callback,
                queue: Vec::new(),
            },
        );
        trace!(listener = id, %node, ?options, "listener connected");
        ListenerId(id)
    }

    fn take_records(&self, listener: ListenerId) -> Vec<MutationRecord> {
        self.inner
            .state
            .borrow_mut()
            .listeners
            .get_mut(&listener.0)
            .map(|listener| std::mem::take(&mut listener.queue))
            .unwrap_or_default()
    }

    fn disconnect(&self, listener: ListenerId) {
        let removed = self.inner.state.borrow_mut().listeners.remove(&listener.0);
        if removed.is_some() {
            trace!(listener = listener.0, "listener disconnected");
        }
    }
}

fn deliver(inner: &Inner) {
    inner.flush_scheduled.set(false);
    let batches: Vec<(ListenerCallback, Vec<MutationRecord>)> = {
        let mut state = inner.state.borrow_mut();
        state
            .listeners
            .values_mut()
            .filter(|listener| !listener.queue.is_empty())
            .map(|listener| (Rc::clone(&listener.callback), std::mem::take(&mut listener.queue)))
            .collect()
    };
    for (callback, records) in batches {
        callback(records);
    }
}

fn build(state: &mut TreeState, spec: &ElementSpec, parent: Option<NodeId>) -> NodeId {
    let node = NodeId(state.next_node);
    state.next_node += 1;
    state.nodes.insert(
        node,
        NodeData {
            tag: spec.tag.clone(),
            attributes: spec.attributes.clone(),
            text: spec.text.clone(),
            parent,
            children: Vec::new(),
        },
    );
    let children: Vec<NodeId> = spec
        .children
        .iter()
        .map(|child| build(state, child, Some(node)))
        .collect();
    if let Some(data) = state.nodes.get_mut(&node) {
        data.children = children;
    }
    node
}

/// `node` followed by each of its ancestors.
fn inclusive_ancestors(state: &TreeState, node: NodeId) -> Vec<NodeId> {
    let mut lineage = vec![node];
    let mut current = state.nodes.get(&node).and_then(|data| data.parent);
    while let Some(parent) = current {
        lineage.push(parent);
        current = state.nodes.get(&parent).and_then(|data| data.parent);
    }
    lineage
}

fn preorder(state: &TreeState, start: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        out.push(node);
        if let Some(data) = state.nodes.get(&node) {
            stack.extend(data.children.iter().rev().copied());
        }
    }
    out
}

fn hides(data: &NodeData) -> bool {
    if data.attributes.contains_key("hidden") {
        return true;
    }
    data.attributes.get("style").is_some_and(|style| {
        let compact: String = style.chars().filter(|c| !c.is_whitespace()).collect();
        compact.contains("display:none") || compact.contains("visibility:hidden")
    })
}

fn step_candidates(state: &TreeState, context: NodeId, step: &Step) -> Vec<NodeId> {
    let pool = match step.axis {
        Axis::Child => state
            .nodes
            .get(&context)
            .map(|data| data.children.clone())
            .unwrap_or_default(),
        Axis::Descendant => preorder(state, context).into_iter().skip(1).collect(),
    };
    let mut matched: Vec<NodeId> = pool
        .into_iter()
        .filter(|node| {
            step.name.as_ref().map_or(true, |name| {
                state.nodes.get(node).is_some_and(|data| &data.tag == name)
            })
        })
        .collect();
    for predicate in &step.predicates {
        matched = match predicate {
            Predicate::Position(position) => matched.get(position - 1).copied().into_iter().collect(),
            other => matched
                .into_iter()
                .filter(|node| state.nodes.get(node).is_some_and(|data| holds(other, data)))
                .collect(),
        };
    }
    matched
}

fn holds(predicate: &Predicate, data: &NodeData) -> bool {
    match predicate {
        Predicate::HasAttribute(name) => data.attributes.contains_key(name),
        Predicate::AttributeEquals(name, value) => data.attributes.get(name) == Some(value),
        Predicate::TextEquals(value) => data.text.trim() == value,
        Predicate::Contains(Operand::Attribute(name), needle) => data
            .attributes
            .get(name)
            .is_some_and(|value| value.contains(needle.as_str())),
        Predicate::Contains(Operand::Text, needle) => data.text.contains(needle.as_str()),
        Predicate::Position(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_tree() -> (MemoryTree, NodeId) {
        let spec = ElementSpec::new("body").child(
            ElementSpec::new("ul")
                .attr("id", "list")
                .child(ElementSpec::new("li").attr("class", "item a").text("one"))
                .child(ElementSpec::new("li").attr("class", "item").text("two"))
                .child(ElementSpec::new("li").attr("hidden", "").text("three")),
        );
        let tree = MemoryTree::from_spec(&spec, DeliveryMode::Manual);
        let list = tree.evaluate("//ul").unwrap()[0];
        (tree, list)
    }

    #[test]
    fn evaluates_in_document_order() {
        let (tree, list) = list_tree();
        let items = tree.evaluate("//li").unwrap();
        assert_eq!(items, tree.children(list));
        assert_eq!(tree.evaluate("/body/ul/li[2]").unwrap(), vec![items[1]]);
        assert_eq!(tree.evaluate("//li[contains(@class, 'a')]").unwrap(), vec![items[0]]);
        assert_eq!(tree.evaluate("//li[text()='two']").unwrap(), vec![items[1]]);
        assert_eq!(tree.evaluate("//*[@hidden]").unwrap(), vec![items[2]]);
        assert!(tree.evaluate("/li").unwrap().is_empty());
    }

    #[test]
    fn malformed_query_is_an_error() {
        let (tree, _) = list_tree();
        assert!(matches!(tree.evaluate("//li["), Err(QueryError::Malformed { .. })));
    }

    #[test]
    fn visibility_follows_ancestors() {
        let (tree, list) = list_tree();
        let items = tree.children(list);
        assert!(tree.is_visible(items[0]));
        assert!(!tree.is_visible(items[2]));
        tree.set_attribute(list, "style", "display: none").unwrap();
        assert!(!tree.is_visible(items[0]));
        tree.remove_attribute(list, "style").unwrap();
        tree.remove(items[0]).unwrap();
        assert!(!tree.is_visible(items[0]), "detached nodes are not visible");
    }

    #[test]
    fn text_content_concatenates_subtree() {
        let (tree, list) = list_tree();
        assert_eq!(tree.text_content(list), "onetwothree");
    }

    #[test]
    fn manual_delivery_batches_per_listener() {
        let (tree, list) = list_tree();
        let batches: Rc<RefCell<Vec<Vec<MutationRecord>>>> = Rc::default();
        let sink = Rc::clone(&batches);
        let options = ObserverOptions {
            child_list: true,
            ..Default::default()
        };
        tree.connect(list, &options, Rc::new(move |records| sink.borrow_mut().push(records)));

        let first = tree.children(list)[0];
        tree.remove(first).unwrap();
        tree.append_child(list, &ElementSpec::new("li")).unwrap();
        tree.set_attribute(list, "class", "x").unwrap();
        assert!(batches.borrow().is_empty());
        assert!(tree.has_pending());

        tree.deliver_pending();
        let batches = batches.borrow();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2, "attribute change is not reported");
        assert!(batches[0][0].removes(first));
        assert!(batches[0][1].adds_nodes());
    }

    #[test]
    fn subtree_and_attribute_filter_scope_records() {
        let (tree, list) = list_tree();
        let root = tree.root();
        let seen: Rc<RefCell<Vec<MutationRecord>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let options = ObserverOptions {
            subtree: true,
            attributes: true,
            attribute_filter: Some(["class".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let listener = tree.connect(root, &options, Rc::new(move |records| sink.borrow_mut().extend(records)));

        tree.set_attribute(list, "class", "c").unwrap();
        tree.set_attribute(list, "title", "t").unwrap();
        let pending = tree.take_records(listener);
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].kind,
            MutationKind::Attributes {
                name: "class".into(),
                old_value: None
            }
        );

        tree.disconnect(listener);
        tree.set_attribute(list, "class", "d").unwrap();
        tree.deliver_pending();
        assert!(seen.borrow().is_empty());
        assert_eq!(tree.listener_count(), 0);
    }

    #[tokio::test]
    async fn spawned_delivery_runs_after_yield() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let tree = MemoryTree::new();
                let count = Rc::new(Cell::new(0));
                let counter = Rc::clone(&count);
                let options = ObserverOptions {
                    child_list: true,
                    ..Default::default()
                };
                tree.connect(tree.root(), &options, Rc::new(move |records| {
                    counter.set(counter.get() + records.len())
                }));
                tree.append_child(tree.root(), &ElementSpec::new("a")).unwrap();
                tree.append_child(tree.root(), &ElementSpec::new("b")).unwrap();
                assert_eq!(count.get(), 0);
                tokio::task::yield_now().await;
                assert_eq!(count.get(), 2);
            })
            .await;
    }
}
