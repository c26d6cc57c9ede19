//! Live queries over a host tree.
//!
//! [`Engine`] turns a query string into a live, deduplicated, multi-consumer
//! stream of outcomes. Each engine owns its physical-listener registry and
//! its view cache, so independent engines never share state.
//!
//! A live query re-evaluates when either of two watches fires:
//!
//! - a coarse, throttled watch over the whole tree for inserted or removed
//!   nodes, text changes and changes to the configured attributes (a
//!   different element may now match, or the visibility of an ancestor may
//!   have changed)
//! - a removal watch on the ancestor chain of every current match, which
//!   re-evaluates as soon as a matched element is detached
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use livequery_core::config::EngineConfig;
//! use livequery_core::element::ElementSpec;
//! use livequery_core::engine::Engine;
//! use livequery_core::memory::{DeliveryMode, MemoryTree};
//!
//! let spec = ElementSpec::new("ul").child(ElementSpec::new("li").text("one"));
//! let tree = MemoryTree::from_spec(&spec, DeliveryMode::Manual);
//! let engine = Engine::new(Rc::new(tree.clone()), EngineConfig::default());
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! let _sub = engine
//!     .text("//li")
//!     .for_each(move |text| sink.borrow_mut().push(text.into_value()));
//! assert_eq!(*seen.borrow(), vec![Some("one".to_string())]);
//! ```

use std::rc::Rc;

use tracing::{debug, debug_span, trace, warn};

use crate::cache::SharedCache;
use crate::config::EngineConfig;
use crate::element::{ElementInfo, VisibilitySummary, VISIBILITY};
use crate::error::EngineError;
use crate::matching::{MatchFilter, NO_MATCH};
use crate::mutation::MutationMultiplexer;
use crate::outcome::{Outcome, Severity};
use crate::reconcile::reconcile;
use crate::stream::Stream;
use crate::tree::{ancestor_chain, MutationKind, MutationRecord, NodeId, ObserverOptions, Tree};

struct EngineInner {
    tree: Rc<dyn Tree>,
    mux: MutationMultiplexer,
    cache: SharedCache,
    config: EngineConfig,
}

/// Live query engine over one [`Tree`].
///
/// Cheap to clone; clones share listeners and cached views.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("mux", &self.inner.mux)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Engine {
    /// Creates an engine over `tree`.
    pub fn new(tree: Rc<dyn Tree>, config: EngineConfig) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                mux: MutationMultiplexer::new(Rc::clone(&tree)),
                tree,
                cache: SharedCache::new(),
                config,
            }),
        }
    }

    /// The host tree.
    pub fn tree(&self) -> &Rc<dyn Tree> {
        &self.inner.tree
    }

    /// The physical-listener registry.
    pub fn multiplexer(&self) -> &MutationMultiplexer {
        &self.inner.mux
    }

    /// The view cache.
    pub fn cache(&self) -> &SharedCache {
        &self.inner.cache
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Every match of `query` with its visibility.
    ///
    /// Successes carry a [`VISIBILITY`] attachment. A malformed query yields
    /// one [`Severity::Err`] outcome and is never re-evaluated.
    pub fn observe(&self, query: &str) -> Stream<Outcome<Vec<ElementInfo>>> {
        let engine = self.clone();
        let owned = query.to_string();
        self.inner
            .cache
            .memoize("observe", query, move || engine.live_matches(&owned))
    }

    /// The matches of `query` accepted by `filter`.
    pub fn elements(&self, query: &str, filter: MatchFilter) -> Stream<Outcome<Vec<NodeId>>> {
        let engine = self.clone();
        let owned = query.to_string();
        self.inner.cache.memoize("elements", &(query, filter), move || {
            engine
                .observe(&owned)
                .and_then_ok(move |infos| filter.select(&infos))
                .dedup()
        })
    }

    /// The single visible match of `query`.
    pub fn single(&self, query: &str) -> Stream<Outcome<NodeId>> {
        let engine = self.clone();
        let owned = query.to_string();
        self.inner.cache.memoize("single", query, move || {
            engine
                .elements(&owned, MatchFilter::single())
                .and_then_ok(|nodes| match nodes.first() {
                    Some(node) => Outcome::ok(*node),
                    None => Outcome::warn(NO_MATCH),
                })
                .dedup()
        })
    }

    /// Text content of the single visible match of `query`.
    pub fn text(&self, query: &str) -> Stream<Outcome<String>> {
        let engine = self.clone();
        let owned = query.to_string();
        self.inner.cache.memoize("text", query, move || {
            let inner = engine.clone();
            engine
                .single(&owned)
                .switch_map_ok(move |node| inner.live_text(node))
                .dedup()
        })
    }

    /// Whether `node` is visible, updated as it or an ancestor changes.
    pub fn visibility(&self, node: NodeId) -> Stream<bool> {
        let engine = self.clone();
        self.inner
            .cache
            .memoize("visibility", &node, move || engine.live_visibility(node))
    }

    fn live_matches(&self, query: &str) -> Stream<Outcome<Vec<ElementInfo>>> {
        let engine = self.clone();
        let query = query.to_string();
        Stream::defer(move || {
            let span = debug_span!("live_query", query = %query);
            let _enter = span.enter();
            if let Err(err) = engine.inner.tree.evaluate(&query) {
                warn!(%err, "query rejected");
                return Stream::hold(Outcome::error(err.to_string(), Severity::Err));
            }
            debug!("live query started");

            let evaluator = engine.clone();
            let coarse = engine.clone();
            let fine = engine.clone();
            Stream::hold(query.clone())
                .invalidate_on(
                    move |query: &String| evaluator.evaluate(query),
                    move |_| coarse.coarse_watch(),
                    move |projected| fine.removal_watch(projected),
                )
                .dedup()
        })
    }

    fn evaluate(&self, query: &str) -> Result<Outcome<Vec<ElementInfo>>, EngineError> {
        let tree = &self.inner.tree;
        match tree.evaluate(query) {
            Ok(nodes) => {
                let infos: Vec<ElementInfo> = nodes
                    .into_iter()
                    .map(|element| ElementInfo {
                        element,
                        is_visible: tree.is_visible(element),
                    })
                    .collect();
                let summary = VisibilitySummary::of(&infos);
                trace!(query, total = summary.total, visible = summary.visible, "query evaluated");
                Outcome::ok(infos).with_attachment(&VISIBILITY, summary)
            }
            Err(err) => Ok(Outcome::error(err.to_string(), Severity::Err)),
        }
    }

    /// Throttled whole-tree watch for structure, text and watched attributes.
    fn coarse_watch(&self) -> Stream<()> {
        let config = &self.inner.config;
        let options = ObserverOptions {
            subtree: true,
            child_list: true,
            attributes: true,
            attribute_filter: Some(config.watched_attributes.clone()),
            character_data: true,
            ..Default::default()
        };
        self.inner
            .mux
            .observe(self.inner.tree.root(), options)
            .filter(|batch| batch.iter().any(affects_matching))
            .map(|_| ())
            .throttle(config.coarse_throttle())
    }

    /// Fires as soon as any current match is detached.
    fn removal_watch(&self, projected: Stream<Outcome<Vec<ElementInfo>>>) -> Stream<()> {
        let engine = self.clone();
        let members = projected.map(|outcome: Outcome<Vec<ElementInfo>>| -> Vec<NodeId> {
            outcome
                .value()
                .map(|infos| infos.iter().map(|info| info.element).collect())
                .unwrap_or_default()
        });
        reconcile(&members, move |node: &NodeId| engine.detachment(*node))
    }

    /// Fires when `node`, or any ancestor below the root, leaves its parent.
    fn detachment(&self, node: NodeId) -> Stream<()> {
        let tree = &self.inner.tree;
        let options = ObserverOptions {
            child_list: true,
            ..Default::default()
        };
        let watches: Vec<Stream<()>> = ancestor_chain(&**tree, node)
            .into_iter()
            .filter_map(|member| {
                let parent = tree.parent(member)?;
                Some(
                    self.inner
                        .mux
                        .observe(parent, options.clone())
                        .filter(move |batch| batch.iter().any(|record| record.removes(member)))
                        .map(|_| ()),
                )
            })
            .collect();
        Stream::merge(watches)
    }

    fn live_text(&self, node: NodeId) -> Stream<Outcome<String>> {
        let tree = Rc::clone(&self.inner.tree);
        let mux = self.inner.mux.clone();
        Stream::hold(node).invalidate_on(
            move |node: &NodeId| Ok(Outcome::ok(tree.text_content(*node))),
            move |node: &NodeId| {
                mux.observe(
                    *node,
                    ObserverOptions {
                        subtree: true,
                        child_list: true,
                        character_data: true,
                        ..Default::default()
                    },
                )
            },
            |_: Stream<Outcome<String>>| Stream::<()>::never(),
        )
    }

    fn live_visibility(&self, node: NodeId) -> Stream<bool> {
        let tree = Rc::clone(&self.inner.tree);
        let engine = self.clone();
        Stream::hold(node)
            .invalidate_on(
                move |node: &NodeId| Ok(tree.is_visible(*node)),
                move |node: &NodeId| engine.visibility_watch(*node),
                |_: Stream<bool>| Stream::<()>::never(),
            )
            .dedup()
    }

    /// Watched-attribute changes on `node` and its ancestors, plus detachment.
    fn visibility_watch(&self, node: NodeId) -> Stream<()> {
        let options = ObserverOptions {
            attributes: true,
            attribute_filter: Some(self.inner.config.watched_attributes.clone()),
            ..Default::default()
        };
        let mut watches: Vec<Stream<()>> = ancestor_chain(&*self.inner.tree, node)
            .into_iter()
            .map(|member| self.inner.mux.observe(member, options.clone()).map(|_| ()))
            .collect();
        watches.push(self.detachment(node));
        Stream::merge(watches)
    }
}

/// Whether a record can change which elements a query selects.
///
/// Removals count too: they shift positions (`[n]`) of later siblings.
fn affects_matching(record: &MutationRecord) -> bool {
    match &record.kind {
        MutationKind::ChildList { removed, .. } => record.adds_nodes() || !removed.is_empty(),
        MutationKind::Attributes { .. } | MutationKind::CharacterData { .. } => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementSpec;
    use crate::memory::{DeliveryMode, MemoryTree};
    use std::cell::RefCell;

    fn list(items: usize) -> (MemoryTree, Engine) {
        let mut ul = ElementSpec::new("ul");
        for index in 0..items {
            ul = ul.child(ElementSpec::new("li").text(format!("item {index}")));
        }
        let tree = MemoryTree::from_spec(&ElementSpec::new("body").child(ul), DeliveryMode::Manual);
        let engine = Engine::new(Rc::new(tree.clone()), EngineConfig::default());
        (tree, engine)
    }

    fn record<T: 'static>(stream: &Stream<T>) -> (Rc<RefCell<Vec<T>>>, crate::stream::Subscription) {
        let seen: Rc<RefCell<Vec<T>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let sub = stream.for_each(move |value| sink.borrow_mut().push(value));
        (seen, sub)
    }

    #[test]
    fn observe_emits_current_matches_with_visibility() {
        let (_tree, engine) = list(3);
        let (seen, _sub) = record(&engine.observe("//li"));
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value().map(Vec::len), Some(3));
        assert_eq!(
            seen[0].attachment(&VISIBILITY),
            Some(&VisibilitySummary { total: 3, visible: 3 })
        );
    }

    #[test]
    fn malformed_query_yields_one_err_outcome() {
        let (tree, engine) = list(1);
        let (seen, _sub) = record(&engine.observe("//li["));
        tree.append_child(tree.root(), &ElementSpec::new("li")).unwrap();
        tree.deliver_pending();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].severity(), Some(Severity::Err));
        assert_eq!(engine.multiplexer().physical_count(), 0);
    }

    #[tokio::test]
    async fn removal_of_a_match_re_evaluates_immediately() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tree, engine) = list(3);
                let (seen, _sub) = record(&engine.observe("//li"));
                let first = seen.borrow()[0].value().unwrap()[0].element;
                tree.remove(first).unwrap();
                tree.deliver_pending();
                let seen = seen.borrow();
                assert_eq!(seen.len(), 2);
                assert_eq!(seen[1].value().map(Vec::len), Some(2));
            })
            .await;
    }

    #[test]
    fn single_reports_cardinality() {
        let (_tree, engine) = list(2);
        let (many, _a) = record(&engine.single("//li"));
        assert_eq!(
            many.borrow()[0].error_message(),
            Some("matched 2 elements (need exactly 1).")
        );
        let (none, _b) = record(&engine.single("//button"));
        assert_eq!(none.borrow()[0].error_message(), Some("matched 0 elements."));
        assert_eq!(none.borrow()[0].severity(), Some(Severity::Warn));
    }

    #[tokio::test]
    async fn text_follows_character_data() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tree, engine) = list(1);
                let (seen, _sub) = record(&engine.text("//li"));
                let item = tree.evaluate("//li").unwrap()[0];
                tree.set_text(item, "renamed").unwrap();
                tree.deliver_pending();
                let texts: Vec<Option<String>> = seen.borrow().iter().map(|o| o.value().cloned()).collect();
                assert_eq!(texts, vec![Some("item 0".to_string()), Some("renamed".to_string())]);
            })
            .await;
    }

    #[test]
    fn visibility_tracks_ancestor_attributes() {
        let (tree, engine) = list(1);
        let item = tree.evaluate("//li").unwrap()[0];
        let ul = tree.evaluate("//ul").unwrap()[0];
        let (seen, _sub) = record(&engine.visibility(item));
        tree.set_attribute(ul, "hidden", "").unwrap();
        tree.deliver_pending();
        tree.set_attribute(ul, "title", "ignored").unwrap();
        tree.deliver_pending();
        tree.remove_attribute(ul, "hidden").unwrap();
        tree.deliver_pending();
        assert_eq!(*seen.borrow(), vec![true, false, true]);
    }

    #[test]
    fn views_are_shared_through_the_cache() {
        let (tree, engine) = list(2);
        let (_a, first) = record(&engine.observe("//li"));
        let listeners = tree.listener_count();
        let (_b, second) = record(&engine.observe("//li"));
        assert_eq!(tree.listener_count(), listeners);
        assert_eq!(engine.cache().ref_count("observe", "//li"), 2);
        first.unsubscribe();
        second.unsubscribe();
        second.unsubscribe();
        assert!(engine.cache().is_empty());
        assert_eq!(tree.listener_count(), 0);
    }
}
