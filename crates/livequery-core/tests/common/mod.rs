//! Shared test helpers for livequery-core integration tests.
//!
//! Fixtures build a `body > ul > li*` document in a spawned-delivery
//! [`MemoryTree`], so tests must run inside a `LocalSet` (see [`local`]).

#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use livequery_core::config::EngineConfig;
use livequery_core::element::{ElementInfo, ElementSpec};
use livequery_core::engine::Engine;
use livequery_core::memory::{DeliveryMode, MemoryTree};
use livequery_core::outcome::Outcome;
use livequery_core::stream::{Stream, Subscription};
use livequery_core::tree::{NodeId, Tree};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A `body > ul#list > li.item*` description with `items` entries.
pub fn list_spec(items: usize) -> ElementSpec {
    let mut list = ElementSpec::new("ul").attr("id", "list");
    for index in 0..items {
        list = list.child(
            ElementSpec::new("li")
                .attr("class", "item")
                .text(format!("item {index}")),
        );
    }
    ElementSpec::new("body").child(list)
}

/// A list fixture with its engine.
pub struct Fixture {
    pub tree: MemoryTree,
    pub engine: Engine,
    pub list: NodeId,
}

impl Fixture {
    /// `items` list entries, default configuration.
    pub fn new(items: usize) -> Self {
        Self::with_config(items, EngineConfig::default())
    }

    /// `items` list entries, custom configuration.
    pub fn with_config(items: usize, config: EngineConfig) -> Self {
        let tree = MemoryTree::from_spec(&list_spec(items), DeliveryMode::Spawned);
        let engine = Engine::new(Rc::new(tree.clone()), config);
        let list = tree.evaluate("//ul[@id='list']").unwrap()[0];
        Self { tree, engine, list }
    }

    /// Current `li` children of the list.
    pub fn items(&self) -> Vec<NodeId> {
        self.tree.children(self.list)
    }

    /// Appends one more matching `li`.
    pub fn add_item(&self, text: &str) -> NodeId {
        self.tree
            .append_child(self.list, &ElementSpec::new("li").attr("class", "item").text(text))
            .unwrap()
    }
}

/// Config with the given coarse throttle edges and window.
pub fn coarse(window_ms: u64, leading: bool, trailing: bool) -> EngineConfig {
    EngineConfig {
        coarse_throttle_ms: window_ms,
        coarse_leading: leading,
        coarse_trailing: trailing,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Emission recording
// ---------------------------------------------------------------------------

/// Records every value a stream emits.
pub struct Recorder<T> {
    seen: Rc<RefCell<Vec<T>>>,
    subscription: Subscription,
}

impl<T: Clone + 'static> Recorder<T> {
    pub fn start(stream: &Stream<T>) -> Self {
        let seen: Rc<RefCell<Vec<T>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let subscription = stream.for_each(move |value| sink.borrow_mut().push(value));
        Self { seen, subscription }
    }

    pub fn values(&self) -> Vec<T> {
        self.seen.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.borrow().len()
    }

    pub fn last(&self) -> Option<T> {
        self.seen.borrow().last().cloned()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

/// Match counts of every recorded `observe` emission (`None` for failures).
pub fn match_counts(recorder: &Recorder<Outcome<Vec<ElementInfo>>>) -> Vec<Option<usize>> {
    recorder
        .values()
        .iter()
        .map(|outcome| outcome.value().map(Vec::len))
        .collect()
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Runs `future` on a fresh `LocalSet`.
pub async fn local<F: Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}

/// Lets spawned deliveries run without advancing the clock.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Advances the (paused) clock by `ms` and lets timers fire.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}
