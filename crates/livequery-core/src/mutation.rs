//! Shared physical change listeners.
//!
//! Many logical watchers are interested in the same node: the coarse
//! whole-tree watch of every live query, the removal watches on each matched
//! element's ancestors, visibility watches. The [`MutationMultiplexer`] keeps
//! at most one physical listener per `(node, subtree)` pair, configured as the
//! union of every active request, and fans its batches out to each request
//! filtered down to what that request asked for.
//!
//! Attribute interest is reference-counted in two spaces: per attribute name,
//! and "all attributes". While any request watches all attributes, the
//! physical listener is unfiltered.
//!
//! ```
//! use std::rc::Rc;
//! use livequery_core::memory::MemoryTree;
//! use livequery_core::mutation::MutationMultiplexer;
//! use livequery_core::tree::{ObserverOptions, Tree};
//!
//! let tree = MemoryTree::new();
//! let mux = MutationMultiplexer::new(Rc::new(tree.clone()));
//! let options = ObserverOptions { child_list: true, ..Default::default() };
//! let _a = mux.observe(tree.root(), options.clone()).for_each(|_| {});
//! let _b = mux.observe(tree.root(), options).for_each(|_| {});
//! assert_eq!(mux.physical_count(), 1);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::stream::{Observer, Stream, Subscription};
use crate::subject::Subject;
use crate::tree::{ListenerId, MutationBatch, MutationRecord, NodeId, ObserverOptions, Tree};

type ObserverKey = (NodeId, bool);

/// Reference counts of every option requested on one physical listener.
#[derive(Debug, Default)]
struct Counters {
    child_list: usize,
    attributes_all: usize,
    attribute_names: BTreeMap<String, usize>,
    attribute_old_value: usize,
    character_data: usize,
    character_data_old_value: usize,
}

impl Counters {
    fn add(&mut self, options: &ObserverOptions) {
        if options.child_list {
            self.child_list += 1;
        }
        if options.attributes {
            match &options.attribute_filter {
                None => self.attributes_all += 1,
                Some(names) => {
                    for name in names {
                        *self.attribute_names.entry(name.clone()).or_default() += 1;
                    }
                }
            }
        }
        if options.attribute_old_value {
            self.attribute_old_value += 1;
        }
        if options.character_data {
            self.character_data += 1;
        }
        if options.character_data_old_value {
            self.character_data_old_value += 1;
        }
    }

    fn remove(&mut self, options: &ObserverOptions) {
        fn release(count: &mut usize) {
            *count = count.saturating_sub(1);
        }
        if options.child_list {
            release(&mut self.child_list);
        }
        if options.attributes {
            match &options.attribute_filter {
                None => release(&mut self.attributes_all),
                Some(names) => {
                    for name in names {
                        if let Some(count) = self.attribute_names.get_mut(name) {
                            release(count);
                            if *count == 0 {
                                self.attribute_names.remove(name);
                            }
                        }
                    }
                }
            }
        }
        if options.attribute_old_value {
            release(&mut self.attribute_old_value);
        }
        if options.character_data {
            release(&mut self.character_data);
        }
        if options.character_data_old_value {
            release(&mut self.character_data_old_value);
        }
    }

    fn is_idle(&self) -> bool {
        self.child_list == 0
            && self.attributes_all == 0
            && self.attribute_names.is_empty()
            && self.attribute_old_value == 0
            && self.character_data == 0
            && self.character_data_old_value == 0
    }

    /// The least option set satisfying every counted request.
    fn merged(&self, subtree: bool) -> ObserverOptions {
        let attributes = self.attributes_all > 0 || !self.attribute_names.is_empty();
        let attribute_filter = (self.attributes_all == 0 && !self.attribute_names.is_empty())
            .then(|| self.attribute_names.keys().cloned().collect());
        let character_data = self.character_data > 0;
        ObserverOptions {
            subtree,
            child_list: self.child_list > 0,
            attributes,
            attribute_filter,
            attribute_old_value: attributes && self.attribute_old_value > 0,
            character_data,
            character_data_old_value: character_data && self.character_data_old_value > 0,
        }
    }
}

struct PhysicalObserver {
    counts: Counters,
    connected: Option<(ListenerId, ObserverOptions)>,
    batches: Subject<MutationBatch>,
}

struct MuxInner {
    tree: Rc<dyn Tree>,
    observers: RefCell<HashMap<ObserverKey, PhysicalObserver>>,
}

impl MuxInner {
    /// Brings the physical listener of `key` in line with its counters.
    ///
    /// Returns records buffered on the old listener, which the caller must
    /// deliver to the current subscribers once no borrow is held.
    fn reconfigure(&self, key: ObserverKey, observer: &mut PhysicalObserver) -> Vec<MutationRecord> {
        let merged = observer.counts.merged(key.1);
        let desired = (!merged.is_empty()).then_some(merged);
        let current = observer.connected.as_ref().map(|(_, options)| options);
        if current == desired.as_ref() {
            return Vec::new();
        }

        let mut drained = Vec::new();
        if let Some((listener, _)) = observer.connected.take() {
            drained = self.tree.take_records(listener);
            self.tree.disconnect(listener);
        }
        match desired {
            Some(options) => {
                let batches = observer.batches.clone();
                let listener = self.tree.connect(
                    key.0,
                    &options,
                    Rc::new(move |records: Vec<MutationRecord>| batches.next(Rc::from(records))),
                );
                debug!(node = %key.0, subtree = key.1, ?options, drained = drained.len(), "physical listener configured");
                observer.connected = Some((listener, options));
            }
            None => {
                debug!(node = %key.0, subtree = key.1, drained = drained.len(), "physical listener disconnected");
            }
        }
        drained
    }
}

/// Registry of shared physical listeners over one [`Tree`].
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct MutationMultiplexer {
    inner: Rc<MuxInner>,
}

impl std::fmt::Debug for MutationMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationMultiplexer")
            .field("physical", &self.physical_count())
            .finish()
    }
}

impl MutationMultiplexer {
    /// Creates an empty registry over `tree`.
    pub fn new(tree: Rc<dyn Tree>) -> Self {
        Self {
            inner: Rc::new(MuxInner {
                tree,
                observers: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The tree this registry listens to.
    pub fn tree(&self) -> &Rc<dyn Tree> {
        &self.inner.tree
    }

    /// Live stream of change batches on `node` matching `options`.
    ///
    /// The request is registered on subscribe and released on unsubscribe.
    /// Batches with no record relevant to `options` are not emitted.
    pub fn observe(&self, node: NodeId, options: ObserverOptions) -> Stream<MutationBatch> {
        let mux = self.clone();
        Stream::new(move |observer: Observer<MutationBatch>| {
            let registration = mux.register(node, options.clone());
            let wanted = options.clone();
            let downstream = observer.clone();
            let feed = registration
                .batches()
                .subscribe(observer.relay(move |batch: MutationBatch| {
                    let relevant: Vec<MutationRecord> =
                        batch.iter().filter_map(|record| wanted.report(record)).collect();
                    if !relevant.is_empty() {
                        downstream.next(Rc::from(relevant));
                    }
                }));
            let teardown = Subscription::new();
            teardown.add(feed);
            teardown.add_fn(move || registration.unregister());
            teardown
        })
    }

    /// Registers one logical request directly.
    ///
    /// Prefer [`observe`](Self::observe); this is the lower-level form whose
    /// [`Registration::unregister`] must be called explicitly.
    pub fn register(&self, node: NodeId, options: ObserverOptions) -> Registration {
        let key = (node, options.subtree);
        let (batches, drained) = {
            let mut observers = self.inner.observers.borrow_mut();
            let observer = observers.entry(key).or_insert_with(|| PhysicalObserver {
                counts: Counters::default(),
                connected: None,
                batches: Subject::new(),
            });
            observer.counts.add(&options);
            let drained = self.inner.reconfigure(key, observer);
            (observer.batches.clone(), drained)
        };
        if !drained.is_empty() {
            batches.next(Rc::from(drained));
        }
        Registration {
            mux: Rc::downgrade(&self.inner),
            key,
            options,
            active: Cell::new(true),
            batches,
        }
    }

    /// Number of physical listeners currently connected.
    pub fn physical_count(&self) -> usize {
        self.inner
            .observers
            .borrow()
            .values()
            .filter(|observer| observer.connected.is_some())
            .count()
    }

    /// Options of the physical listener on `(node, subtree)`, if connected.
    pub fn merged_options(&self, node: NodeId, subtree: bool) -> Option<ObserverOptions> {
        self.inner
            .observers
            .borrow()
            .get(&(node, subtree))
            .and_then(|observer| observer.connected.as_ref())
            .map(|(_, options)| options.clone())
    }
}

/// One logical request held on a [`MutationMultiplexer`].
pub struct Registration {
    mux: Weak<MuxInner>,
    key: ObserverKey,
    options: ObserverOptions,
    active: Cell<bool>,
    batches: Subject<MutationBatch>,
}

impl Registration {
    /// Returns whether this request still counts towards its listener.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Unfiltered batches of the shared physical listener.
    pub fn batches(&self) -> Stream<MutationBatch> {
        self.batches.stream()
    }

    /// Releases this request. Calling it again is a no-op.
    pub fn unregister(&self) {
        if !self.active.replace(false) {
            return;
        }
        let Some(inner) = self.mux.upgrade() else {
            return;
        };
        let drained = {
            let mut observers = inner.observers.borrow_mut();
            let Some(observer) = observers.get_mut(&self.key) else {
                return;
            };
            observer.counts.remove(&self.options);
            let drained = inner.reconfigure(self.key, observer);
            if observer.counts.is_idle() {
                observers.remove(&self.key);
            }
            drained
        };
        if !drained.is_empty() {
            self.batches.next(Rc::from(drained));
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("node", &self.key.0)
            .field("subtree", &self.key.1)
            .field("active", &self.active.get())
            .finish()
    }
}
