//! Keyed subscription sets.
//!
//! [`reconcile`] keeps exactly one inner subscription per key of the most
//! recent desired set and merges every inner emission into one output. Keys
//! leaving the set are torn down before keys entering it are started, and a
//! key removed and added again is started afresh.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use tracing::debug;

use crate::error::EngineError;
use crate::stream::{Observer, Sink, Stream, Subscription};

struct Entry {
    live: Rc<Cell<bool>>,
    finished: Rc<Cell<bool>>,
    subscription: Subscription,
}

impl Entry {
    /// Stops the inner subscription. Fails if it was already stopped.
    fn retire<K: Debug>(&self, key: &K) -> Result<(), EngineError> {
        if !self.live.replace(false) {
            return Err(EngineError::DoubleTeardown(format!("{key:?}")));
        }
        self.subscription.unsubscribe();
        Ok(())
    }
}

struct ReconcileState<K> {
    entries: HashMap<K, Entry>,
    epoch: u64,
    desired_done: bool,
}

impl<K> ReconcileState<K> {
    fn running(&self) -> usize {
        self.entries.values().filter(|entry| !entry.finished.get()).count()
    }
}

/// Maintains one `start(key)` subscription per key of the latest desired set.
///
/// The output completes once `desired` has completed and every inner stream
/// still in the set has completed. Emissions of a key's inner stream are
/// dropped once that key has left the set.
pub fn reconcile<K, T>(desired: &Stream<Vec<K>>, start: impl Fn(&K) -> Stream<T> + 'static) -> Stream<T>
where
    K: Clone + Eq + Hash + Debug + 'static,
    T: 'static,
{
    let desired = desired.clone();
    let start = Rc::new(start);
    Stream::new(move |observer: Observer<T>| {
        let state = Rc::new(RefCell::new(ReconcileState::<K> {
            entries: HashMap::new(),
            epoch: 0,
            desired_done: false,
        }));

        let on_set = {
            let state = Rc::clone(&state);
            let start = Rc::clone(&start);
            let observer = observer.clone();
            move |keys: Vec<K>| apply(&state, &observer, start.as_ref(), keys)
        };

        let on_complete = {
            let state = Rc::clone(&state);
            let observer = observer.clone();
            move || {
                let idle = {
                    let mut state = state.borrow_mut();
                    state.desired_done = true;
                    state.running() == 0
                };
                if idle {
                    observer.complete();
                }
            }
        };

        let failed = observer.clone();
        let upstream = desired.subscribe(
            Sink::new(on_set)
                .on_error(move |err| failed.error(err))
                .on_complete(on_complete),
        );

        let teardown = Subscription::new();
        teardown.add(upstream);
        teardown.add_fn(move || {
            let entries: Vec<(K, Entry)> = {
                let mut state = state.borrow_mut();
                state.epoch += 1;
                state.entries.drain().collect()
            };
            for (key, entry) in entries {
                // Already-stopped entries are fine during shutdown.
                let _ = entry.retire(&key);
            }
        });
        teardown
    })
}

fn apply<K, T>(
    state: &Rc<RefCell<ReconcileState<K>>>,
    observer: &Observer<T>,
    start: &dyn Fn(&K) -> Stream<T>,
    keys: Vec<K>,
) where
    K: Clone + Eq + Hash + Debug + 'static,
    T: 'static,
{
    let mut seen = HashSet::new();
    let wanted: Vec<K> = keys.into_iter().filter(|key| seen.insert(key.clone())).collect();

    let (epoch, removed, added) = {
        let mut state = state.borrow_mut();
        state.epoch += 1;
        let removed: Vec<K> = state
            .entries
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        let added: Vec<K> = wanted
            .iter()
            .filter(|key| !state.entries.contains_key(*key))
            .cloned()
            .collect();
        (state.epoch, removed, added)
    };
    if removed.is_empty() && added.is_empty() {
        return;
    }
    debug!(?added, ?removed, "reconciling key set");

    for key in removed {
        let entry = state.borrow_mut().entries.remove(&key);
        if let Some(entry) = entry {
            if let Err(err) = entry.retire(&key) {
                observer.error(err);
                return;
            }
        }
    }

    for key in added {
        {
            let state = state.borrow();
            // A nested update superseded this one; it started what it needed.
            if state.epoch != epoch || state.entries.contains_key(&key) {
                return;
            }
        }
        if observer.is_closed() {
            return;
        }

        let live = Rc::new(Cell::new(true));
        let finished = Rc::new(Cell::new(false));
        let holder = Subscription::new();
        state.borrow_mut().entries.insert(
            key.clone(),
            Entry {
                live: Rc::clone(&live),
                finished: Rc::clone(&finished),
                subscription: holder.clone(),
            },
        );

        let next = observer.clone();
        let failed = observer.clone();
        let done = observer.clone();
        let done_state = Rc::clone(state);
        let emit_live = Rc::clone(&live);
        let sink = Sink::new(move |value| {
            if emit_live.get() {
                next.next(value);
            }
        })
        .on_error(move |err| failed.error(err))
        .on_complete(move || {
            if !live.get() {
                return;
            }
            finished.set(true);
            let idle = {
                let state = done_state.borrow();
                state.desired_done && state.running() == 0
            };
            if idle {
                done.complete();
            }
        });
        holder.add(start(&key).subscribe(sink));
    }
}
