//! Reference-counted memoization of live views.
//!
//! [`SharedCache::memoize`] returns a stream that, on subscribe, attaches to
//! the shared stream stored under `(view, args)` or builds it. The entry is
//! evicted when its last subscriber leaves or when the shared stream
//! completes, so nothing outlives a zero-subscriber gap.
//!
//! Keys are the JSON serialization of `(view, args)`, so any
//! [`Serialize`] argument tuple can be used.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::stream::{Observer, Sink, Stream, Subscription};

struct CacheEntry {
    id: u64,
    ref_count: usize,
    stream: Rc<dyn Any>,
}

#[derive(Default)]
struct CacheInner {
    entries: RefCell<HashMap<String, CacheEntry>>,
    next_id: Cell<u64>,
}

impl CacheInner {
    /// Drops one reference to entry `id` under `key`, evicting it at zero.
    fn release(&self, key: &str, id: u64) {
        let mut entries = self.entries.borrow_mut();
        let evict = match entries.get_mut(key) {
            Some(entry) if entry.id == id => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count == 0
            }
            _ => false,
        };
        if evict {
            entries.remove(key);
            debug!(key, "cache entry evicted");
        }
    }

    /// Removes entry `id` under `key` regardless of its count.
    fn evict(&self, key: &str, id: u64) {
        let mut entries = self.entries.borrow_mut();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
            debug!(key, "cache entry completed");
        }
    }
}

/// Registry of shared live views, owned by one engine.
#[derive(Clone, Default)]
pub struct SharedCache {
    inner: Rc<CacheInner>,
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache").field("entries", &self.len()).finish()
    }
}

impl SharedCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache key of `(view, args)`.
    pub fn key<A: Serialize + ?Sized>(view: &str, args: &A) -> Result<String, serde_json::Error> {
        serde_json::to_string(&(view, args))
    }

    /// Shares the stream built by `build` among every concurrent subscriber
    /// of `(view, args)`.
    ///
    /// `build` runs on the first subscription after each eviction. Its stream
    /// is wrapped with [`Stream::share_replay`], so late subscribers receive
    /// the latest value at once.
    pub fn memoize<V, A>(&self, view: &str, args: &A, build: impl Fn() -> Stream<V> + 'static) -> Stream<V>
    where
        V: Clone + 'static,
        A: Serialize + ?Sized,
    {
        let key = match Self::key(view, args) {
            Ok(key) => key,
            Err(err) => {
                warn!(view, %err, "uncacheable view arguments");
                return Stream::defer(build);
            }
        };
        let cache = Rc::clone(&self.inner);
        let build = Rc::new(build);
        Stream::new(move |observer: Observer<V>| {
            let (id, shared) = acquire(&cache, &key, build.as_ref());

            let done_cache = Rc::clone(&cache);
            let done_key = key.clone();
            let next = observer.clone();
            let failed = observer.clone();
            let done = observer.clone();
            let downstream = shared.subscribe(
                Sink::new(move |value| next.next(value))
                    .on_error(move |err| failed.error(err))
                    .on_complete(move || {
                        done_cache.evict(&done_key, id);
                        done.complete();
                    }),
            );

            let teardown = Subscription::new();
            teardown.add(downstream);
            let cache = Rc::clone(&cache);
            let key = key.clone();
            teardown.add_fn(move || cache.release(&key, id));
            teardown
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    /// Returns whether the cache holds no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscribers attached to `(view, args)`; zero if absent.
    pub fn ref_count<A: Serialize + ?Sized>(&self, view: &str, args: &A) -> usize {
        let Ok(key) = Self::key(view, args) else {
            return 0;
        };
        self.inner
            .entries
            .borrow()
            .get(&key)
            .map_or(0, |entry| entry.ref_count)
    }
}

/// Takes a reference to the entry under `key`, building it if absent.
fn acquire<V: Clone + 'static>(cache: &CacheInner, key: &str, build: &dyn Fn() -> Stream<V>) -> (u64, Stream<V>) {
    {
        let mut entries = cache.entries.borrow_mut();
        if let Some(entry) = entries.get_mut(key) {
            if let Some(stream) = entry.stream.downcast_ref::<Stream<V>>() {
                entry.ref_count += 1;
                return (entry.id, stream.clone());
            }
            warn!(key, "cache entry holds a different view type; rebuilding");
        }
    }

    // Built outside the borrow: view construction may consult the cache.
    let shared = build().share_replay();
    let id = cache.next_id.get();
    cache.next_id.set(id + 1);
    cache.entries.borrow_mut().insert(
        key.to_string(),
        CacheEntry {
            id,
            ref_count: 1,
            stream: Rc::new(shared.clone()),
        },
    );
    debug!(key, "cache entry built");
    (id, shared)
}
