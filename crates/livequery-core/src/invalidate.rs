//! Recompute-on-demand projection.
//!
//! [`Stream::invalidate_on`] projects every source value and emits the
//! result, like [`Stream::try_map`]. In addition it subscribes two trigger
//! pipelines for the current source value: one built from the value itself,
//! one fed with every projection of it. Whenever either trigger fires, the
//! *same* source value is projected again and the result emitted, even if it
//! equals the previous one. Deduplication is left to the caller.
//!
//! A new source value tears down both triggers of the previous one before
//! anything else happens. A projection error terminates the output.
//!
//! ```
//! use livequery_core::stream::Stream;
//! use livequery_core::subject::Subject;
//!
//! let poke = Subject::<()>::new();
//! let trigger = poke.stream();
//! let counter = std::rc::Rc::new(std::cell::Cell::new(0));
//! let reads = counter.clone();
//! let live = Stream::hold(10).invalidate_on(
//!     move |base: &i32| {
//!         reads.set(reads.get() + 1);
//!         Ok(base + reads.get())
//!     },
//!     move |_| trigger.clone(),
//!     |_: Stream<i32>| Stream::<()>::never(),
//! );
//! let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! let _sub = live.for_each(move |value| sink.borrow_mut().push(value));
//! poke.next(());
//! assert_eq!(*seen.borrow(), vec![11, 12]);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::error::EngineError;
use crate::stream::{Observer, Sink, Stream, Subscription};
use crate::subject::Subject;

type Projection<S, P> = Rc<dyn Fn(&S) -> Result<P, EngineError>>;

struct CellState<S, P> {
    generation: u64,
    current: Option<S>,
    projected: Option<Subject<P>>,
    triggers: Option<Subscription>,
}

/// Per-subscriber state of one invalidation operator.
struct InvalidationCell<S, P> {
    state: RefCell<CellState<S, P>>,
    project: Projection<S, P>,
    observer: Observer<P>,
}

impl<S: Clone + 'static, P: Clone + 'static> InvalidationCell<S, P> {
    /// Projects the current source value, if `generation` is still current.
    fn recompute(&self, generation: u64) {
        let (value, projected) = {
            let state = self.state.borrow();
            if state.generation != generation {
                return;
            }
            match &state.current {
                Some(value) => (value.clone(), state.projected.clone()),
                None => return,
            }
        };
        match (self.project)(&value) {
            Ok(result) => {
                self.observer.next(result.clone());
                if let Some(projected) = projected {
                    projected.next(result);
                }
            }
            Err(err) => self.observer.error(err),
        }
    }

    /// Replaces the current source value and returns its generation.
    fn reset(&self, value: S) -> (u64, Subject<P>) {
        let (previous, generation, projected) = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.current = Some(value);
            let projected = Subject::replay_latest();
            state.projected = Some(projected.clone());
            (state.triggers.take(), state.generation, projected)
        };
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        (generation, projected)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.borrow().generation == generation
    }

    fn shutdown(&self) {
        let triggers = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.current = None;
            state.projected = None;
            state.triggers.take()
        };
        if let Some(triggers) = triggers {
            triggers.unsubscribe();
        }
    }
}

impl<S: Clone + 'static> Stream<S> {
    /// Projects every source value and re-projects the current one whenever
    /// a trigger fires.
    ///
    /// `by_source` builds the first trigger from the current source value.
    /// `by_projection` builds the second from the stream of that value's
    /// projections, which replays the latest one on subscribe. Both are
    /// subscribed after the first projection has been emitted and are torn
    /// down when the next source value arrives.
    pub fn invalidate_on<P, A, B>(
        &self,
        project: impl Fn(&S) -> Result<P, EngineError> + 'static,
        by_source: impl Fn(&S) -> Stream<A> + 'static,
        by_projection: impl Fn(Stream<P>) -> Stream<B> + 'static,
    ) -> Stream<P>
    where
        P: Clone + 'static,
        A: 'static,
        B: 'static,
    {
        let source = self.clone();
        let project: Projection<S, P> = Rc::new(project);
        let by_source = Rc::new(by_source);
        let by_projection = Rc::new(by_projection);

        Stream::new(move |observer: Observer<P>| {
            let cell = Rc::new(InvalidationCell {
                state: RefCell::new(CellState {
                    generation: 0,
                    current: None,
                    projected: None,
                    triggers: None,
                }),
                project: Rc::clone(&project),
                observer: observer.clone(),
            });

            let on_value = {
                let cell = Rc::clone(&cell);
                let by_source = Rc::clone(&by_source);
                let by_projection = Rc::clone(&by_projection);
                move |value: S| {
                    let (generation, projected) = cell.reset(value.clone());
                    cell.recompute(generation);
                    if !cell.is_current(generation) || cell.observer.is_closed() {
                        return;
                    }

                    let triggers = Stream::merge(vec![
                        by_source(&value).map(|_| ()),
                        by_projection(projected.stream()).map(|_| ()),
                    ]);
                    let fire = Rc::clone(&cell);
                    let failed = cell.observer.clone();
                    let subscription = triggers.subscribe(
                        Sink::new(move |()| {
                            trace!(generation, "invalidated");
                            fire.recompute(generation);
                        })
                        .on_error(move |err| failed.error(err)),
                    );

                    let mut state = cell.state.borrow_mut();
                    if state.generation == generation {
                        state.triggers = Some(subscription);
                    } else {
                        drop(state);
                        subscription.unsubscribe();
                    }
                }
            };

            let on_complete = {
                let cell = Rc::clone(&cell);
                move || {
                    cell.shutdown();
                    cell.observer.complete();
                }
            };

            let failed = observer.clone();
            let upstream = source.subscribe(
                Sink::new(on_value)
                    .on_error(move |err| failed.error(err))
                    .on_complete(on_complete),
            );

            let teardown = Subscription::new();
            teardown.add(upstream);
            teardown.add_fn(move || cell.shutdown());
            teardown
        })
    }
}
