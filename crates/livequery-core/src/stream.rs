//! Single-threaded push streams.
//!
//! Every stage of the engine is a synchronous push pipeline: a value handed
//! to an [`Observer`] is delivered to the downstream [`Sink`] before `next`
//! returns. Nothing here is `Send`; state is shared through `Rc`/`RefCell`
//! and every callback must tolerate being re-entered.
//!
//! A [`Stream`] is cold: each call to [`Stream::subscribe`] runs its producer
//! again. Cancellation is [`Subscription::unsubscribe`], which is idempotent
//! and tears down the whole upstream chain synchronously.
//!
//! Time-based operators ([`Stream::throttle`]) spawn timers with
//! [`tokio::task::spawn_local`], so they must run inside a
//! [`tokio::task::LocalSet`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::error::EngineError;

type Teardown = Box<dyn FnOnce()>;

#[derive(Default)]
struct SubscriptionInner {
    closed: Cell<bool>,
    teardowns: RefCell<Vec<Teardown>>,
}

/// Handle to an active subscription.
///
/// Clones share the same underlying state. Unsubscribing more than once is a
/// no-op, so teardown logic attached with [`add_fn`](Self::add_fn) runs
/// exactly once.
#[derive(Clone, Default)]
pub struct Subscription {
    inner: Rc<SubscriptionInner>,
}

impl Subscription {
    /// Creates an open subscription with no teardown logic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a subscription that runs `teardown` when unsubscribed.
    pub fn from_fn(teardown: impl FnOnce() + 'static) -> Self {
        let subscription = Self::new();
        subscription.add_fn(teardown);
        subscription
    }

    /// Returns whether this subscription has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Registers teardown logic. Runs it immediately if already closed.
    pub fn add_fn(&self, teardown: impl FnOnce() + 'static) {
        if self.is_closed() {
            teardown();
        } else {
            self.inner.teardowns.borrow_mut().push(Box::new(teardown));
        }
    }

    /// Ties `child` to this subscription's lifetime.
    pub fn add(&self, child: Subscription) {
        if Rc::ptr_eq(&self.inner, &child.inner) {
            return;
        }
        self.add_fn(move || child.unsubscribe());
    }

    /// Tears down this subscription and everything attached to it.
    pub fn unsubscribe(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        // Taken before running so teardowns may register new ones re-entrantly.
        let teardowns = std::mem::take(&mut *self.inner.teardowns.borrow_mut());
        for teardown in teardowns {
            teardown();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Callbacks receiving a stream's values, error and completion.
pub struct Sink<T> {
    next: Box<dyn Fn(T)>,
    error: Box<dyn Fn(EngineError)>,
    complete: Box<dyn Fn()>,
}

impl<T: 'static> Sink<T> {
    /// Creates a sink from a value callback.
    ///
    /// Errors are logged as unhandled and completion is ignored until
    /// overridden with [`on_error`](Self::on_error) / [`on_complete`](Self::on_complete).
    pub fn new(next: impl Fn(T) + 'static) -> Self {
        Self {
            next: Box::new(next),
            error: Box::new(|err| error!(%err, "unhandled stream error")),
            complete: Box::new(|| {}),
        }
    }

    /// Replaces the error callback.
    pub fn on_error(mut self, error: impl Fn(EngineError) + 'static) -> Self {
        self.error = Box::new(error);
        self
    }

    /// Replaces the completion callback.
    pub fn on_complete(mut self, complete: impl Fn() + 'static) -> Self {
        self.complete = Box::new(complete);
        self
    }

    /// Creates a sink that forwards everything to `observer`.
    pub fn forward(observer: Observer<T>) -> Self {
        let on_error = observer.clone();
        let on_complete = observer.clone();
        Self {
            next: Box::new(move |value| observer.next(value)),
            error: Box::new(move |err| on_error.error(err)),
            complete: Box::new(move || on_complete.complete()),
        }
    }
}

struct ObserverInner<T> {
    sink: Sink<T>,
    subscription: Subscription,
    stopped: Cell<bool>,
}

/// The producer-facing side of a subscription.
///
/// Once an error or completion has been delivered, or the subscription has
/// been torn down, further calls are ignored.
pub struct Observer<T> {
    inner: Rc<ObserverInner<T>>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Observer<T> {
    /// Delivers a value downstream.
    pub fn next(&self, value: T) {
        if !self.is_closed() {
            (self.inner.sink.next)(value);
        }
    }

    /// Delivers a fatal error downstream and tears the subscription down.
    pub fn error(&self, err: EngineError) {
        if self.is_closed() {
            return;
        }
        self.inner.stopped.set(true);
        (self.inner.sink.error)(err);
        self.inner.subscription.unsubscribe();
    }

    /// Signals completion downstream and tears the subscription down.
    pub fn complete(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.stopped.set(true);
        (self.inner.sink.complete)();
        self.inner.subscription.unsubscribe();
    }

    /// Returns whether the downstream no longer accepts values.
    pub fn is_closed(&self) -> bool {
        self.inner.stopped.get() || self.inner.subscription.is_closed()
    }

    /// Builds an upstream sink with a custom value callback that forwards
    /// errors and completion to this observer.
    pub fn relay<S: 'static>(&self, next: impl Fn(S) + 'static) -> Sink<S> {
        let on_error = self.clone();
        let on_complete = self.clone();
        Sink {
            next: Box::new(next),
            error: Box::new(move |err| on_error.error(err)),
            complete: Box::new(move || on_complete.complete()),
        }
    }
}

/// A cold, single-threaded push stream.
pub struct Stream<T> {
    producer: Rc<dyn Fn(Observer<T>) -> Subscription>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Rc::clone(&self.producer),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stream { .. }")
    }
}

impl<T: 'static> Stream<T> {
    /// Creates a stream from a producer.
    ///
    /// The producer runs once per subscriber and returns the teardown for
    /// whatever it started.
    pub fn new(producer: impl Fn(Observer<T>) -> Subscription + 'static) -> Self {
        Self {
            producer: Rc::new(producer),
        }
    }

    /// Subscribes `sink` and returns the handle used to cancel it.
    pub fn subscribe(&self, sink: Sink<T>) -> Subscription {
        let subscription = Subscription::new();
        let observer = Observer {
            inner: Rc::new(ObserverInner {
                sink,
                subscription: subscription.clone(),
                stopped: Cell::new(false),
            }),
        };
        let upstream = (self.producer)(observer);
        subscription.add(upstream);
        subscription
    }

    /// Subscribes with only a value callback.
    pub fn for_each(&self, next: impl Fn(T) + 'static) -> Subscription {
        self.subscribe(Sink::new(next))
    }

    /// A stream that never emits and never completes.
    pub fn never() -> Self {
        Stream::new(|_| Subscription::new())
    }

    /// A stream that completes immediately.
    pub fn empty() -> Self {
        Stream::new(|observer: Observer<T>| {
            observer.complete();
            Subscription::new()
        })
    }

    /// Builds the actual stream lazily, once per subscriber.
    pub fn defer(factory: impl Fn() -> Stream<T> + 'static) -> Self {
        Stream::new(move |observer| factory().subscribe(Sink::forward(observer)))
    }

    /// Interleaves the values of every stream in arrival order.
    ///
    /// Completes once all inputs have completed.
    pub fn merge(streams: Vec<Stream<T>>) -> Self {
        Stream::new(move |observer: Observer<T>| {
            if streams.is_empty() {
                observer.complete();
                return Subscription::new();
            }
            let remaining = Rc::new(Cell::new(streams.len()));
            let group = Subscription::new();
            for stream in &streams {
                let next = observer.clone();
                let failed = observer.clone();
                let done = observer.clone();
                let remaining = Rc::clone(&remaining);
                let sink = Sink::new(move |value| next.next(value))
                    .on_error(move |err| failed.error(err))
                    .on_complete(move || {
                        remaining.set(remaining.get() - 1);
                        if remaining.get() == 0 {
                            done.complete();
                        }
                    });
                group.add(stream.subscribe(sink));
            }
            group
        })
    }

    /// Transforms every value.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Stream<U> {
        let source = self.clone();
        let f = Rc::new(f);
        Stream::new(move |observer: Observer<U>| {
            let f = Rc::clone(&f);
            let downstream = observer.clone();
            source.subscribe(observer.relay(move |value| downstream.next(f(value))))
        })
    }

    /// Transforms every value; an `Err` terminates the stream with that error.
    pub fn try_map<U: 'static>(
        &self,
        f: impl Fn(T) -> Result<U, EngineError> + 'static,
    ) -> Stream<U> {
        let source = self.clone();
        let f = Rc::new(f);
        Stream::new(move |observer: Observer<U>| {
            let f = Rc::clone(&f);
            let downstream = observer.clone();
            source.subscribe(observer.relay(move |value| match f(value) {
                Ok(mapped) => downstream.next(mapped),
                Err(err) => downstream.error(err),
            }))
        })
    }

    /// Drops values rejected by `predicate`.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + 'static) -> Stream<T> {
        let source = self.clone();
        let predicate = Rc::new(predicate);
        Stream::new(move |observer: Observer<T>| {
            let predicate = Rc::clone(&predicate);
            let downstream = observer.clone();
            source.subscribe(observer.relay(move |value| {
                if predicate(&value) {
                    downstream.next(value);
                }
            }))
        })
    }

    /// Maps every value to an inner stream, keeping only the latest one
    /// subscribed.
    ///
    /// Completes when the source has completed and the current inner stream
    /// (if any) has completed too.
    pub fn switch_map<U: 'static>(&self, f: impl Fn(T) -> Stream<U> + 'static) -> Stream<U> {
        let source = self.clone();
        let f = Rc::new(f);
        Stream::new(move |observer: Observer<U>| {
            let inner: Rc<RefCell<Option<Subscription>>> = Rc::default();
            let generation = Rc::new(Cell::new(0u64));
            let outer_done = Rc::new(Cell::new(false));

            let on_value = {
                let f = Rc::clone(&f);
                let inner = Rc::clone(&inner);
                let generation = Rc::clone(&generation);
                let outer_done = Rc::clone(&outer_done);
                let observer = observer.clone();
                move |value: T| {
                    let previous = inner.borrow_mut().take();
                    if let Some(previous) = previous {
                        previous.unsubscribe();
                    }
                    let current = generation.get() + 1;
                    generation.set(current);

                    let next = observer.clone();
                    let failed = observer.clone();
                    let done = observer.clone();
                    let next_generation = Rc::clone(&generation);
                    let done_generation = Rc::clone(&generation);
                    let done_slot = Rc::clone(&inner);
                    let outer_done = Rc::clone(&outer_done);
                    let sink = Sink::new(move |value| {
                        if next_generation.get() == current {
                            next.next(value);
                        }
                    })
                    .on_error(move |err| failed.error(err))
                    .on_complete(move || {
                        if done_generation.get() != current {
                            return;
                        }
                        let finished = done_slot.borrow_mut().take();
                        drop(finished);
                        if outer_done.get() {
                            done.complete();
                        }
                    });

                    let subscription = f(value).subscribe(sink);
                    if generation.get() == current && !subscription.is_closed() {
                        *inner.borrow_mut() = Some(subscription);
                    } else {
                        subscription.unsubscribe();
                    }
                }
            };

            let on_complete = {
                let inner = Rc::clone(&inner);
                let outer_done = Rc::clone(&outer_done);
                let observer = observer.clone();
                move || {
                    outer_done.set(true);
                    if inner.borrow().is_none() {
                        observer.complete();
                    }
                }
            };

            let failed = observer.clone();
            let outer = source.subscribe(
                Sink::new(on_value)
                    .on_error(move |err| failed.error(err))
                    .on_complete(on_complete),
            );

            let teardown = Subscription::new();
            teardown.add(outer);
            teardown.add_fn(move || {
                generation.set(generation.get() + 1);
                let current = inner.borrow_mut().take();
                if let Some(current) = current {
                    current.unsubscribe();
                }
            });
            teardown
        })
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Emits `value` to every subscriber and then stays open.
    pub fn hold(value: T) -> Self {
        Stream::new(move |observer: Observer<T>| {
            observer.next(value.clone());
            Subscription::new()
        })
    }

    /// Emits `value` to every subscriber and completes.
    pub fn just(value: T) -> Self {
        Stream::new(move |observer: Observer<T>| {
            observer.next(value.clone());
            observer.complete();
            Subscription::new()
        })
    }

    /// Suppresses values equal (per `same`) to the previously emitted one.
    pub fn dedup_by(&self, same: impl Fn(&T, &T) -> bool + 'static) -> Stream<T> {
        let source = self.clone();
        let same = Rc::new(same);
        Stream::new(move |observer: Observer<T>| {
            let same = Rc::clone(&same);
            let last: Rc<RefCell<Option<T>>> = Rc::default();
            let downstream = observer.clone();
            source.subscribe(observer.relay(move |value: T| {
                let duplicate = last
                    .borrow()
                    .as_ref()
                    .is_some_and(|previous| same(previous, &value));
                if duplicate {
                    return;
                }
                *last.borrow_mut() = Some(value.clone());
                downstream.next(value);
            }))
        })
    }

    /// Suppresses values equal to the previously emitted one.
    pub fn dedup(&self) -> Stream<T>
    where
        T: PartialEq,
    {
        self.dedup_by(|a, b| a == b)
    }

    /// Rate-limits the stream to one value per window.
    ///
    /// With `leading`, the first value of a quiet period is emitted at once
    /// and opens a window. With `trailing`, the latest value seen during a
    /// window is emitted when it closes, which opens the next window.
    pub fn throttle(&self, config: ThrottleConfig) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |observer: Observer<T>| {
            let state = Rc::new(RefCell::new(ThrottleState::<T> {
                timer: None,
                pending: None,
            }));

            let on_value = {
                let state = Rc::clone(&state);
                let observer = observer.clone();
                move |value: T| {
                    let windowed = state.borrow().timer.is_some();
                    if windowed {
                        if config.trailing {
                            state.borrow_mut().pending = Some(value);
                        }
                        return;
                    }
                    open_window(&state, &observer, config);
                    if config.leading {
                        observer.next(value);
                    } else if config.trailing {
                        state.borrow_mut().pending = Some(value);
                    }
                }
            };

            let on_complete = {
                let state = Rc::clone(&state);
                let observer = observer.clone();
                move || {
                    let pending = state.borrow_mut().pending.take();
                    if let Some(value) = pending {
                        observer.next(value);
                    }
                    observer.complete();
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
            teardown.add_fn(move || {
                let timer = {
                    let mut state = state.borrow_mut();
                    state.pending = None;
                    state.timer.take()
                };
                if let Some(timer) = timer {
                    timer.abort();
                }
            });
            teardown
        })
    }
}

/// Window configuration for [`Stream::throttle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Length of each throttle window.
    pub window: Duration,
    /// Emit the first value of a quiet period immediately.
    pub leading: bool,
    /// Emit the last value seen during a window when it closes.
    pub trailing: bool,
}

impl ThrottleConfig {
    /// Leading and trailing throttle over `window`.
    pub fn both(window: Duration) -> Self {
        Self {
            window,
            leading: true,
            trailing: true,
        }
    }
}

struct ThrottleState<T> {
    timer: Option<JoinHandle<()>>,
    pending: Option<T>,
}

fn open_window<T: Clone + 'static>(
    state: &Rc<RefCell<ThrottleState<T>>>,
    observer: &Observer<T>,
    config: ThrottleConfig,
) {
    let task_state = Rc::clone(state);
    let task_observer = observer.clone();
    let handle = tokio::task::spawn_local(async move {
        tokio::time::sleep(config.window).await;
        let pending = {
            let mut state = task_state.borrow_mut();
            state.timer = None;
            state.pending.take()
        };
        if let Some(value) = pending {
            trace!(window_ms = config.window.as_millis() as u64, "throttle trailing emit");
            open_window(&task_state, &task_observer, config);
            task_observer.next(value);
        }
    });
    state.borrow_mut().timer = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::Subject;

    fn recorder<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(T) + 'static) {
        let seen: Rc<RefCell<Vec<T>>> = Rc::default();
        let sink = {
            let seen = Rc::clone(&seen);
            move |value: T| seen.borrow_mut().push(value)
        };
        (seen, sink)
    }

    #[test]
    fn unsubscribe_runs_teardown_once() {
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        let subscription = Subscription::from_fn(move || counter.set(counter.get() + 1));
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert_eq!(runs.get(), 1);
        assert!(subscription.is_closed());
    }

    #[test]
    fn teardown_added_after_close_runs_immediately() {
        let subscription = Subscription::new();
        subscription.unsubscribe();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        subscription.add_fn(move || flag.set(true));
        assert!(ran.get());
    }

    #[test]
    fn map_filter_and_dedup_compose() {
        let subject = Subject::new();
        let (seen, sink) = recorder();
        let _sub = subject
            .stream()
            .map(|n: i32| n * 10)
            .filter(|n| *n != 30)
            .dedup()
            .for_each(sink);
        for n in [1, 1, 2, 3, 2] {
            subject.next(n);
        }
        assert_eq!(*seen.borrow(), vec![10, 20]);
    }

    #[test]
    fn dedup_by_uses_custom_equality() {
        let subject = Subject::new();
        let (seen, sink) = recorder();
        let _sub = subject
            .stream()
            .dedup_by(|a: &String, b: &String| a.eq_ignore_ascii_case(b))
            .for_each(sink);
        for word in ["a", "A", "b"] {
            subject.next(word.to_string());
        }
        assert_eq!(*seen.borrow(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn try_map_error_terminates_stream() {
        let subject = Subject::new();
        let (seen, sink) = recorder();
        let failure: Rc<RefCell<Option<EngineError>>> = Rc::default();
        let failure_slot = Rc::clone(&failure);
        let sub = subject
            .stream()
            .try_map(|n: i32| {
                if n < 0 {
                    Err(EngineError::Projection("negative".into()))
                } else {
                    Ok(n)
                }
            })
            .subscribe(Sink::new(sink).on_error(move |err| *failure_slot.borrow_mut() = Some(err)));
        subject.next(1);
        subject.next(-1);
        subject.next(2);
        assert_eq!(*seen.borrow(), vec![1]);
        assert!(matches!(*failure.borrow(), Some(EngineError::Projection(_))));
        assert!(sub.is_closed());
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn switch_map_drops_previous_inner() {
        let outer = Subject::new();
        let first = Subject::new();
        let second = Subject::new();
        let inners = vec![first.clone(), second.clone()];
        let (seen, sink) = recorder();
        let _sub = outer
            .stream()
            .switch_map(move |index: usize| inners[index].stream())
            .for_each(sink);

        outer.next(0);
        first.next("a");
        outer.next(1);
        first.next("stale");
        second.next("b");

        assert_eq!(*seen.borrow(), vec!["a", "b"]);
        assert_eq!(first.observer_count(), 0);
        assert_eq!(second.observer_count(), 1);
    }

    #[test]
    fn switch_map_completes_after_outer_and_inner() {
        let outer = Subject::new();
        let inner = Subject::<i32>::new();
        let completed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&completed);
        let inner_stream = inner.stream();
        let _sub = outer
            .stream()
            .switch_map(move |_: ()| inner_stream.clone())
            .subscribe(Sink::new(|_| {}).on_complete(move || flag.set(true)));
        outer.next(());
        outer.complete();
        assert!(!completed.get());
        inner.complete();
        assert!(completed.get());
    }

    #[test]
    fn merge_completes_when_all_inputs_complete() {
        let a = Subject::new();
        let b = Subject::new();
        let (seen, sink) = recorder();
        let completed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&completed);
        let _sub = Stream::merge(vec![a.stream(), b.stream()])
            .subscribe(Sink::new(sink).on_complete(move || flag.set(true)));
        a.next(1);
        b.next(2);
        a.complete();
        b.next(3);
        assert!(!completed.get());
        b.complete();
        assert!(completed.get());
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn hold_and_just_emit_on_subscribe() {
        let (seen, sink) = recorder();
        let held = Stream::hold(5).for_each(sink);
        assert!(!held.is_closed());
        assert_eq!(*seen.borrow(), vec![5]);

        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        let just = Stream::just(6).subscribe(Sink::new(|_| {}).on_complete(move || flag.set(true)));
        assert!(done.get());
        assert!(just.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_emits_leading_and_trailing() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let subject = Subject::new();
                let (seen, sink) = recorder();
                let _sub = subject
                    .stream()
                    .throttle(ThrottleConfig::both(Duration::from_millis(100)))
                    .for_each(sink);

                subject.next(1);
                subject.next(2);
                subject.next(3);
                assert_eq!(*seen.borrow(), vec![1]);

                tokio::time::sleep(Duration::from_millis(101)).await;
                tokio::task::yield_now().await;
                assert_eq!(*seen.borrow(), vec![1, 3]);

                // The trailing emit opened a new window.
                subject.next(4);
                assert_eq!(*seen.borrow(), vec![1, 3]);
                tokio::time::sleep(Duration::from_millis(101)).await;
                tokio::task::yield_now().await;
                assert_eq!(*seen.borrow(), vec![1, 3, 4]);

                // Quiet period: the next value leads again.
                tokio::time::sleep(Duration::from_millis(200)).await;
                subject.next(5);
                assert_eq!(*seen.borrow(), vec![1, 3, 4, 5]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_teardown_cancels_pending_trailing() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let subject = Subject::new();
                let (seen, sink) = recorder();
                let sub = subject
                    .stream()
                    .throttle(ThrottleConfig::both(Duration::from_millis(100)))
                    .for_each(sink);
                subject.next(1);
                subject.next(2);
                sub.unsubscribe();
                tokio::time::sleep(Duration::from_millis(150)).await;
                tokio::task::yield_now().await;
                assert_eq!(*seen.borrow(), vec![1]);
            })
            .await;
    }
}
