//! Hot multicast streams.
//!
//! A [`Subject`] is both a sink and a source: values pushed into it are
//! delivered to every current subscriber. The replaying variant also hands
//! the latest value to late subscribers, which is what the query cache needs
//! so that a second consumer of a live query sees the current result without
//! waiting for the next change.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::EngineError;
use crate::stream::{Observer, Sink, Stream, Subscription};

#[derive(Clone)]
enum Termination {
    Completed,
    Failed(EngineError),
}

struct SubjectInner<T> {
    observers: RefCell<Vec<(u64, Observer<T>)>>,
    next_id: Cell<u64>,
    replay: bool,
    latest: RefCell<Option<T>>,
    terminated: RefCell<Option<Termination>>,
}

/// Multicast source that pushes values to all current subscribers.
pub struct Subject<T> {
    inner: Rc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Subject<T> {
    /// Creates a subject without replay.
    pub fn new() -> Self {
        Self::with_replay(false)
    }

    /// Creates a subject that replays its latest value to new subscribers.
    pub fn replay_latest() -> Self {
        Self::with_replay(true)
    }

    fn with_replay(replay: bool) -> Self {
        Self {
            inner: Rc::new(SubjectInner {
                observers: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                replay,
                latest: RefCell::new(None),
                terminated: RefCell::new(None),
            }),
        }
    }

    /// Pushes a value to every current subscriber.
    pub fn next(&self, value: T) {
        if self.inner.terminated.borrow().is_some() {
            return;
        }
        if self.inner.replay {
            *self.inner.latest.borrow_mut() = Some(value.clone());
        }
        for observer in self.snapshot() {
            observer.next(value.clone());
        }
    }

    /// Terminates every subscriber with `err`.
    pub fn error(&self, err: EngineError) {
        if !self.terminate(Termination::Failed(err.clone())) {
            return;
        }
        for observer in self.drain() {
            observer.error(err.clone());
        }
    }

    /// Completes every subscriber.
    pub fn complete(&self) {
        if !self.terminate(Termination::Completed) {
            return;
        }
        for observer in self.drain() {
            observer.complete();
        }
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    /// Returns whether both handles point at the same subject.
    pub fn ptr_eq(&self, other: &Subject<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// A sink that pushes into this subject.
    pub fn sink(&self) -> Sink<T> {
        let next = self.clone();
        let failed = self.clone();
        let done = self.clone();
        Sink::new(move |value| next.next(value))
            .on_error(move |err| failed.error(err))
            .on_complete(move || done.complete())
    }

    /// A stream view of this subject.
    pub fn stream(&self) -> Stream<T> {
        let inner = Rc::clone(&self.inner);
        Stream::new(move |observer: Observer<T>| {
            if inner.replay {
                let latest = inner.latest.borrow().clone();
                if let Some(value) = latest {
                    observer.next(value);
                }
            }
            let termination = inner.terminated.borrow().clone();
            match termination {
                Some(Termination::Completed) => {
                    observer.complete();
                    return Subscription::new();
                }
                Some(Termination::Failed(err)) => {
                    observer.error(err);
                    return Subscription::new();
                }
                None => {}
            }
            let id = inner.next_id.get();
            inner.next_id.set(id + 1);
            inner.observers.borrow_mut().push((id, observer));
            let registry = Rc::downgrade(&inner);
            Subscription::from_fn(move || {
                if let Some(inner) = registry.upgrade() {
                    let removed = {
                        let mut observers = inner.observers.borrow_mut();
                        observers
                            .iter()
                            .position(|(candidate, _)| *candidate == id)
                            .map(|index| observers.remove(index))
                    };
                    drop(removed);
                }
            })
        })
    }

    fn terminate(&self, termination: Termination) -> bool {
        let mut slot = self.inner.terminated.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(termination);
        true
    }

    fn snapshot(&self) -> Vec<Observer<T>> {
        self.inner
            .observers
            .borrow()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    fn drain(&self) -> Vec<Observer<T>> {
        std::mem::take(&mut *self.inner.observers.borrow_mut())
            .into_iter()
            .map(|(_, observer)| observer)
            .collect()
    }
}

struct ShareState<T> {
    subject: Option<Subject<T>>,
    upstream: Option<Subscription>,
    ref_count: usize,
}

impl<T: Clone + 'static> Stream<T> {
    /// Shares one upstream subscription among all subscribers and replays the
    /// latest value to late joiners.
    ///
    /// The upstream is connected by the first subscriber and torn down when
    /// the last one leaves; the next subscriber starts from scratch.
    pub fn share_replay(&self) -> Stream<T> {
        let source = self.clone();
        let state = Rc::new(RefCell::new(ShareState::<T> {
            subject: None,
            upstream: None,
            ref_count: 0,
        }));
        Stream::new(move |observer: Observer<T>| {
            let (subject, connect) = {
                let mut state = state.borrow_mut();
                state.ref_count += 1;
                let connect = state.subject.is_none();
                let subject = state
                    .subject
                    .get_or_insert_with(Subject::replay_latest)
                    .clone();
                (subject, connect)
            };

            let downstream = subject.stream().subscribe(Sink::forward(observer));

            if connect {
                let upstream = source.subscribe(subject.sink());
                let mut shared = state.borrow_mut();
                let still_current = shared
                    .subject
                    .as_ref()
                    .is_some_and(|current| current.ptr_eq(&subject));
                if still_current {
                    shared.upstream = Some(upstream);
                } else {
                    drop(shared);
                    upstream.unsubscribe();
                }
            }

            let teardown = Subscription::new();
            teardown.add(downstream);
            let state = Rc::clone(&state);
            teardown.add_fn(move || {
                let upstream = {
                    let mut state = state.borrow_mut();
                    state.ref_count -= 1;
                    if state.ref_count > 0 {
                        None
                    } else {
                        state.subject = None;
                        state.upstream.take()
                    }
                };
                if let Some(upstream) = upstream {
                    upstream.unsubscribe();
                }
            });
            teardown
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_delivers_to_all_subscribers() {
        let subject = Subject::new();
        let a: Rc<RefCell<Vec<i32>>> = Rc::default();
        let b: Rc<RefCell<Vec<i32>>> = Rc::default();
        let (sa, sb) = (Rc::clone(&a), Rc::clone(&b));
        let first = subject.stream().for_each(move |v| sa.borrow_mut().push(v));
        let _second = subject.stream().for_each(move |v| sb.borrow_mut().push(v));
        subject.next(1);
        first.unsubscribe();
        subject.next(2);
        assert_eq!(*a.borrow(), vec![1]);
        assert_eq!(*b.borrow(), vec![1, 2]);
        assert_eq!(subject.observer_count(), 1);
    }

    #[test]
    fn replay_subject_hands_latest_to_late_subscriber() {
        let subject = Subject::replay_latest();
        subject.next("old");
        subject.next("new");
        let seen: Rc<RefCell<Vec<&str>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let _sub = subject.stream().for_each(move |v| sink.borrow_mut().push(v));
        assert_eq!(*seen.borrow(), vec!["new"]);
    }

    #[test]
    fn completed_subject_completes_late_subscribers() {
        let subject = Subject::<u8>::new();
        subject.complete();
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        let sub = subject
            .stream()
            .subscribe(Sink::new(|_| {}).on_complete(move || flag.set(true)));
        assert!(done.get());
        assert!(sub.is_closed());
    }

    #[test]
    fn share_replay_connects_once_and_resets_at_zero() {
        let source = Subject::new();
        let connections = Rc::new(Cell::new(0));
        let counter = Rc::clone(&connections);
        let upstream = source.stream();
        let shared = Stream::defer(move || {
            counter.set(counter.get() + 1);
            upstream.clone()
        })
        .share_replay();

        let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
        let (s1, s2) = (Rc::clone(&seen), Rc::clone(&seen));
        let first = shared.for_each(move |v| s1.borrow_mut().push(v));
        source.next(1);
        let second = shared.for_each(move |v| s2.borrow_mut().push(v * 100));
        assert_eq!(connections.get(), 1);
        assert_eq!(*seen.borrow(), vec![1, 100]);

        first.unsubscribe();
        assert_eq!(source.observer_count(), 1);
        second.unsubscribe();
        second.unsubscribe();
        assert_eq!(source.observer_count(), 0);

        let _third = shared.for_each(|_| {});
        assert_eq!(connections.get(), 2);
    }
}
