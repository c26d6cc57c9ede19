//! Tagged success/failure values with a side-channel attachment bag.
//!
//! [`Outcome`] replaces panics and `Err` for recoverable conditions: a live
//! query that currently matches nothing is not broken, it is a `warn`
//! outcome that resolves on the next successful evaluation. Failures flow
//! through streams as ordinary values.
//!
//! Attachments carry auxiliary computed data (for example the visibility
//! summary of a match set) without widening the primary value type. Each key
//! is write-once per outcome; writing it twice, or merging two bags that share
//! a key, is an [`EngineError`].
//!
//! # Example
//!
//! ```
//! use livequery_core::outcome::{AttachmentKey, Outcome, Severity};
//!
//! const ATTEMPTS: AttachmentKey<u32> = AttachmentKey::new("attempts");
//!
//! let mut outcome = Outcome::ok("button");
//! outcome.attach(&ATTEMPTS, 3).unwrap();
//! assert!(outcome.attach(&ATTEMPTS, 4).is_err());
//!
//! let failed: Outcome<&str> = Outcome::error("matched 0 elements.", Severity::Warn);
//! assert_eq!(failed.severity(), Some(Severity::Warn));
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::EngineError;
use crate::stream::Stream;

/// How serious a failed [`Outcome`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Transient or recoverable; expected to resolve on a later evaluation.
    Warn,
    /// Malformed input; will not resolve without a different input.
    Err,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warn => f.write_str("warn"),
            Severity::Err => f.write_str("err"),
        }
    }
}

/// Typed identifier into an [`Attachments`] bag.
///
/// Keys are identified by name; the type parameter fixes the value type
/// stored under that name.
pub struct AttachmentKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> AttachmentKey<T> {
    /// Declares a key. Usable in `const` items.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    /// The key's name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for AttachmentKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentKey({})", self.name)
    }
}

/// Write-once bag of auxiliary values keyed by [`AttachmentKey`].
#[derive(Clone, Default)]
pub struct Attachments {
    entries: BTreeMap<&'static str, Rc<dyn Any>>,
}

impl Attachments {
    /// Stores `value` under `key`.
    pub fn insert<A: 'static>(&mut self, key: &AttachmentKey<A>, value: A) -> Result<(), EngineError> {
        if self.entries.contains_key(key.name) {
            return Err(EngineError::DuplicateAttachment(key.name));
        }
        self.entries.insert(key.name, Rc::new(value));
        Ok(())
    }

    /// Reads the value under `key`, if present with the expected type.
    pub fn get<A: 'static>(&self, key: &AttachmentKey<A>) -> Option<&A> {
        self.entries.get(key.name).and_then(|value| value.downcast_ref())
    }

    /// Unions `other` into this bag.
    ///
    /// Fails without modifying `self` if any key is present on both sides.
    pub fn merge(&mut self, other: &Attachments) -> Result<(), EngineError> {
        if let Some(name) = other.entries.keys().find(|name| self.entries.contains_key(*name)) {
            return Err(EngineError::AttachmentCollision(*name));
        }
        for (name, value) in &other.entries {
            self.entries.insert(*name, Rc::clone(value));
        }
        Ok(())
    }

    /// Names of all stored keys, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no key is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[derive(Debug, Clone)]
enum State<T> {
    Ok(T),
    Failed { error: String, severity: Severity },
}

/// A success value or a failure message with severity, plus attachments that
/// survive both paths.
#[derive(Clone)]
pub struct Outcome<T> {
    state: State<T>,
    attachments: Attachments,
}

impl<T> Outcome<T> {
    /// A success with no attachments.
    pub fn ok(value: T) -> Self {
        Self {
            state: State::Ok(value),
            attachments: Attachments::default(),
        }
    }

    /// A failure with no attachments.
    pub fn error(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            state: State::Failed {
                error: message.into(),
                severity,
            },
            attachments: Attachments::default(),
        }
    }

    /// Shorthand for a [`Severity::Warn`] failure.
    pub fn warn(message: impl Into<String>) -> Self {
        Self::error(message, Severity::Warn)
    }

    /// Returns whether this is a success.
    pub fn is_ok(&self) -> bool {
        matches!(self.state, State::Ok(_))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&T> {
        match &self.state {
            State::Ok(value) => Some(value),
            State::Failed { .. } => None,
        }
    }

    /// Consumes the outcome, returning the success value if any.
    pub fn into_value(self) -> Option<T> {
        match self.state {
            State::Ok(value) => Some(value),
            State::Failed { .. } => None,
        }
    }

    /// The failure message, if any.
    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            State::Ok(_) => None,
            State::Failed { error, .. } => Some(error),
        }
    }

    /// The failure severity, if any.
    pub fn severity(&self) -> Option<Severity> {
        match &self.state {
            State::Ok(_) => None,
            State::Failed { severity, .. } => Some(*severity),
        }
    }

    /// The attachment bag.
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    /// Reads one attachment.
    pub fn attachment<A: 'static>(&self, key: &AttachmentKey<A>) -> Option<&A> {
        self.attachments.get(key)
    }

    /// Writes one attachment. Fails if `key` is already set.
    pub fn attach<A: 'static>(&mut self, key: &AttachmentKey<A>, value: A) -> Result<(), EngineError> {
        self.attachments.insert(key, value)
    }

    /// Builder form of [`attach`](Self::attach).
    pub fn with_attachment<A: 'static>(mut self, key: &AttachmentKey<A>, value: A) -> Result<Self, EngineError> {
        self.attach(key, value)?;
        Ok(self)
    }

    /// Unions `other` into this outcome's attachments. Fails on collision.
    pub fn merge_with(&mut self, other: &Attachments) -> Result<(), EngineError> {
        self.attachments.merge(other)
    }

    /// Transforms the success value, keeping attachments. Failures pass
    /// through untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        let state = match self.state {
            State::Ok(value) => State::Ok(f(value)),
            State::Failed { error, severity } => State::Failed { error, severity },
        };
        Outcome {
            state,
            attachments: self.attachments,
        }
    }

    /// Chains a fallible step. On success the step's attachments are merged
    /// with this outcome's; on failure this outcome passes through.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Result<Outcome<U>, EngineError> {
        match self.into_parts() {
            Ok((value, attachments)) => {
                let mut next = f(value);
                next.merge_with(&attachments)?;
                Ok(next)
            }
            Err(failure) => Ok(failure),
        }
    }

    /// Splits a success into its value and attachments, or re-types a failure.
    pub fn into_parts<U>(self) -> Result<(T, Attachments), Outcome<U>> {
        match self.state {
            State::Ok(value) => Ok((value, self.attachments)),
            State::Failed { error, severity } => Err(Outcome {
                state: State::Failed { error, severity },
                attachments: self.attachments,
            }),
        }
    }
}

/// Equality used for de-duplication: both successes with equal values, or
/// both failures with identical message and severity. Attachments are not
/// compared.
impl<T: PartialEq> PartialEq for Outcome<T> {
    fn eq(&self, other: &Self) -> bool {
        same_outcome(self, other)
    }
}

/// See the [`PartialEq`] impl on [`Outcome`].
pub fn same_outcome<T: PartialEq>(a: &Outcome<T>, b: &Outcome<T>) -> bool {
    match (&a.state, &b.state) {
        (State::Ok(left), State::Ok(right)) => left == right,
        (
            State::Failed {
                error: left_error,
                severity: left_severity,
            },
            State::Failed {
                error: right_error,
                severity: right_severity,
            },
        ) => left_error == right_error && left_severity == right_severity,
        _ => false,
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Outcome");
        match &self.state {
            State::Ok(value) => debug.field("ok", &true).field("value", value),
            State::Failed { error, severity } => debug
                .field("ok", &false)
                .field("error", error)
                .field("severity", severity),
        };
        debug.field("attachments", &self.attachments).finish()
    }
}

impl<T: Serialize> Serialize for Outcome<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.state {
            State::Ok(value) => {
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("value", value)?;
            }
            State::Failed { error, severity } => {
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("error", error)?;
                map.serialize_entry("severity", severity)?;
            }
        }
        if !self.attachments.is_empty() {
            let keys: Vec<&str> = self.attachments.keys().collect();
            map.serialize_entry("attachments", &keys)?;
        }
        map.end()
    }
}

impl<T: Clone + 'static> Stream<Outcome<T>> {
    /// Maps success values, passing failures through.
    pub fn map_ok<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Stream<Outcome<U>> {
        self.map(move |outcome| outcome.map(&f))
    }

    /// Chains a fallible step on success values. An attachment collision
    /// terminates the stream.
    pub fn and_then_ok<U: 'static>(&self, f: impl Fn(T) -> Outcome<U> + 'static) -> Stream<Outcome<U>> {
        self.try_map(move |outcome| outcome.and_then(&f))
    }

    /// Switches to a derived outcome stream for every success value.
    ///
    /// Failures are re-emitted as they are; the outer attachments are merged
    /// into every inner emission.
    pub fn switch_map_ok<U: Clone + 'static>(
        &self,
        f: impl Fn(T) -> Stream<Outcome<U>> + 'static,
    ) -> Stream<Outcome<U>> {
        self.switch_map(move |outcome| match outcome.into_parts::<U>() {
            Ok((value, attachments)) => f(value).try_map(move |mut inner| {
                inner.merge_with(&attachments)?;
                Ok(inner)
            }),
            Err(failure) => Stream::hold(failure),
        })
    }
}
