//! The [Cause] of a failed computation and the [Exit] of a finished one.

use crate::FiberId;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::{any::Any, fmt};

/// The outcome of running an effect: the success value or the full [Cause] of its failure.
pub type Exit<E, A> = Result<A, Cause<E>>;

/// An unexpected, unrecoverable failure. Panics raised inside effects surface as defects.
#[derive(Clone)]
pub struct Defect(Arc<anyhow::Error>);

impl Defect {
    /// Wraps an error as a [Defect].
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Creates a [Defect] carrying only a message.
    pub fn message(msg: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Converts a panic payload, as returned by `catch_unwind`, into a [Defect].
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = match payload.downcast::<String>() {
            Ok(msg) => *msg,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(msg) => String::from(*msg),
                Err(_) => String::from("panic with a non-string payload"),
            },
        };
        Self::message(msg)
    }

    /// Returns the underlying error.
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self.0)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.to_string() == other.0.to_string()
    }
}

/// A structured description of why a computation failed.
///
/// A cause is either a single typed failure, a [Defect], an interruption carrying the identity
/// of the interrupting fiber, or a composition of causes that happened one after another
/// ([Cause::Then]) or concurrently ([Cause::Both]).
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure. The identity for composition.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption by the given fiber.
    Interrupt(FiberId),
    /// Two causes that happened in sequence, such as a failure followed by a failing finalizer.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Two causes that happened concurrently, such as both sides of a merge failing.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// A typed failure.
    pub const fn fail(err: E) -> Self {
        Self::Fail(err)
    }

    /// A defect built from any error.
    pub fn die(err: impl Into<anyhow::Error>) -> Self {
        Self::Die(Defect::new(err))
    }

    /// An interruption by `by`.
    pub const fn interrupt(by: FiberId) -> Self {
        Self::Interrupt(by)
    }

    /// Sequential composition. Empty causes are absorbed.
    pub fn then(self, next: Self) -> Self {
        match (self, next) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (a, b) => Self::Then(Box::new(a), Box::new(b)),
        }
    }

    /// Parallel composition. Empty causes are absorbed.
    pub fn both(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (a, b) => Self::Both(Box::new(a), Box::new(b)),
        }
    }

    /// Returns true if the cause holds no failure of any kind.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Then(a, b) | Self::Both(a, b) => a.is_empty() && b.is_empty(),
            _ => false,
        }
    }

    /// Returns true if the cause contains at least one typed failure.
    pub fn is_failure(&self) -> bool {
        !self.failures().is_empty()
    }

    /// Returns true if the cause contains at least one defect.
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// Returns true if the cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// Returns true if the cause is made of interruptions and nothing else.
    pub fn is_interrupted_only(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Interrupt(_) => true,
            Self::Fail(_) | Self::Die(_) => false,
            Self::Then(a, b) | Self::Both(a, b) => {
                a.is_interrupted_only() && b.is_interrupted_only() && !self.is_empty()
            }
        }
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Self::Fail(e) = c {
                out.push(e);
            }
        });
        out
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Self::Die(d) = c {
                out.push(d);
            }
        });
        out
    }

    /// The identities of every fiber that contributed an interruption.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Self::Interrupt(id) = c {
                out.push(*id);
            }
        });
        out
    }

    /// Returns the first typed failure, or the cause itself if it holds none.
    pub fn failure_or_cause(self) -> Result<E, Self> {
        if !self.is_failure() {
            return Err(self);
        }
        let mut stack = Vec::from([self]);
        while let Some(cause) = stack.pop() {
            match cause {
                Self::Fail(e) => return Ok(e),
                Self::Then(a, b) | Self::Both(a, b) => {
                    stack.push(*b);
                    stack.push(*a);
                }
                _ => {}
            }
        }
        unreachable!("cause reported a failure but none was found")
    }

    /// Transforms every typed failure.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_inner(&mut f)
    }

    fn map_inner<E2>(self, f: &mut impl FnMut(E) -> E2) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Fail(f(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Then(a, b) => Cause::Then(Box::new(a.map_inner(f)), Box::new(b.map_inner(f))),
            Self::Both(a, b) => Cause::Both(Box::new(a.map_inner(f)), Box::new(b.map_inner(f))),
        }
    }

    /// Borrows every typed failure.
    pub fn as_ref(&self) -> Cause<&E> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Fail(e),
            Self::Die(d) => Cause::Die(d.clone()),
            Self::Interrupt(id) => Cause::Interrupt(*id),
            Self::Then(a, b) => Cause::Then(Box::new(Self::as_ref(a)), Box::new(Self::as_ref(b))),
            Self::Both(a, b) => Cause::Both(Box::new(Self::as_ref(a)), Box::new(Self::as_ref(b))),
        }
    }

    /// Drops every typed failure, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        match self {
            Self::Empty | Self::Fail(_) => Cause::Empty,
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Then(a, b) => a.strip_failures().then(b.strip_failures()),
            Self::Both(a, b) => a.strip_failures().both(b.strip_failures()),
        }
    }

    fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        let mut stack = Vec::from([self]);
        while let Some(cause) = stack.pop() {
            match cause {
                Self::Then(a, b) | Self::Both(a, b) => {
                    stack.push(b);
                    stack.push(a);
                }
                c => f(c),
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Fail(e) => write!(f, "Fail({e:?})"),
            Self::Die(d) => write!(f, "Die({d})"),
            Self::Interrupt(id) => write!(f, "Interrupt({id})"),
            Self::Then(a, b) => write!(f, "({a} then {b})"),
            Self::Both(a, b) => write!(f, "({a} and {b})"),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for Cause<E> {}
