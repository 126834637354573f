//! Failure causes carried by callbacks.
//!
//! A [`Cause`] is a cheaply clonable, identity-comparable handle around an
//! arbitrary error. Besides the wrapped error it carries a list of
//! *suppressed* causes: causes that reached the same callback after the
//! outcome had already been decided and so were never delivered on their own.

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Boxed error accepted by [`Cause::new`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A shared failure cause.
///
/// Clones refer to the same cause: [`Cause::ptr_eq`] compares identity, not
/// content, so two causes built from equal messages are still different causes.
#[derive(Clone)]
pub struct Cause(Arc<Inner>);

struct Inner {
    error: BoxError,
    suppressed: Mutex<Vec<Cause>>,
}

impl Cause {
    /// Wrap an error. Wrapping another `Cause` makes it the source of the new one.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(Arc::new(Inner {
            error: error.into(),
            suppressed: Mutex::new(Vec::new()),
        }))
    }

    /// Cause with a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }

    /// The wrapped error.
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.0.error.as_ref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.error.downcast_ref::<E>()
    }

    /// True if both handles refer to the same cause.
    pub fn ptr_eq(&self, other: &Cause) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Snapshot of the causes suppressed by this one, in arrival order.
    pub fn suppressed(&self) -> Vec<Cause> {
        self.0
            .suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record `late` as suppressed by this cause.
    ///
    /// Nothing is recorded when the two causes are already associated, which
    /// also rules out self-suppression and cycles.
    pub fn add_suppressed(&self, late: &Cause) {
        if Cause::are_associated(self, late) {
            return;
        }
        self.0
            .suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(late.clone());
    }

    /// True if `a` and `b` are the same cause, or if either one reaches the
    /// other through its suppressed causes or its source chain.
    pub fn are_associated(a: &Cause, b: &Cause) -> bool {
        a.reaches(b, &mut HashSet::new()) || b.reaches(a, &mut HashSet::new())
    }

    /// Depth-first search over sources and suppressed causes. `visited`
    /// bounds the walk when concurrent suppression has built a cycle.
    fn reaches(&self, target: &Cause, visited: &mut HashSet<*const Inner>) -> bool {
        if self.ptr_eq(target) {
            return true;
        }
        if !visited.insert(Arc::as_ptr(&self.0)) {
            return false;
        }
        for source in self.sources() {
            if source.reaches(target, visited) {
                return true;
            }
        }
        self.suppressed()
            .iter()
            .any(|s| s.reaches(target, visited))
    }

    /// Causes found in the source chain of the wrapped error.
    fn sources(&self) -> impl Iterator<Item = &Cause> {
        let first: &(dyn StdError + 'static) = &*self.0.error;
        let mut next = Some(first);
        std::iter::from_fn(move || {
            while let Some(error) = next {
                next = error.source();
                if let Some(cause) = error.downcast_ref::<Cause>() {
                    return Some(cause);
                }
            }
            None
        })
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.error, f)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cause")
            .field("error", &self.0.error)
            .field("suppressed", &self.suppressed().len())
            .finish()
    }
}

impl StdError for Cause {
    /// A wrapped `Cause` is the source; any other error is shown by
    /// `Display` already, so the chain continues with its own source.
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        let error: &(dyn StdError + 'static) = &*self.0.error;
        if error.is::<Cause>() {
            Some(error)
        } else {
            error.source()
        }
    }
}
