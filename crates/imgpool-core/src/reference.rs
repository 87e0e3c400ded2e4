//! Reference-counted handles to pooled values.
//!
//! A `SharedReference` owns a value plus the releaser that takes it back.
//! `CloseableReference` is the per-holder handle: cloning a handle adds a
//! reference, closing (or dropping) it deletes one. When the count reaches
//! zero the value is handed to the releaser exactly once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Receives a value once nothing references it anymore.
pub trait ResourceReleaser<T>: Send + Sync {
    fn release(&self, value: T);
}

impl<T, F> ResourceReleaser<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn release(&self, value: T) {
        self(value)
    }
}

struct SharedState<T> {
    value: Option<T>,
    ref_count: usize,
}

/// The shared, counted part of a reference.
pub struct SharedReference<T> {
    state: Mutex<SharedState<T>>,
    releaser: Arc<dyn ResourceReleaser<T>>,
}

impl<T> SharedReference<T> {
    /// Wrap `value` with a reference count of one.
    pub fn new(value: T, releaser: Arc<dyn ResourceReleaser<T>>) -> Self {
        Self {
            state: Mutex::new(SharedState {
                value: Some(value),
                ref_count: 1,
            }),
            releaser,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ref_count(&self) -> usize {
        self.lock().ref_count
    }

    pub fn is_valid(&self) -> bool {
        self.lock().ref_count > 0
    }

    /// Add one reference.
    ///
    /// # Panics
    /// If the count already reached zero. Reviving a released value is a
    /// contract violation.
    pub fn add_reference(&self) {
        let mut state = self.lock();
        assert!(state.ref_count > 0, "add_reference on a released SharedReference");
        state.ref_count += 1;
    }

    /// Delete one reference, releasing the value when the count reaches zero.
    /// Returns the remaining count.
    ///
    /// # Panics
    /// If the count already reached zero.
    pub fn delete_reference(&self) -> usize {
        let released = {
            let mut state = self.lock();
            assert!(
                state.ref_count > 0,
                "delete_reference on a released SharedReference"
            );
            state.ref_count -= 1;
            if state.ref_count == 0 {
                state.value.take()
            } else {
                return state.ref_count;
            }
        };
        if let Some(value) = released {
            self.releaser.release(value);
        }
        0
    }

    /// Run `f` on the value, or fail with `Closed` once released.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let state = self.lock();
        state.value.as_ref().map(f).ok_or(Error::Closed)
    }

    /// Run `f` on the value mutably, or fail with `Closed` once released.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut state = self.lock();
        state.value.as_mut().map(f).ok_or(Error::Closed)
    }
}

impl<T> fmt::Debug for SharedReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedReference")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// A holder's handle on a `SharedReference`.
pub struct CloseableReference<T> {
    shared: Arc<SharedReference<T>>,
    closed: bool,
}

impl<T: 'static> CloseableReference<T> {
    /// Wrap `value` so that `releaser` receives it after the last close.
    pub fn of(value: T, releaser: Arc<dyn ResourceReleaser<T>>) -> Self {
        Self {
            shared: Arc::new(SharedReference::new(value, releaser)),
            closed: false,
        }
    }

    /// Wrap `value` so that it is dropped after the last close.
    pub fn new(value: T) -> Self {
        Self::of(value, Arc::new(|value: T| drop(value)))
    }
}

impl<T> CloseableReference<T> {
    /// Take another handle on the same value.
    pub fn try_clone(&self) -> Result<Self> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.shared.add_reference();
        Ok(Self {
            shared: Arc::clone(&self.shared),
            closed: false,
        })
    }

    /// Like `try_clone`, but `None` for a closed handle.
    pub fn clone_or_none(&self) -> Option<Self> {
        self.try_clone().ok()
    }

    /// Give up this handle. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.delete_reference();
    }

    pub fn is_valid(&self) -> bool {
        !self.closed
    }

    /// Run `f` on the value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.shared.with(f)
    }

    /// Run `f` on the value mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.shared.with_mut(f)
    }

    /// Count on the shared part (diagnostics only).
    pub fn shared_ref_count(&self) -> usize {
        self.shared.ref_count()
    }

    pub fn underlying(&self) -> &Arc<SharedReference<T>> {
        &self.shared
    }
}

impl<T: Clone> CloseableReference<T> {
    /// A copy of the value. Meant for handle-like values such as chunks.
    pub fn get(&self) -> Result<T> {
        self.with(T::clone)
    }
}

impl<T> Drop for CloseableReference<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for CloseableReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseableReference")
            .field("closed", &self.closed)
            .field("shared", &self.shared)
            .finish()
    }
}
