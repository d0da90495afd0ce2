//! Backend registry and round-robin selection.
//!
//! The registry owns the fixed, ordered set of backends and a rotation
//! cursor. Selection is lock-free: each call claims its own start position
//! with a single `fetch_add`, so concurrent callers never start at the same
//! backend, and then scans all backends locally from there.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::RegistryError;
use crate::proxy::backend::Backend;

/// Outcome of a selection attempt.
#[derive(Debug)]
pub enum Selection<'a, B> {
    /// The next live backend in rotation order.
    Found(&'a B),
    /// Every backend was checked and none was alive.
    Unavailable,
}

/// Ordered pool of backends with a shared rotation cursor.
#[derive(Debug)]
pub struct Registry<B> {
    backends: Vec<B>,
    cursor: AtomicUsize,
}

impl<B: Backend> Registry<B> {
    /// Creates a registry over `backends`, which must not be empty.
    ///
    /// Order is significant: it is the rotation order.
    pub fn new(backends: Vec<B>) -> Result<Self, RegistryError> {
        if backends.is_empty() {
            return Err(RegistryError::Empty);
        }

        Ok(Self {
            backends,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Selects the next live backend.
    ///
    /// Every backend is inspected at most once per call, starting at the
    /// claimed cursor position. Dead backends skipped on the way are consumed
    /// too, so the following call starts right after the chosen one.
    pub fn next(&self) -> Selection<'_, B> {
        let n = self.backends.len();
        // The counter wraps at usize::MAX; one uneven step there is tolerated.
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..n {
            let candidate = &self.backends[start.wrapping_add(offset) % n];

            if candidate.is_alive() {
                if offset > 0 {
                    self.cursor.fetch_add(offset, Ordering::Relaxed);
                }
                return Selection::Found(candidate);
            }

            tracing::trace!(backend = candidate.address(), "Skipping dead backend");
        }

        Selection::Unavailable
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Backends in rotation order.
    pub fn backends(&self) -> &[B] {
        &self.backends
    }

    /// Number of backends currently reporting alive.
    pub fn live_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }
}
