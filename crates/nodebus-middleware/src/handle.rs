//! [`Registration`] – scoped handle returned by every subscribe / register
//! call.
//!
//! Releasing the handle (explicitly through [`Registration::release`] or by
//! dropping it) undoes the registration exactly once.  Use
//! [`Registration::detach`] to keep a registration alive for the lifetime of
//! its owner.

use std::fmt;

type Release = Box<dyn FnOnce() + Send + 'static>;

/// Deterministic unsubscribe / unregister handle.
#[must_use = "dropping a Registration immediately undoes the registration"]
pub struct Registration {
    name: String,
    release: Option<Release>,
}

impl Registration {
    pub(crate) fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    /// Combine two handles into one that releases both, `self` first.
    pub(crate) fn chain(mut self, mut other: Registration) -> Self {
        let first = self.release.take();
        let second = other.release.take();
        Registration::new(self.name.clone(), move || {
            if let Some(f) = first {
                f();
            }
            if let Some(f) = second {
                f();
            }
        })
    }

    /// Topic or service name this handle refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Undo the registration now.
    pub fn release(mut self) {
        self.run_release();
    }

    /// Keep the registration active for as long as the owning node lives.
    pub fn detach(mut self) {
        self.release = None;
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("active", &self.release.is_some())
            .finish()
    }
}
