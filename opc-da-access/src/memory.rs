//! Ownership of server-allocated result buffers.
//!
//! Every bulk native call hands back one or more arrays that the server
//! allocated on the caller's behalf. [`RemoteArray`] owns such an array
//! together with the hook that gives it back to its allocator, so the buffer
//! is released exactly once, when the array is dropped, on every exit path.

use std::fmt;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A server-allocated array with a declared element count.
///
/// The declared count is what the server reported; reads never go past it,
/// even when the backing storage holds more elements.
pub struct RemoteArray<T> {
    items: Vec<T>,
    len: u32,
    release: Option<ReleaseHook>,
}

impl<T> RemoteArray<T> {
    /// An array whose storage the caller already owns.
    pub fn from_vec(items: Vec<T>) -> Self {
        let len = u32::try_from(items.len()).unwrap_or(u32::MAX);
        Self {
            items,
            len,
            release: None,
        }
    }

    /// An array with a declared count and a hook run once on drop.
    pub fn with_release(items: Vec<T>, len: u32, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            items,
            len,
            release: Some(Box::new(release)),
        }
    }

    /// Creates an empty `RemoteArray`.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            len: 0,
            release: None,
        }
    }

    /// The element count the server declared.
    pub const fn len(&self) -> u32 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The readable elements: at most the declared count.
    pub fn as_slice(&self) -> &[T] {
        let declared = usize::try_from(self.len).unwrap_or(usize::MAX);
        &self.items[..declared.min(self.items.len())]
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<'a, T> IntoIterator for &'a RemoteArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> Default for RemoteArray<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for RemoteArray<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RemoteArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteArray")
            .field("len", &self.len)
            .field("items", &self.as_slice())
            .field("owned", &self.release.is_some())
            .finish()
    }
}
