//! Fixed-capacity instance table addressed by opaque handles

use core::fmt;

use crate::error::{Error, Result};

/// Maximum live instances per engine
pub const MAX_INSTANCES: usize = 4;

/// Opaque index of an instance in a [`Slab`]
///
/// Handles are only minted by [`Slab::insert`]; validity is a bounds check
/// against the live count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(usize);

impl Handle {
    /// Raw table index
    pub fn index(self) -> usize {
        self.0
    }

    /// Handle for a raw index (validated on use, not here)
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Append-only table of at most `N` instances
pub struct Slab<T, const N: usize> {
    items: heapless::Vec<T, N>,
}

impl<T, const N: usize> Slab<T, N> {
    /// Empty table
    pub const fn new() -> Self {
        Self {
            items: heapless::Vec::new(),
        }
    }

    /// Store an instance and return its handle
    pub fn insert(&mut self, item: T) -> Result<Handle> {
        let handle = Handle(self.items.len());
        self.items
            .push(item)
            .map_err(|_| Error::TableFull { capacity: N })?;
        Ok(handle)
    }

    /// Instance for a handle, or `InvalidHandle`
    pub fn get(&self, handle: Handle) -> Result<&T> {
        let live = self.items.len();
        self.items.get(handle.0).ok_or(Error::InvalidHandle {
            handle: handle.0,
            live,
        })
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no instance has been inserted
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let mut slab: Slab<u8, 2> = Slab::new();
        assert!(slab.is_empty());
        assert_eq!(slab.insert(1).map(Handle::index), Ok(0));
        assert_eq!(slab.insert(2).map(Handle::index), Ok(1));
        assert_eq!(slab.insert(3), Err(Error::TableFull { capacity: 2 }));
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn test_handle_bounds_checked() {
        let mut slab: Slab<&str, 4> = Slab::new();
        let handle = slab.insert("imu").unwrap();
        assert_eq!(slab.get(handle), Ok(&"imu"));
        assert_eq!(
            slab.get(Handle::from_index(1)),
            Err(Error::InvalidHandle { handle: 1, live: 1 })
        );
    }
}
