use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A storage cell holding zero or one boxed `T`.
///
/// Ownership moves in and out through a single atomic exchange, so a value
/// held by a slot is never observed by two holders and never copied. The slot
/// owns whatever it holds: dropping the slot drops the value.
///
/// # Example
///
/// ```
/// use slotring::Slot;
///
/// let slot = Slot::new();
/// assert!(slot.swap(Some(Box::new(7))).is_none());
/// assert_eq!(slot.take().map(|b| *b), Some(7));
/// assert!(slot.is_empty());
/// ```
pub struct Slot<T> {
    ptr: AtomicPtr<T>,
    _owns: PhantomData<Box<T>>,
}

// Safety: the slot hands out `Box<T>` by value only, never `&T`, so moving
// the slot or sharing it between threads only requires `T: Send`.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// Creates an empty slot.
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Returns `true` if the slot holds nothing at this instant.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Replaces the contents and returns the previous contents.
    ///
    /// Inserting is `swap(Some(item))` on an empty slot, removing is
    /// `swap(None)` on a full one. Always succeeds.
    #[inline]
    pub fn swap(&self, value: Option<Box<T>>) -> Option<Box<T>> {
        let new = value.map_or(ptr::null_mut(), Box::into_raw);
        let old = self.ptr.swap(new, Ordering::AcqRel);
        // SAFETY: every non-null pointer stored in `ptr` came from
        // `Box::into_raw`, and the exchange gave this thread the only copy.
        unsafe { Self::from_raw(old) }
    }

    /// Stores `value` only if the slot is currently empty.
    ///
    /// On failure the value is handed back untouched.
    #[inline]
    pub fn swap_if_empty(&self, value: Box<T>) -> Result<(), Box<T>> {
        let new = Box::into_raw(value);
        match self
            .ptr
            .compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: the exchange failed, so `new` was never published and
            // this thread still owns it.
            Err(_) => Err(unsafe { Box::from_raw(new) }),
        }
    }

    /// Removes and returns the contents, leaving the slot empty.
    #[inline]
    pub fn take(&self) -> Option<Box<T>> {
        self.swap(None)
    }

    /// Empties the slot, dropping whatever it held.
    #[inline]
    pub fn reset(&self) {
        drop(self.swap(None));
    }

    /// # Safety
    ///
    /// `raw` must be null or a pointer obtained from `Box::into_raw` that no
    /// other owner can reach.
    #[inline]
    unsafe fn from_raw(raw: *mut T) -> Option<Box<T>> {
        if raw.is_null() {
            None
        } else {
            Some(Box::from_raw(raw))
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        // SAFETY: `&mut self` rules out concurrent access; the pointer is
        // either null or an owned box.
        drop(unsafe { Self::from_raw(raw) });
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("occupied", &!self.is_empty())
            .finish()
    }
}
