use crate::Slot;
use std::iter::Chain;
use std::slice;

/// A logically contiguous run of slots handed to a [`RingBuffer::consume`]
/// callback.
///
/// When the run wraps around the end of the backing array it is made of two
/// physical sub-slices; `first` always precedes `second` in ring order.
///
/// [`RingBuffer::consume`]: crate::RingBuffer::consume
#[derive(Debug)]
pub struct SlotRange<'a, T> {
    first: &'a [Slot<T>],
    second: &'a [Slot<T>],
}

impl<T> Clone for SlotRange<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotRange<'_, T> {}

impl<'a, T> SlotRange<'a, T> {
    pub(crate) fn new(first: &'a [Slot<T>], second: &'a [Slot<T>]) -> Self {
        Self { first, second }
    }

    /// Number of slots in the range.
    #[inline]
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Returns `true` if the range holds no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// The two physical sub-slices, in ring order. `second` is empty unless
    /// the range wraps.
    #[inline]
    pub fn as_slices(&self) -> (&'a [Slot<T>], &'a [Slot<T>]) {
        (self.first, self.second)
    }

    /// Iterates the slots in ring order.
    #[inline]
    pub fn iter(&self) -> Chain<slice::Iter<'a, Slot<T>>, slice::Iter<'a, Slot<T>>> {
        self.first.iter().chain(self.second.iter())
    }

    /// Visits slots in ring order until `f` returns `false`.
    ///
    /// Returns `true` if every slot was visited. Inside a
    /// [`RingBuffer::consume`] callback, slots skipped by an early stop must
    /// still be emptied before the callback returns.
    ///
    /// [`RingBuffer::consume`]: crate::RingBuffer::consume
    pub fn for_each<F>(&self, f: F) -> bool
    where
        F: FnMut(&'a Slot<T>) -> bool,
    {
        self.iter().all(f)
    }
}

impl<'a, T> IntoIterator for &SlotRange<'a, T> {
    type Item = &'a Slot<T>;
    type IntoIter = Chain<slice::Iter<'a, Slot<T>>, slice::Iter<'a, Slot<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
