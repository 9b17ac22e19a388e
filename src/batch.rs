//! Growable sequence of records stored in the region heap
//!
//! The header holds the element buffer as a region offset, so a sequence
//! resized by one process is readable by the other at its own mapping
//! address. Callers must hold the direction's bracket while touching it.

use crate::error::{LockstepError, Result};
use crate::region::Region;
use std::ptr::NonNull;

const MIN_CAPACITY: usize = 4;

/// Sequence header as laid out in shared memory
#[repr(C)]
pub(crate) struct SeqHeader {
    len: u64,
    cap: u64,
    /// Offset of the element buffer, 0 while nothing is allocated
    data: u64,
}

/// Untyped handle to a sequence, element size known at runtime
pub(crate) struct RawSeq<'r> {
    region: &'r Region,
    header: NonNull<SeqHeader>,
    elem_size: usize,
}

impl<'r> RawSeq<'r> {
    /// # Safety
    /// `header` must point at a sequence header inside `region`, and the
    /// caller must hold the bracket for the direction owning it
    pub(crate) unsafe fn new(region: &'r Region, header: NonNull<SeqHeader>, elem_size: usize) -> Self {
        Self {
            region,
            header,
            elem_size,
        }
    }

    #[inline]
    fn header(&self) -> &SeqHeader {
        unsafe { self.header.as_ref() }
    }

    pub(crate) fn len(&self) -> usize {
        self.header().len as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        self.header().cap as usize
    }

    /// Start of the element buffer, `None` while unallocated
    pub(crate) fn data(&self) -> Option<NonNull<u8>> {
        match self.header().data {
            0 => None,
            offset => Some(self.region.at(offset)),
        }
    }

    fn grow(&self, min_cap: usize) -> Result<()> {
        let (len, cap) = (self.len(), self.capacity());
        let new_cap = min_cap.max(cap.saturating_mul(2)).max(MIN_CAPACITY);

        if self.elem_size == 0 {
            unsafe { (*self.header.as_ptr()).cap = new_cap as u64 };
            return Ok(());
        }

        let bytes = new_cap
            .checked_mul(self.elem_size)
            .ok_or_else(|| LockstepError::OutOfMemory {
                requested: usize::MAX,
                available: self.region.free_bytes(),
            })?;
        let offset = self.region.alloc(bytes)?;
        let new_data = self.region.at(offset);

        unsafe {
            if let Some(old) = self.data() {
                std::ptr::copy_nonoverlapping(old.as_ptr(), new_data.as_ptr(), len * self.elem_size);
                self.region.dealloc(self.region.offset_of(old.as_ptr()));
            }
            let header = self.header.as_ptr();
            (*header).data = offset;
            (*header).cap = new_cap as u64;
        }

        tracing::debug!(
            segment = %self.region.name(),
            old_capacity = cap,
            new_capacity = new_cap,
            elem_size = self.elem_size,
            "grew batch sequence"
        );
        Ok(())
    }

    /// Set the length, zero-filling new elements
    pub(crate) fn resize(&self, new_len: usize) -> Result<()> {
        let len = self.len();
        if new_len > self.capacity() {
            self.grow(new_len)?;
        }
        if new_len > len && self.elem_size > 0 {
            if let Some(data) = self.data() {
                unsafe {
                    std::ptr::write_bytes(
                        data.as_ptr().add(len * self.elem_size),
                        0,
                        (new_len - len) * self.elem_size,
                    );
                }
            }
        }
        unsafe { (*self.header.as_ptr()).len = new_len as u64 };
        Ok(())
    }

    /// Shorten to `new_len`; longer lengths are left alone
    pub(crate) fn truncate(&self, new_len: usize) {
        if new_len < self.len() {
            unsafe { (*self.header.as_ptr()).len = new_len as u64 };
        }
    }

    /// Ensure room for `additional` more elements without changing the length
    pub(crate) fn reserve(&self, additional: usize) -> Result<()> {
        let needed = self.len().saturating_add(additional);
        if needed > self.capacity() {
            self.grow(needed)?;
        }
        Ok(())
    }
}
