//! Caller-owned packet memory handed to the mapping layer.

use core::ptr::NonNull;

/// A packet buffer owned by the driver's buffer pool.
///
/// The mapping layer never allocates packet memory. A buffer moves into a
/// [`Mapping`](super::Mapping) for the duration of a transfer and comes back
/// out of `unmap` (or out of a failed `map`), so nothing can touch it while
/// the device owns it.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl DmaBuffer {
    /// Wrap raw packet memory.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    /// - `ptr` must point to `len` bytes of valid, writable memory
    /// - the memory must stay valid and unaliased until the buffer is
    ///   dropped or handed back to its owner
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Option<Self> {
        Some(Self {
            ptr: NonNull::new(ptr)?,
            len,
        })
    }

    /// Wrap a statically allocated buffer.
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        let len = buf.len();
        Self {
            ptr: NonNull::from(buf).cast(),
            len,
        }
    }

    /// CPU address, as the resolver sees it.
    pub fn virt_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Buffer capacity in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: construction guarantees `len` valid bytes, and whoever holds
        // the buffer owns them exclusively.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus `&mut self`.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Give the memory back to its owner.
    pub fn into_raw_parts(self) -> (*mut u8, usize) {
        (self.ptr.as_ptr(), self.len)
    }
}

unsafe impl Send for DmaBuffer {}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("ptr", &self.ptr)
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_buffer_round_trip() {
        let backing: &'static mut [u8] = Box::leak(vec![0u8; 32].into_boxed_slice());
        let base = backing.as_ptr() as usize;
        let mut buf = DmaBuffer::from_static(backing);
        assert_eq!(buf.len(), 32);
        assert_eq!(buf.virt_addr(), base);
        buf.as_mut_slice()[3] = 9;
        assert_eq!(buf.as_slice()[3], 9);
        let (ptr, len) = buf.into_raw_parts();
        assert_eq!((ptr as usize, len), (base, 32));
    }

    #[test]
    fn test_null_rejected() {
        assert!(unsafe { DmaBuffer::from_raw_parts(core::ptr::null_mut(), 4) }.is_none());
    }
}
