use std::fmt;
use std::num::NonZeroUsize;

/// Non-null pointer into device memory. Never dereferenced on the host.
#[repr(transparent)]
pub struct DeviceNonNull<T> {
    pointer: *const T,
}

// device addresses are plain integers from the host's point of view
unsafe impl<T> Send for DeviceNonNull<T> {}
unsafe impl<T> Sync for DeviceNonNull<T> {}

impl<T> DeviceNonNull<T> {
    /// # Safety
    /// `ptr` must be non-null.
    pub const unsafe fn new_unchecked(ptr: *mut T) -> Self {
        DeviceNonNull { pointer: ptr as _ }
    }

    #[inline]
    pub fn new(ptr: *mut T) -> Option<Self> {
        if !ptr.is_null() {
            Some(unsafe { Self::new_unchecked(ptr) })
        } else {
            None
        }
    }

    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        Self::new(addr as *mut T)
    }

    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        unsafe { NonZeroUsize::new_unchecked(self.pointer as usize) }
    }

    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> Self {
        unsafe { Self::new_unchecked(addr.get() as *mut T) }
    }

    #[inline]
    pub fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self {
        self.with_addr(f(self.addr()))
    }

    /// Pointer `bytes` past this one.
    #[inline]
    pub fn byte_add(self, bytes: usize) -> Self {
        self.map_addr(|addr| addr.saturating_add(bytes))
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut T {
        self.pointer as *mut T
    }

    #[inline]
    pub const fn cast<U>(self) -> DeviceNonNull<U> {
        unsafe { DeviceNonNull::new_unchecked(self.as_ptr() as *mut U) }
    }
}

impl<T> Clone for DeviceNonNull<T> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DeviceNonNull<T> {}

impl<T> PartialEq for DeviceNonNull<T> {
    fn eq(&self, other: &Self) -> bool {
        self.pointer == other.pointer
    }
}

impl<T> Eq for DeviceNonNull<T> {}

impl<T> fmt::Debug for DeviceNonNull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceNonNull")
            .field(&self.as_ptr())
            .finish()
    }
}

impl<T> fmt::Pointer for DeviceNonNull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}
