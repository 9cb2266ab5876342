//! The reserved code window.
//!
//! This is the only module that touches raw memory. The window is mapped
//! once, read-write and without swap reservation, and every access is
//! bounds-checked against it.

use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MemoryError {
    #[error("cannot reserve {size} bytes for the code window (errno {errno})")]
    ReserveFailed { size: usize, errno: i32 },
    #[error("invalid code window size {0}")]
    InvalidSize(usize),
    #[error("access of {len} bytes at offset {offset:#x} is outside the {size:#x}-byte window")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

/// One contiguous mapping holding every code region.
pub struct CodeWindow {
    ptr: NonNull<u8>,
    size: usize,
}

impl CodeWindow {
    /// Reserve `size` bytes, rounded up to the page size.
    pub fn reserve(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let page_size = Self::page_size();
        let size = size.next_multiple_of(page_size);
        let ptr = Self::map(size)?;
        Ok(Self { ptr, size })
    }

    #[cfg(unix)]
    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    #[cfg(not(unix))]
    fn page_size() -> usize {
        4096
    }

    #[cfg(unix)]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(MemoryError::ReserveFailed { size, errno });
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::ReserveFailed { size, errno: 0 })
    }

    #[cfg(not(unix))]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize(size))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::ReserveFailed { size, errno: 0 })
    }

    /// Address of the first byte.
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Reserved size in bytes, a multiple of the page size.
    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len, size: self.size }),
        }
    }

    /// Copy `data` to `offset`, failing if it would run past the window.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, data.len())?;
        // SAFETY: the range was checked against the mapping, which is
        // exclusively borrowed.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Write one little-endian instruction word.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), MemoryError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: the range was checked against the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Read one little-endian instruction word.
    pub fn read_u32(&self, offset: usize) -> Result<u32, MemoryError> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Drop for CodeWindow {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for CodeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeWindow").field("base", &format_args!("{:#x}", self.base())).field("size", &self.size).finish()
    }
}

// The window owns its mapping; writes need `&mut`.
unsafe impl Send for CodeWindow {}
unsafe impl Sync for CodeWindow {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_rounds_to_pages() {
        let window = CodeWindow::reserve(100).unwrap();
        assert!(window.size() >= 4096);
        assert_eq!(window.base() % 4096, 0);
    }

    #[test]
    fn test_write_then_read() {
        let mut window = CodeWindow::reserve(4096).unwrap();
        window.write(8, &[1, 2, 3]).unwrap();
        window.write_u32(16, 0xD65F03C0).unwrap();
        assert_eq!(window.read(8, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(window.read_u32(16).unwrap(), 0xD65F03C0);
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        let mut window = CodeWindow::reserve(4096).unwrap();
        let size = window.size();
        assert!(matches!(window.write(size - 2, &[0; 4]), Err(MemoryError::OutOfBounds { .. })));
        assert!(window.read(usize::MAX, 2).is_err());
        assert_eq!(CodeWindow::reserve(0).unwrap_err(), MemoryError::InvalidSize(0));
    }
}
