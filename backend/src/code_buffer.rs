use std::io;
use std::ptr;

/// Default code buffer size: 8 MiB.
const DEFAULT_CODE_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Executable buffer for generated host code, backed by mmap'd memory.
///
/// Mapped read+write+execute for its whole lifetime: blocks are emitted,
/// patched within the same compilation pass, and then executed in place,
/// interleaved with further compilations on the same thread. The
/// `protect_*` methods are available for hosts that enforce W^X.
pub struct CodeBuffer {
    ptr: *mut u8,
    size: usize,
    offset: usize,
}

// SAFETY: the mapping is exclusively owned.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Map a buffer of `size` bytes, rounded up to the page size.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
        })
    }

    pub fn with_default_size() -> io::Result<Self> {
        Self::new(DEFAULT_CODE_BUF_SIZE)
    }

    /// Current write position.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        // SAFETY: bounds asserted above.
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Rewind the write position, discarding everything emitted past
    /// `offset` (used to drop failed block builds and on full cache
    /// invalidation).
    #[inline]
    pub fn truncate(&mut self, offset: usize) {
        assert!(offset <= self.offset);
        self.offset = offset;
    }

    #[inline]
    pub fn put_u8(&mut self, val: u8) {
        assert!(self.offset < self.size, "code buffer overflow");
        // SAFETY: bounds asserted above.
        unsafe { self.ptr.add(self.offset).write(val) };
        self.offset += 1;
    }

    #[inline]
    pub fn put_u32(&mut self, val: u32) {
        assert!(self.offset + 4 <= self.size, "code buffer overflow");
        // SAFETY: bounds asserted above.
        unsafe { (self.ptr.add(self.offset) as *mut u32).write_unaligned(val) };
        self.offset += 4;
    }

    #[inline]
    pub fn put_u64(&mut self, val: u64) {
        assert!(self.offset + 8 <= self.size, "code buffer overflow");
        // SAFETY: bounds asserted above.
        unsafe { (self.ptr.add(self.offset) as *mut u64).write_unaligned(val) };
        self.offset += 8;
    }

    /// Overwrite a previously emitted u32 (jump displacements, immediate
    /// placeholders).
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        assert!(offset + 4 <= self.offset, "patch outside emitted code");
        // SAFETY: bounds asserted above.
        unsafe { (self.ptr.add(offset) as *mut u32).write_unaligned(val) };
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        // SAFETY: bounds asserted above.
        unsafe { (self.ptr.add(offset) as *const u32).read_unaligned() }
    }

    /// Everything emitted so far.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [ptr, ptr+offset) has been written.
        unsafe { std::slice::from_raw_parts(self.ptr, self.offset) }
    }

    /// Drop write permission (W^X hosts).
    pub fn protect_exec(&self) -> io::Result<()> {
        self.protect(libc::PROT_READ | libc::PROT_EXEC)
    }

    /// Restore write permission (W^X hosts).
    pub fn protect_write(&self) -> io::Result<()> {
        self.protect(libc::PROT_READ | libc::PROT_WRITE)
    }

    fn protect(&self, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: protects exactly the owned mapping.
        let ret = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.size, prot) };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: unmaps exactly the owned mapping.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
