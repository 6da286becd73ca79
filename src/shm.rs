//! Named, cross-process shared-memory regions.
//!
//! Implemented directly against POSIX shared memory (`shm_open` + `mmap`)
//! via raw `libc` bindings rather than a higher-level crate, since no
//! dedicated named-shared-memory crate covers this need. Windows named
//! shared memory is out of scope for this crate.

use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context;
use crate::error::ShmError;
use crate::value::ShmRef;

static REGION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A named, cross-process byte buffer.
///
/// Created with [`SharedMemoryRegion::create`] (allocates a new OS block and
/// assigns it a name) or attached with [`SharedMemoryRegion::attach`] (maps
/// an existing block by name). Two disposal primitives exist: [`close`]
/// releases the local mapping, [`unlink`] destroys the OS block. By
/// convention the *service* process always unlinks, regardless of which
/// side created the block; workers therefore always attach with
/// `unlink_on_dispose = false`.
///
/// [`close`]: SharedMemoryRegion::close
/// [`unlink`]: SharedMemoryRegion::unlink
pub struct SharedMemoryRegion {
    name: String,
    rsize: usize,
    size: usize,
    ptr: *mut u8,
    fd: libc::c_int,
    unlink_on_dispose: bool,
    closed: bool,
}

// SAFETY: the mapped region is exclusively owned by this struct; all access
// to `ptr` goes through `&self`/`&mut self` methods that respect Rust's
// aliasing rules, so it is sound to move and share the handle across
// threads the same way any other owned buffer would be.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Create a new OS-named shared-memory block of at least `rsize` bytes.
    pub fn create(rsize: usize) -> Result<Self, ShmError> {
        let name = format!("/appose-{}-{}", std::process::id(), next_region_id());
        Self::create_named(&name, rsize, true)
    }

    /// Attach to an existing OS-named shared-memory block.
    ///
    /// `rsize` is the caller's logical view of the region, not a claim about
    /// the OS-reported size. Per the worker-mode invariant, a region
    /// attached while [`context::is_worker_process`] is true always has
    /// `unlink_on_dispose = false`, suppressing the worker's ability to
    /// destroy a block the service still owns.
    pub fn attach(name: &str, rsize: usize) -> Result<Self, ShmError> {
        let page_size = page_size();
        let size = round_up_to_page(rsize, page_size);

        let c_name = CString::new(name).map_err(|_| ShmError::NotFound(name.to_string()))?;
        // SAFETY: c_name is a valid, NUL-terminated C string for the
        // duration of this call; shm_open with O_RDWR (no O_CREAT) either
        // returns a valid fd or -1 with errno set, both handled below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(ShmError::NotFound(name.to_string()));
        }

        let ptr = map_fd(fd, size)?;

        Ok(Self {
            name: name.to_string(),
            rsize,
            size,
            ptr,
            fd,
            unlink_on_dispose: !context::is_worker_process(),
            closed: false,
        })
    }

    fn create_named(name: &str, rsize: usize, unlink_on_dispose: bool) -> Result<Self, ShmError> {
        let page_size = page_size();
        let size = round_up_to_page(rsize.max(1), page_size);

        let c_name = CString::new(name)
            .map_err(|_| ShmError::allocation_failed(rsize, "name contains interior NUL byte"))?;
        // SAFETY: c_name is a valid, NUL-terminated C string for the
        // duration of this call; shm_open with O_CREAT|O_EXCL either
        // returns a fresh fd or -1 with errno set.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::allocation_failed(
                rsize,
                std::io::Error::last_os_error().to_string(),
            ));
        }

        // SAFETY: fd is a valid, just-opened shm fd owned solely by us.
        let truncate_result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if truncate_result != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: fd was opened above and is not used elsewhere yet.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::allocation_failed(rsize, err.to_string()));
        }

        let ptr = map_fd(fd, size)?;

        Ok(Self {
            name: name.to_string(),
            rsize,
            size,
            ptr,
            fd,
            unlink_on_dispose,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The requested logical size in bytes.
    pub fn rsize(&self) -> usize {
        self.rsize
    }

    /// The actual allocated size in bytes (may exceed `rsize` due to page
    /// rounding).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn unlink_on_dispose(&self) -> bool {
        self.unlink_on_dispose
    }

    pub fn set_unlink_on_dispose(&mut self, flag: bool) {
        self.unlink_on_dispose = flag;
    }

    /// A read-only view over the mapped bytes.
    pub fn buffer(&self) -> &[u8] {
        if self.closed {
            return &[];
        }
        // SAFETY: ptr/size were established by a successful mmap in
        // `create`/`attach` and remain valid until `close`, which this
        // method cannot observe past (the `closed` check above guards it).
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// A mutable view over the mapped bytes.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        if self.closed {
            return &mut [];
        }
        // SAFETY: see `buffer`; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Release the local mapping. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        // SAFETY: ptr/size are the mapping established in create/attach;
        // fd is this region's own descriptor, not shared with anyone else.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        self.closed = true;
    }

    /// Destroy the OS block. Idempotent; may legitimately race with a
    /// concurrent close in the peer process.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_str()) {
            // SAFETY: c_name is valid for the duration of this call;
            // shm_unlink on an already-unlinked name is a documented no-op
            // (ENOENT), which we deliberately ignore.
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }

    /// Close, and unlink iff `unlink_on_dispose` is set. This is the
    /// scoped-acquisition exit point; [`Drop`] calls this automatically.
    pub fn dispose(mut self) {
        self.dispose_in_place();
    }

    fn dispose_in_place(&mut self) {
        if self.unlink_on_dispose {
            self.unlink();
        }
        self.close();
    }

    /// The lightweight wire-shaped reference to this region (name + rsize).
    pub fn as_ref_handle(&self) -> ShmRef {
        ShmRef {
            name: self.name.clone(),
            rsize: self.rsize,
        }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        self.dispose_in_place();
    }
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("rsize", &self.rsize)
            .field("size", &self.size)
            .field("unlink_on_dispose", &self.unlink_on_dispose)
            .finish()
    }
}

fn map_fd(fd: libc::c_int, size: usize) -> Result<*mut u8, ShmError> {
    // SAFETY: fd is a valid, open file descriptor sized to at least `size`
    // bytes by the caller (via ftruncate on create, or a pre-existing block
    // on attach); the mapping is checked for MAP_FAILED below.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        // SAFETY: fd is still valid and owned by us; closing it here avoids
        // leaking the descriptor on the mmap failure path.
        unsafe {
            libc::close(fd);
        }
        return Err(ShmError::io(String::new(), err));
    }
    Ok(ptr as *mut u8)
}

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn round_up_to_page(n: usize, page: usize) -> usize {
    n.div_ceil(page) * page
}

fn next_region_id() -> u64 {
    REGION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach_round_trips_bytes() {
        let mut region = SharedMemoryRegion::create(64).expect("create");
        region.buffer_mut()[0] = 42;
        let name = region.name().to_string();
        let rsize = region.rsize();

        let attached = SharedMemoryRegion::attach(&name, rsize).expect("attach");
        assert_eq!(attached.buffer()[0], 42);
        assert_eq!(attached.rsize(), 64);
        assert!(attached.size() >= 64);

        // Only the creator unlinks; the attachment is dropped first.
        drop(attached);
        region.dispose();
    }

    #[test]
    fn size_is_at_least_rsize() {
        let region = SharedMemoryRegion::create(13).expect("create");
        assert!(region.size() >= region.rsize());
    }

    #[test]
    fn attach_to_missing_region_is_not_found() {
        let err = SharedMemoryRegion::attach("/appose-does-not-exist-xyz", 16).unwrap_err();
        assert!(matches!(err, ShmError::NotFound(_)));
    }

    #[test]
    fn close_is_idempotent() {
        let mut region = SharedMemoryRegion::create(16).expect("create");
        region.close();
        region.close();
    }
}
