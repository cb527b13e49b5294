//! POSIX shared memory regions.
//!
//! The creating side owns the name and unlinks it when dropped. The other
//! side maps an existing region, reading its size from the first word of the
//! region itself.

use plugbridge_plugin::PluginError;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared memory region mapped into this process
pub struct SharedMemory {
    /// Pointer to mapped memory
    ptr: NonNull<u8>,

    /// Size of the memory region
    size: usize,

    /// Name of the shared memory object
    name: String,

    /// We created the object and unlink it on drop
    owner: bool,

    /// The owner is gone, so we have to unlink it ourselves
    orphaned: AtomicBool,
}

fn system_error(what: &str) -> PluginError {
    PluginError::SystemError(format!("{what}: {}", io::Error::last_os_error()))
}

fn c_name(name: &str) -> Result<CString, PluginError> {
    CString::new(name)
        .map_err(|e| PluginError::SystemError(format!("Invalid shared memory name: {e}")))
}

#[allow(unsafe_code)]
fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>, PluginError> {
    // SAFETY: fd is a valid shared memory object of at least `size` bytes
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(system_error("Failed to map shared memory"));
    }
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| PluginError::SystemError("mmap returned a null pointer".to_string()))
}

impl SharedMemory {
    /// Create a new zero-initialized shared memory region.
    ///
    /// Fails if an object with the same name already exists. The pages are
    /// locked into RAM if the system allows it.
    #[allow(unsafe_code)]
    pub fn create(name: &str, size: usize) -> Result<Self, PluginError> {
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid NUL terminated string
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600, // Owner read/write only
            )
        };
        if raw < 0 {
            return Err(system_error("Failed to create shared memory"));
        }
        // SAFETY: shm_open returned a fresh descriptor that nobody else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let unlink = || {
            // SAFETY: c_name is a valid NUL terminated string
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        };

        // SAFETY: fd is valid
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            let err = system_error("Failed to set shared memory size");
            unlink();
            return Err(err);
        }

        let ptr = match map(&fd, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                unlink();
                return Err(e);
            }
        };
        // the mapping stays valid after the descriptor is closed
        drop(fd);

        // SAFETY: ptr points to `size` mapped bytes
        unsafe {
            if libc::mlock(ptr.as_ptr().cast(), size) != 0 {
                tracing::warn!(
                    "Couldn't lock shared memory pages: {}",
                    io::Error::last_os_error()
                );
            }
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }

        tracing::debug!("Created shared memory {} ({} bytes)", name, size);

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: true,
            orphaned: AtomicBool::new(false),
        })
    }

    /// Open an existing shared memory region.
    ///
    /// The first `u32` of the region must hold its total size.
    #[allow(unsafe_code)]
    pub fn open(name: &str) -> Result<Self, PluginError> {
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid NUL terminated string
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
        if raw < 0 {
            return Err(system_error("Failed to open shared memory"));
        }
        // SAFETY: shm_open returned a fresh descriptor that nobody else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // map the header first to learn the real size
        let header = map(&fd, size_of::<u32>())?;
        // SAFETY: header points to at least 4 mapped bytes, page aligned
        let size = unsafe { header.as_ptr().cast::<u32>().read_volatile() } as usize;
        // SAFETY: header was mapped above with this length
        unsafe { libc::munmap(header.as_ptr().cast(), size_of::<u32>()) };

        if size < size_of::<u32>() {
            return Err(PluginError::SystemError(format!(
                "Shared memory {name} has bad size {size}"
            )));
        }

        let ptr = map(&fd, size)?;
        drop(fd);

        // SAFETY: ptr points to `size` mapped bytes
        if unsafe { libc::mlock(ptr.as_ptr().cast(), size) } != 0 {
            tracing::warn!(
                "Couldn't lock shared memory pages: {}",
                io::Error::last_os_error()
            );
        }

        tracing::debug!("Opened shared memory {} ({} bytes)", name, size);

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: false,
            orphaned: AtomicBool::new(false),
        })
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Unlink the name on drop even though we didn't create it
    pub fn set_orphaned(&self) {
        self.orphaned.store(true, Ordering::Relaxed);
    }
}

impl Drop for SharedMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: the region was mapped with exactly this pointer and size
        unsafe {
            libc::munlock(self.ptr.as_ptr().cast(), self.size);
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
        }

        if self.owner || self.orphaned.load(Ordering::Relaxed) {
            if let Ok(c_name) = CString::new(self.name.as_str()) {
                // SAFETY: c_name is a valid NUL terminated string
                if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
                    tracing::warn!(
                        "Couldn't unlink shared memory {}: {}",
                        self.name,
                        io::Error::last_os_error()
                    );
                }
            }
        }
    }
}

// The region is only accessed through atomics or under the channel protocol
#[allow(unsafe_code)]
unsafe impl Send for SharedMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for SharedMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(unsafe_code)]
    fn write_size(shm: &SharedMemory) {
        unsafe { shm.as_ptr().cast::<u32>().write(shm.size() as u32) };
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_shared_memory_create_and_open() {
        let name = format!("/pb_test_shm_{}", std::process::id());
        let size = 4096;

        let creator = SharedMemory::create(&name, size).expect("Failed to create shm");
        assert_eq!(creator.size(), size);
        assert!(creator.is_owner());
        write_size(&creator);

        unsafe {
            *creator.as_ptr().add(100) = 123;
        }

        // Open from another "process" (same process for testing)
        let reader = SharedMemory::open(&name).expect("Failed to open shm");
        assert_eq!(reader.size(), size);
        assert!(!reader.is_owner());
        assert_eq!(unsafe { *reader.as_ptr().add(100) }, 123);
    }

    #[test]
    fn test_create_is_exclusive() {
        let name = format!("/pb_test_excl_{}", std::process::id());
        let first = SharedMemory::create(&name, 4096).unwrap();
        write_size(&first);
        assert!(SharedMemory::create(&name, 4096).is_err());
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let name = format!("/pb_test_unlink_{}", std::process::id());
        let shm = SharedMemory::create(&name, 4096).unwrap();
        write_size(&shm);
        drop(shm);
        assert!(SharedMemory::open(&name).is_err());
    }
}
