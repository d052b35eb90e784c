//! POSIX shared-memory segments exchanged during the handshake.
use std::ffi::CString;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

/// Process-unique identifier of a shared-memory segment, exchangeable over
/// the wire.
///
/// The creating process's id occupies the high bits and a sequence number
/// the low bits, so ids never collide between live processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmId(u64);

impl ShmId {
    /// Allocate a fresh id, unique within this process.
    pub fn generate() -> Self {
        // The sequence starts at a random point so a recycled pid cannot
        // produce a name still lingering from a crashed predecessor.
        static SEQUENCE: OnceLock<AtomicU32> = OnceLock::new();

        let seq = SEQUENCE
            .get_or_init(|| AtomicU32::new(fastrand::u32(..)))
            .fetch_add(1, Ordering::SeqCst);
        let pid = unsafe { libc::getpid() } as u32;

        ShmId((pid as u64) << 32 | seq as u64)
    }

    pub const fn from_u64(raw: u64) -> Self {
        ShmId(raw)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// The `shm_open` object name this id maps to.
    fn name(&self) -> CString {
        CString::new(format!("/safeipc-{:016x}", self.0)).expect("name has no interior nul")
    }
}

impl std::fmt::Display for ShmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Mapping permission, matching the direction a segment serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// An open, mapped shared-memory segment.
///
/// The creator owns the object name and unlinks it on drop; peers that
/// merely mapped the segment keep their mapping alive past the unlink, per
/// POSIX semantics.
#[derive(Debug)]
pub struct SharedMemory {
    id: ShmId,
    fd: OwnedFd,
    ptr: *mut u8,
    len: usize,
    owner: bool,
}

// The mapping is plain memory; the fd is owned.
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Create and map a fresh segment of `len` bytes, readable and
    /// writable, under a newly generated id.
    pub fn create(len: usize) -> io::Result<Self> {
        let id = ShmId::generate();
        let name = id.name();

        let raw = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(name.as_ptr()) };
            return Err(err);
        }

        let ptr = match map(fd.as_raw_fd(), len, libc::PROT_READ | libc::PROT_WRITE) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe { libc::shm_unlink(name.as_ptr()) };
                return Err(err);
            }
        };

        Ok(Self {
            id,
            fd,
            ptr,
            len,
            owner: true,
        })
    }

    /// Map an existing segment by id, with the permission its direction
    /// requires. The size comes from the object itself.
    pub fn open(id: ShmId, access: Access) -> io::Result<Self> {
        let name = id.name();
        let (oflag, prot) = match access {
            Access::ReadOnly => (libc::O_RDONLY, libc::PROT_READ),
            Access::ReadWrite => (libc::O_RDWR, libc::PROT_READ | libc::PROT_WRITE),
        };

        let raw = unsafe { libc::shm_open(name.as_ptr(), oflag, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory object is empty",
            ));
        }

        let ptr = map(fd.as_raw_fd(), len, prot)?;

        Ok(Self {
            id,
            fd,
            ptr,
            len,
            owner: false,
        })
    }

    pub fn id(&self) -> ShmId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping. The buffer contents are owned by the
    /// data plane; this module never interprets them.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.id.name().as_ptr());
            }
        }
    }
}

fn map(fd: RawFd, len: usize, prot: libc::c_int) -> io::Result<*mut u8> {
    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}
