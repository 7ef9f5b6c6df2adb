//! POSIX shared memory output region
//!
//! The region is a single `shm_open` object mapped with `MAP_SHARED`:
//!
//! ```text
//! +----------------------+ 0
//! | RegionHeader         |  magic, pixel size, timestamp, generation,
//! |                      |  owner pid, process-shared mutex and
//! |                      |  condition variable
//! +----------------------+ DATA_OFFSET
//! | pixels               |  width * height * 4 bytes, B G R A
//! +----------------------+
//! ```
//!
//! Writers and readers in any process take the header mutex for the whole
//! access. Every write bumps `generation` and broadcasts the condition
//! variable after unlocking, which is what [`ShmRegion::wait_for_frame`]
//! blocks on.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{OutputRegion, WaitResult};
use crate::envelope::TimeStamp;
use crate::{ReplayError, Result};

/// Identifies an initialized region header
const REGION_MAGIC: u32 = 0x5650_5852; // "VPXR"
const REGION_VERSION: u32 = 2;

#[repr(C)]
struct RegionHeader {
    magic: u32,
    version: u32,
    size: u64,
    seconds: i32,
    microseconds: i32,
    generation: u64,
    owner_pid: libc::pid_t,
    _reserved: u32,
    mutex: libc::pthread_mutex_t,
    condition: libc::pthread_cond_t,
}

/// Offset of the pixel area, cache line aligned
const DATA_OFFSET: usize = std::mem::size_of::<RegionHeader>().div_ceil(64) * 64;

/// Map a user-facing region name to a POSIX shm object name.
fn shm_name(name: &str) -> Option<CString> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() || trimmed.contains('/') {
        return None;
    }
    CString::new(format!("/{}", trimmed)).ok()
}

/// Whether `pid` names a running process.
fn process_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only probes for existence and permission.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 { Ok(()) } else { Err(io::Error::from_raw_os_error(rc)) }
}

/// Holds the region mutex until dropped
struct RegionLock {
    mutex: *mut libc::pthread_mutex_t,
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        // SAFETY: the mutex was locked by this thread in `ShmRegion::lock`.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex);
        }
    }
}

/// Named shared memory region
#[derive(Debug)]
pub struct ShmRegion {
    name: String,
    shm_name: CString,
    fd: libc::c_int,
    base: NonNull<u8>,
    mapped_len: usize,
    size: usize,
    owner: bool,
}

// SAFETY: all access to the mapping goes through the process-shared mutex in
// its header; the raw pointer is never handed out beyond a locked scope.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create a region with a pixel area of `size` bytes.
    ///
    /// An object left behind under the same name is unlinked and replaced
    /// once, unless it is an initialized region whose owner is still
    /// running.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shm_name = shm_name(name)
            .ok_or_else(|| ReplayError::region_create(name, size, "invalid region name"))?;
        let mapped_len = DATA_OFFSET + size;

        let fd = match Self::open_exclusive(&shm_name) {
            Ok(fd) => fd,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(pid) = Self::live_owner(name) {
                    return Err(ReplayError::region_create(
                        name,
                        size,
                        format!("region is in use by running process {}", pid),
                    ));
                }
                warn!(region = name, "Replacing stale shared memory region");
                // SAFETY: shm_name is a valid NUL-terminated string.
                unsafe {
                    libc::shm_unlink(shm_name.as_ptr());
                }
                Self::open_exclusive(&shm_name)
                    .map_err(|e| ReplayError::region_create_io(name, size, e))?
            }
            Err(e) => return Err(ReplayError::region_create_io(name, size, e)),
        };

        let unlink_on_error = |e: io::Error| {
            // SAFETY: fd and shm_name were created above and are not shared yet.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(shm_name.as_ptr());
            }
            ReplayError::region_create_io(name, size, e)
        };

        // SAFETY: fd is a freshly opened shm object.
        if unsafe { libc::ftruncate(fd, mapped_len as libc::off_t) } != 0 {
            return Err(unlink_on_error(io::Error::last_os_error()));
        }
        let base = Self::map(fd, mapped_len).map_err(unlink_on_error)?;

        // SAFETY: the mapping is at least DATA_OFFSET bytes, page aligned and
        // zero filled by ftruncate; nothing else can see it initialized yet
        // because the magic is written last.
        unsafe {
            let header = base.as_ptr() as *mut RegionHeader;
            (*header).version = REGION_VERSION;
            (*header).size = size as u64;
            (*header).owner_pid = libc::getpid();
            if let Err(e) = Self::init_sync(header) {
                libc::munmap(base.as_ptr() as *mut libc::c_void, mapped_len);
                return Err(unlink_on_error(e));
            }
            std::ptr::write_volatile(&mut (*header).magic, REGION_MAGIC);
        }

        debug!(region = name, size, mapped_len, "Created shared memory region");
        Ok(Self { name: name.to_string(), shm_name, fd, base, mapped_len, size, owner: true })
    }

    /// Attach to a region created by another process (or another handle).
    pub fn attach(name: &str) -> Result<Self> {
        let shm_name = shm_name(name)
            .ok_or_else(|| ReplayError::region_operation(name, "attach to invalid name", None))?;

        // SAFETY: shm_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(ReplayError::region_operation(name, "open", Some(io::Error::last_os_error())));
        }

        // SAFETY: fd is valid and stat is fully written by fstat on success.
        let mapped_len = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(ReplayError::region_operation(name, "stat", Some(e)));
            }
            stat.st_size as usize
        };
        if mapped_len < DATA_OFFSET {
            // SAFETY: fd is owned here.
            unsafe {
                libc::close(fd);
            }
            return Err(ReplayError::region_operation(name, "attach to truncated region", None));
        }

        let base = Self::map(fd, mapped_len).map_err(|e| {
            // SAFETY: fd is owned here.
            unsafe {
                libc::close(fd);
            }
            ReplayError::region_operation(name, "map", Some(e))
        })?;

        let mut region = Self {
            name: name.to_string(),
            shm_name,
            fd,
            base,
            mapped_len,
            size: mapped_len - DATA_OFFSET,
            owner: false,
        };
        // SAFETY: the header lies within the mapping.
        let (magic, size) = unsafe {
            let header = region.header();
            (std::ptr::read_volatile(&(*header).magic), (*header).size as usize)
        };
        if magic != REGION_MAGIC || size > region.size {
            return Err(ReplayError::region_operation(name, "attach to uninitialized region", None));
        }
        region.size = size;

        debug!(region = name, size, "Attached to shared memory region");
        Ok(region)
    }

    /// Pid of the running process that owns an existing region under `name`
    fn live_owner(name: &str) -> Option<libc::pid_t> {
        let existing = Self::attach(name).ok()?;
        // SAFETY: attach checked the header lies within the mapping.
        let pid = unsafe { std::ptr::read_volatile(&(*existing.header()).owner_pid) };
        process_alive(pid).then_some(pid)
    }

    fn open_exclusive(shm_name: &CString) -> io::Result<libc::c_int> {
        // SAFETY: shm_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                shm_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(fd) }
    }

    fn map(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: mapping a valid fd; failure is reported via MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    /// Initialize the process-shared mutex and condition variable.
    ///
    /// # Safety
    ///
    /// `header` must point to writable memory inside a fresh mapping.
    unsafe fn init_sync(header: *mut RegionHeader) -> io::Result<()> {
        unsafe {
            let mut mutex_attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut mutex_attr))?;
            let mutex = check(libc::pthread_mutexattr_setpshared(
                &mut mutex_attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|_| check(libc::pthread_mutex_init(&mut (*header).mutex, &mutex_attr)));
            libc::pthread_mutexattr_destroy(&mut mutex_attr);
            mutex?;

            let mut cond_attr: libc::pthread_condattr_t = std::mem::zeroed();
            check(libc::pthread_condattr_init(&mut cond_attr))?;
            let condition = check(libc::pthread_condattr_setpshared(
                &mut cond_attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|_| check(libc::pthread_cond_init(&mut (*header).condition, &cond_attr)));
            libc::pthread_condattr_destroy(&mut cond_attr);
            if let Err(e) = condition {
                libc::pthread_mutex_destroy(&mut (*header).mutex);
                return Err(e);
            }
        }
        Ok(())
    }

    fn header(&self) -> *mut RegionHeader {
        self.base.as_ptr() as *mut RegionHeader
    }

    fn lock(&self, operation: &str) -> Result<RegionLock> {
        // SAFETY: the header and its mutex live as long as the mapping.
        let mutex = unsafe { &mut (*self.header()).mutex as *mut libc::pthread_mutex_t };
        // SAFETY: the mutex was initialized as process-shared.
        check(unsafe { libc::pthread_mutex_lock(mutex) })
            .map_err(|e| ReplayError::region_operation(&self.name, operation, Some(e)))?;
        Ok(RegionLock { mutex })
    }

    /// Frames written since the region was created
    pub fn generation(&self) -> Result<u64> {
        let _lock = self.lock("read generation")?;
        // SAFETY: read under the region lock.
        Ok(unsafe { (*self.header()).generation })
    }

    /// Block until a frame newer than `seen_generation` is written or
    /// `timeout` passes.
    pub fn wait_for_frame(&self, seen_generation: u64, timeout: Duration) -> Result<WaitResult> {
        let deadline = realtime_deadline(timeout);
        let lock = self.lock("wait")?;
        let header = self.header();

        loop {
            // SAFETY: generation is read under the region lock.
            if unsafe { (*header).generation } != seen_generation {
                trace!(region = %self.name, "Region update signaled");
                return Ok(WaitResult::Signaled);
            }
            // SAFETY: the mutex is held by this thread through `lock`.
            let rc = unsafe {
                libc::pthread_cond_timedwait(&mut (*header).condition, lock.mutex, &deadline)
            };
            match rc {
                0 => {}
                libc::ETIMEDOUT => {
                    trace!(region = %self.name, "Region wait timed out");
                    return Ok(WaitResult::Timeout);
                }
                rc => {
                    return Err(ReplayError::region_operation(
                        &self.name,
                        "wait",
                        Some(io::Error::from_raw_os_error(rc)),
                    ));
                }
            }
        }
    }

    /// Whether this handle created (and will remove) the region
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

fn realtime_deadline(timeout: Duration) -> libc::timespec {
    // SAFETY: clock_gettime writes into the provided timespec.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }

    let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let seconds = now.tv_sec as u64 + timeout.as_secs() + nanos / 1_000_000_000;
    libc::timespec {
        tv_sec: seconds.min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    }
}

impl OutputRegion for ShmRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.size
    }

    fn write_frame(&mut self, timestamp: TimeStamp, fill: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let header = self.header();
        {
            let _lock = self.lock("lock for write")?;
            // SAFETY: header fields and the pixel area are only written while
            // holding the region lock.
            unsafe {
                (*header).seconds = timestamp.seconds;
                (*header).microseconds = timestamp.microseconds;
                (*header).generation += 1;
                let pixels =
                    std::slice::from_raw_parts_mut(self.base.as_ptr().add(DATA_OFFSET), self.size);
                fill(pixels);
            }
        }

        // SAFETY: the condition variable was initialized as process-shared.
        check(unsafe { libc::pthread_cond_broadcast(&mut (*header).condition) })
            .map_err(|e| ReplayError::region_operation(&self.name, "notify", Some(e)))
    }

    fn read_frame(&self, read: &mut dyn FnMut(TimeStamp, &[u8])) -> Result<()> {
        let header = self.header();
        let _lock = self.lock("lock for read")?;
        // SAFETY: read under the region lock.
        unsafe {
            let timestamp = TimeStamp::new((*header).seconds, (*header).microseconds);
            let pixels = std::slice::from_raw_parts(self.base.as_ptr().add(DATA_OFFSET), self.size);
            read(timestamp, pixels);
        }
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: base/mapped_len describe our own mapping and fd is ours.
        unsafe {
            if self.owner {
                let header = self.header();
                libc::pthread_cond_destroy(&mut (*header).condition);
                libc::pthread_mutex_destroy(&mut (*header).mutex);
            }
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped_len);
            libc::close(self.fd);
            if self.owner {
                libc::shm_unlink(self.shm_name.as_ptr());
            }
        }
        debug!(region = %self.name, owner = self.owner, "Released shared memory region");
    }
}
