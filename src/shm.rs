//! Low-level POSIX shared memory operations

use crate::error::{LockstepError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Longest segment name accepted, excluding the leading '/'
pub const MAX_SEGMENT_NAME: usize = 254;

/// Handle to a mapped shared memory segment
pub struct Segment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
    /// (device, inode) of the object, to recognise it behind the name later
    identity: (u64, u64),
}

// SAFETY: the mapping is plain memory; every shared mutable word inside it is
// an atomic or is only touched under the channel's semaphore brackets
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn os_name(name: &str) -> Result<CString> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') || bare.contains('\0') {
        return Err(LockstepError::InvalidName(name.to_string()));
    }
    if bare.len() > MAX_SEGMENT_NAME {
        return Err(LockstepError::NameTooLong {
            max: MAX_SEGMENT_NAME,
            got: bare.len(),
        });
    }
    CString::new(format!("/{}", bare)).map_err(|_| LockstepError::InvalidName(name.to_string()))
}

fn identity_of(fd: &OwnedFd) -> rustix::io::Result<(u64, u64)> {
    let stat = rustix::fs::fstat(fd)?;
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| LockstepError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| LockstepError::Mmap(std::io::Error::from(std::io::ErrorKind::InvalidData)))
}

impl Segment {
    /// Create a new segment exclusively
    ///
    /// Fails with `AlreadyExists` when the name is taken; callers that want
    /// clobber-on-create semantics call [`Segment::unlink`] first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| {
            if e == Errno::EXIST {
                LockstepError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                LockstepError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| LockstepError::Truncate(e.into()))
            .and_then(|()| {
                let identity = identity_of(&fd).map_err(|e| LockstepError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                })?;
                Ok((map_shared(&fd, size)?, identity))
            });
        let (addr, identity) = match mapped {
            Ok(mapped) => mapped,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        // Fresh objects read as zero already; this also faults the pages in
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
            identity,
        })
    }

    /// Open an existing segment, mapping its full current size
    pub fn open(name: &str) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            if e == Errno::NOENT {
                LockstepError::SegmentNotFound {
                    name: name.to_string(),
                }
            } else {
                LockstepError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| LockstepError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        let identity = (stat.st_dev as u64, stat.st_ino as u64);
        if size == 0 {
            // Creator is between shm_open and ftruncate
            return Err(LockstepError::SegmentNotFound {
                name: name.to_string(),
            });
        }

        let addr = map_shared(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
            identity,
        })
    }

    /// Best-effort removal of the OS name
    ///
    /// Returns `true` if an object was removed. Existing mappings in any
    /// process stay valid until unmapped.
    pub fn unlink(name: &str) -> bool {
        match os_name(name) {
            Ok(c_name) => shm_unlink(c_name.as_c_str()).is_ok(),
            Err(_) => false,
        }
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.addr
    }

    /// Whether the OS name still refers to this segment's object
    ///
    /// False once a clobbering creator has replaced it.
    pub fn is_current(&self) -> bool {
        let Ok(c_name) = os_name(&self.name) else {
            return false;
        };
        shm_open(c_name.as_c_str(), ShmOFlags::RDONLY, Mode::empty())
            .and_then(|fd| identity_of(&fd))
            .map_or(false, |identity| identity == self.identity)
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of the segment
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle created the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        // Leave a successor's segment alone if ours was clobbered
        if self.is_owner && self.is_current() && Segment::unlink(&self.name) {
            tracing::info!(segment = %self.name, "removed shared memory segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("lockstep_shm_{}_{}", tag, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("create");
        let size = 4096;

        let seg1 = Segment::create(&name, size).unwrap();
        assert!(seg1.is_owner());
        assert_eq!(seg1.size(), size);

        unsafe {
            std::ptr::write(seg1.as_ptr().add(17), 42u8);
        }

        // Second mapping of the same object, as another process would see it
        let seg2 = Segment::open(&name).unwrap();
        assert!(!seg2.is_owner());
        assert_eq!(seg2.size(), size);

        let val = unsafe { std::ptr::read(seg2.as_ptr().add(17)) };
        assert_eq!(val, 42u8);

        drop(seg2);
        drop(seg1);
        assert!(matches!(
            Segment::open(&name),
            Err(LockstepError::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let name = unique("missing");
        match Segment::open(&name) {
            Err(LockstepError::SegmentNotFound { name: n }) => assert_eq!(n, name),
            other => panic!("unexpected result: {:?}", other.map(|s| s.size())),
        }
    }

    #[test]
    fn test_exclusive_create_rejects_existing() {
        let name = unique("excl");
        let _seg = Segment::create(&name, 4096).unwrap();
        assert!(matches!(
            Segment::create(&name, 4096),
            Err(LockstepError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_owner_drop_spares_replacement() {
        let name = unique("replace");
        let old = Segment::create(&name, 4096).unwrap();
        assert!(old.is_current());

        assert!(Segment::unlink(&name));
        let new = Segment::create(&name, 4096).unwrap();
        assert!(!old.is_current());
        assert!(new.is_current());

        drop(old);
        let reopened = Segment::open(&name).unwrap();
        assert!(reopened.is_current());
        drop(reopened);
        drop(new);
        assert!(Segment::open(&name).is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(matches!(
            Segment::open("a/b"),
            Err(LockstepError::InvalidName(_))
        ));
        assert!(matches!(Segment::open(""), Err(LockstepError::InvalidName(_))));
        let long = "x".repeat(MAX_SEGMENT_NAME + 1);
        assert!(matches!(
            Segment::open(&long),
            Err(LockstepError::NameTooLong { .. })
        ));
    }
}
