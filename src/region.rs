//! Named shared memory region with an object directory and heap
//!
//! # Layout
//!
//! ```text
//! +----------------------------------------------+ 0
//! | RegionHeader: magic, version, size           |
//! |   heap bookkeeping (lock, bump, free list)   |
//! |   directory: name -> (kind, layout, offset)  |
//! +----------------------------------------------+ heap start (16-aligned)
//! | heap blocks: payload records, batch buffers, |
//! | sync counters                                |
//! +----------------------------------------------+ size
//! ```
//!
//! Every reference stored inside the region is an offset from its base, so
//! the region can be mapped at different addresses in the two processes.

use crate::config::CreatePolicy;
use crate::envelope::{Envelope, ObjectKind, ObjectTag};
use crate::error::{LockstepError, Result};
use crate::heap::{Heap, HeapHeader, HEAP_ALIGN};
use crate::shm::Segment;
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

const REGION_MAGIC: u32 = 0x4C4B_5354; // "LKST"
const REGION_VERSION: u32 = 1;

/// Maximum number of named objects in one region
pub const MAX_OBJECTS: usize = 8;

/// Maximum length of an object name in bytes
pub const MAX_OBJECT_NAME: usize = 127;

/// Smallest region that leaves room for a useful heap
pub const MIN_REGION_SIZE: usize = std::mem::size_of::<RegionHeader>() + 256;

#[repr(C)]
struct DirEntry {
    name: [u8; MAX_OBJECT_NAME + 1],
    kind: u32,
    size: u32,
    align: u32,
    _pad: u32,
    offset: u64,
}

impl DirEntry {
    fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn tag(&self) -> Option<ObjectTag> {
        ObjectKind::from_raw(self.kind)
            .map(|kind| ObjectTag::new(kind, self.size as usize, self.align as usize))
    }
}

#[repr(C, align(64))]
struct RegionHeader {
    /// Written last by the creator; a matching value means the header is ready
    magic: AtomicU32,
    version: u32,
    size: u64,
    heap: HeapHeader,
    entry_count: AtomicU32,
    _pad: u32,
    directory: [DirEntry; MAX_OBJECTS],
}

/// A mapped region plus its in-region object directory
pub struct Region {
    segment: Segment,
    header: NonNull<RegionHeader>,
}

// SAFETY: shared state in the header is atomic or guarded by the heap lock;
// payload bytes are guarded by the channel brackets
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn check_object_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(LockstepError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_OBJECT_NAME {
        return Err(LockstepError::NameTooLong {
            max: MAX_OBJECT_NAME,
            got: name.len(),
        });
    }
    Ok(())
}

impl Region {
    /// Create the region, replacing or refusing a stale segment per `policy`
    pub fn create(name: &str, size: usize, policy: CreatePolicy) -> Result<Self> {
        if size < MIN_REGION_SIZE {
            return Err(LockstepError::RegionTooSmall {
                min: MIN_REGION_SIZE,
                got: size,
            });
        }

        if policy == CreatePolicy::Clobber && Segment::unlink(name) {
            tracing::warn!(segment = %name, "removed pre-existing shared memory segment");
        }

        let segment = Segment::create(name, size)?;
        let header = segment.base().cast::<RegionHeader>().as_ptr();

        let heap_start = (std::mem::size_of::<RegionHeader>() + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);
        let heap_end = size & !(HEAP_ALIGN - 1);

        unsafe {
            addr_of_mut!((*header).version).write(REGION_VERSION);
            addr_of_mut!((*header).size).write(size as u64);
            HeapHeader::init(
                addr_of_mut!((*header).heap),
                heap_start as u64,
                heap_end as u64,
            );
            addr_of_mut!((*header).entry_count).write(AtomicU32::new(0));
            (*addr_of!((*header).magic)).store(REGION_MAGIC, Ordering::Release);
        }

        tracing::info!(segment = %name, size, "created shared memory region");

        Ok(Self {
            header: segment.base().cast(),
            segment,
        })
    }

    /// Attach to a region created by the peer
    pub fn open(name: &str) -> Result<Self> {
        let segment = Segment::open(name)?;
        if segment.size() < std::mem::size_of::<RegionHeader>() {
            return Err(LockstepError::RegionTooSmall {
                min: std::mem::size_of::<RegionHeader>(),
                got: segment.size(),
            });
        }

        let header = segment.base().cast::<RegionHeader>().as_ptr();
        unsafe {
            let magic = (*addr_of!((*header).magic)).load(Ordering::Acquire);
            if magic != REGION_MAGIC {
                return Err(LockstepError::InvalidMagic {
                    expected: REGION_MAGIC,
                    got: magic,
                });
            }
            let version = addr_of!((*header).version).read();
            if version != REGION_VERSION {
                return Err(LockstepError::VersionMismatch {
                    expected: REGION_VERSION,
                    got: version,
                });
            }
            let (_, heap_end) = (*addr_of!((*header).heap)).span();
            if heap_end as usize > segment.size() {
                return Err(LockstepError::RegionTooSmall {
                    min: heap_end as usize,
                    got: segment.size(),
                });
            }
        }

        let region = Self {
            header: segment.base().cast(),
            segment,
        };
        tracing::info!(
            segment = %name,
            size = region.size(),
            objects = region.entry_count().load(Ordering::Acquire),
            "attached to shared memory region"
        );
        Ok(region)
    }

    /// Best-effort removal of a region by name
    pub fn destroy(name: &str) -> bool {
        Segment::unlink(name)
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn size(&self) -> usize {
        self.segment.size()
    }

    pub fn is_creator(&self) -> bool {
        self.segment.is_owner()
    }

    fn heap(&self) -> Heap<'_> {
        unsafe {
            let header = self.header.as_ptr();
            Heap::new(self.segment.as_ptr(), &*addr_of!((*header).heap))
        }
    }

    fn entry_count(&self) -> &AtomicU32 {
        unsafe { &*addr_of!((*self.header.as_ptr()).entry_count) }
    }

    fn entry_ptr(&self, index: usize) -> *mut DirEntry {
        debug_assert!(index < MAX_OBJECTS);
        unsafe {
            addr_of_mut!((*self.header.as_ptr()).directory)
                .cast::<DirEntry>()
                .add(index)
        }
    }

    fn lookup(&self, name: &str) -> Option<&DirEntry> {
        let count = (self.entry_count().load(Ordering::Acquire) as usize).min(MAX_OBJECTS);
        (0..count)
            .map(|i| unsafe { &*self.entry_ptr(i) })
            .find(|entry| entry.name() == name.as_bytes())
    }

    /// Pointer to a region offset
    #[inline]
    pub(crate) fn at(&self, offset: u64) -> NonNull<u8> {
        debug_assert!((offset as usize) < self.size());
        // SAFETY: offsets come from the directory or the heap, both inside the mapping
        unsafe { NonNull::new_unchecked(self.segment.as_ptr().add(offset as usize)) }
    }

    /// Offset of a pointer into this region
    #[inline]
    pub(crate) fn offset_of(&self, ptr: *const u8) -> u64 {
        (ptr as usize - self.segment.as_ptr() as usize) as u64
    }

    /// Allocate heap bytes, returning the region offset
    pub(crate) fn alloc(&self, bytes: usize) -> Result<u64> {
        let heap = self.heap();
        let locked = heap.lock();
        let offset = locked.alloc(bytes).ok_or_else(|| LockstepError::OutOfMemory {
            requested: bytes,
            available: locked.free_bytes(),
        })?;
        tracing::debug!(segment = %self.name(), bytes, offset, "heap allocation");
        Ok(offset)
    }

    /// Return bytes obtained from [`Region::alloc`]
    pub(crate) fn dealloc(&self, offset: u64) {
        self.heap().lock().free(offset);
    }

    /// Heap bytes not yet handed out
    pub fn free_bytes(&self) -> usize {
        self.heap().lock().free_bytes()
    }

    /// Construct a zeroed object of `bytes` bytes under `name`
    pub fn construct_raw(&self, name: &str, tag: ObjectTag, bytes: usize) -> Result<NonNull<u8>> {
        self.construct_with(name, tag, bytes, |_| {})
    }

    /// Like [`Region::construct_raw`], running `init` on the zeroed bytes
    /// before the name becomes visible to the peer
    pub(crate) fn construct_with<F>(&self, name: &str, tag: ObjectTag, bytes: usize, init: F) -> Result<NonNull<u8>>
    where
        F: FnOnce(NonNull<u8>),
    {
        if !self.is_creator() {
            return Err(LockstepError::CreatorOnly("construct"));
        }
        check_object_name(name)?;
        if tag.align > HEAP_ALIGN {
            return Err(LockstepError::UnsupportedAlignment {
                align: tag.align,
                max: HEAP_ALIGN,
            });
        }

        let heap = self.heap();
        let locked = heap.lock();

        if self.lookup(name).is_some() {
            return Err(LockstepError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let count = self.entry_count().load(Ordering::Relaxed) as usize;
        if count >= MAX_OBJECTS {
            return Err(LockstepError::DirectoryFull { max: MAX_OBJECTS });
        }

        let offset = locked.alloc(bytes).ok_or_else(|| LockstepError::OutOfMemory {
            requested: bytes,
            available: locked.free_bytes(),
        })?;
        let ptr = self.at(offset);

        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, bytes);
            init(ptr);

            let mut entry = DirEntry {
                name: [0; MAX_OBJECT_NAME + 1],
                kind: tag.kind as u32,
                size: tag.size as u32,
                align: tag.align as u32,
                _pad: 0,
                offset,
            };
            entry.name[..name.len()].copy_from_slice(name.as_bytes());
            self.entry_ptr(count).write(entry);
        }
        self.entry_count().store(count as u32 + 1, Ordering::Release);
        drop(locked);

        tracing::debug!(segment = %self.name(), object = %name, %tag, offset, "constructed object");
        Ok(ptr)
    }

    /// Locate an object constructed by the creator, checking its layout
    pub fn find_raw(&self, name: &str, tag: ObjectTag) -> Result<NonNull<u8>> {
        check_object_name(name)?;
        let entry = self.lookup(name).ok_or_else(|| LockstepError::ObjectNotFound {
            name: name.to_string(),
        })?;

        match entry.tag() {
            Some(found) if found == tag => {}
            found => {
                return Err(LockstepError::TypeMismatch {
                    name: name.to_string(),
                    expected: tag.to_string(),
                    found: found.map_or_else(|| format!("kind {}", entry.kind), |t| t.to_string()),
                })
            }
        }

        tracing::debug!(segment = %self.name(), object = %name, %tag, offset = entry.offset, "found object");
        Ok(self.at(entry.offset))
    }

    /// Construct a zeroed record of type `T`
    pub fn construct<T: Envelope>(&self, name: &str) -> Result<NonNull<T>> {
        self.construct_raw(
            name,
            ObjectTag::of::<T>(ObjectKind::Record),
            std::mem::size_of::<T>(),
        )
        .map(NonNull::cast)
    }

    /// Find a record of type `T`
    pub fn find<T: Envelope>(&self, name: &str) -> Result<NonNull<T>> {
        self.find_raw(name, ObjectTag::of::<T>(ObjectKind::Record))
            .map(NonNull::cast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("lockstep_region_{}_{}", tag, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_construct_then_find_from_second_mapping() {
        let name = unique("find");
        let creator = Region::create(&name, 8192, CreatePolicy::Clobber).unwrap();
        let ptr = creator.construct::<u64>("counter").unwrap();
        unsafe { ptr.as_ptr().write(0xDEAD_BEEF) };

        let attacher = Region::open(&name).unwrap();
        assert!(!attacher.is_creator());
        let seen = attacher.find::<u64>("counter").unwrap();
        assert_eq!(unsafe { seen.as_ptr().read() }, 0xDEAD_BEEF);
        assert_eq!(
            attacher.offset_of(seen.as_ptr().cast::<u8>()),
            creator.offset_of(ptr.as_ptr().cast::<u8>())
        );
    }

    #[test]
    fn test_find_missing_object() {
        let name = unique("missing");
        let region = Region::create(&name, 8192, CreatePolicy::Clobber).unwrap();
        assert!(matches!(
            region.find::<u32>("nope"),
            Err(LockstepError::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_find_with_wrong_layout() {
        let name = unique("layout");
        let region = Region::create(&name, 8192, CreatePolicy::Clobber).unwrap();
        region.construct::<u32>("value").unwrap();
        match region.find::<u64>("value") {
            Err(LockstepError::TypeMismatch { expected, found, .. }) => {
                assert_eq!(expected, "Record(size=8, align=8)");
                assert_eq!(found, "Record(size=4, align=4)");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            region.find_raw("value", ObjectTag::of::<u32>(ObjectKind::Batch)),
            Err(LockstepError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_attacher_construct_rejected() {
        let name = unique("dup");
        let creator = Region::create(&name, 8192, CreatePolicy::Clobber).unwrap();
        creator.construct::<u32>("once").unwrap();
        assert!(matches!(
            creator.construct::<u32>("once"),
            Err(LockstepError::AlreadyExists { .. })
        ));

        let attacher = Region::open(&name).unwrap();
        assert!(matches!(
            attacher.construct::<u32>("other"),
            Err(LockstepError::CreatorOnly("construct"))
        ));
    }

    #[test]
    fn test_directory_full() {
        let name = unique("full");
        let region = Region::create(&name, 16384, CreatePolicy::Clobber).unwrap();
        for i in 0..MAX_OBJECTS {
            region.construct::<u8>(&format!("obj{}", i)).unwrap();
        }
        assert!(matches!(
            region.construct::<u8>("one_more"),
            Err(LockstepError::DirectoryFull { max: MAX_OBJECTS })
        ));
    }

    #[test]
    fn test_clobber_and_exclusive_policies() {
        let name = unique("policy");
        let first = Region::create(&name, 8192, CreatePolicy::Clobber).unwrap();
        assert!(matches!(
            Region::create(&name, 8192, CreatePolicy::Exclusive),
            Err(LockstepError::AlreadyExists { .. })
        ));

        let second = Region::create(&name, 8192, CreatePolicy::Clobber).unwrap();
        second.construct::<u8>("fresh").unwrap();
        // The first mapping survives but no longer backs the name
        assert!(first.find::<u8>("fresh").is_err());
        drop(first);
        drop(second);
    }

    #[test]
    fn test_undersized_region() {
        let name = unique("small");
        assert!(matches!(
            Region::create(&name, 64, CreatePolicy::Clobber),
            Err(LockstepError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn test_out_of_memory() {
        let name = unique("oom");
        let region = Region::create(&name, MIN_REGION_SIZE, CreatePolicy::Clobber).unwrap();
        match region.construct::<[u8; 4096]>("big") {
            Err(LockstepError::OutOfMemory { requested, available }) => {
                assert_eq!(requested, 4096);
                assert!(available < 4096);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_heap_shared_by_two_mappings() {
        const ROUNDS: u64 = 5000;
        const LIVE: usize = 9;
        const WORDS: usize = 8;

        let name = unique("contend");
        let creator = Region::create(&name, 16384, CreatePolicy::Clobber).unwrap();
        let before = creator.free_bytes();

        let workers: Vec<_> = (1..=2u64)
            .map(|id| {
                let name = name.clone();
                std::thread::spawn(move || {
                    let region = Region::open(&name).unwrap();
                    let mut live: Vec<(u64, u64)> = Vec::new();
                    for round in 0..ROUNDS {
                        if live.len() == LIVE {
                            let (offset, stamp) = live.remove(0);
                            let words = region.at(offset).cast::<u64>();
                            for i in 0..WORDS {
                                assert_eq!(unsafe { words.as_ptr().add(i).read() }, stamp);
                            }
                            region.dealloc(offset);
                        }
                        let offset = region.alloc(WORDS * 8).unwrap();
                        assert_eq!(offset % HEAP_ALIGN as u64, 0);
                        let stamp = (id << 56) | round;
                        let words = region.at(offset).cast::<u64>();
                        for i in 0..WORDS {
                            unsafe { words.as_ptr().add(i).write(stamp) };
                        }
                        live.push((offset, stamp));
                    }
                    for (offset, _) in live {
                        region.dealloc(offset);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // Everything came back; only the headers of the blocks ever carved remain
        let used = before - creator.free_bytes();
        assert_eq!(used % HEAP_ALIGN, 0);
        assert!(used <= 2 * LIVE * HEAP_ALIGN, "used {} bytes", used);
    }
}
