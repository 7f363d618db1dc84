//! Software reference device.
//!
//! [`SoftDevice`] implements [`DmaDevice`] without hardware: coherent
//! blocks are real memory (memfd + mmap, so CPU views behave like the
//! real thing), while physical frames and device addresses come from
//! deterministic bump counters. Real DMA hardware needs a driver-side
//! implementation of the trait; `SoftDevice` serves tests, demos, and
//! consumers that only ever run the CPU side of a pipeline.
//!
//! Layout and translation policies are configurable so tests can steer a
//! buffer down every acquisition path, including the failing ones. The
//! device counts every operation ([`SoftDevice::stats`]); lifecycle tests
//! lean on those counters to prove exactly-once teardown.
//!
//! # Example
//!
//! ```rust,ignore
//! use contigbuf::{AllocContext, DmaBuffer, DmaDirection, SoftDevice};
//! use std::sync::Arc;
//!
//! let device = Arc::new(SoftDevice::new());
//! let ctx = AllocContext::new(device.clone());
//!
//! let buf = DmaBuffer::alloc(&ctx, 4096, DmaDirection::FromDevice)?;
//! drop(buf);
//! assert_eq!(device.stats().coherent_frees, 1);
//! ```

use crate::device::{
    CoherentBlock, DmaAddr, DmaDevice, DmaDirection, FrameVector, PAGE_SHIFT, PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentTable};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Base of the synthetic physical space coherent blocks come from.
const PHYS_BASE: u64 = 0x1000_0000;

/// Base of the synthetic IOVA space handed out by remapped translation.
const IOVA_BASE: u64 = 0xD000_0000;

/// Align a value up to the given alignment (power of two).
#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// How the device translates physical segments to device addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// IOMMU-style: every mapping gets one fresh contiguous IOVA window,
    /// whatever the physical layout.
    Remapped,
    /// Device addresses equal physical addresses.
    Direct,
    /// Fault injection: every segment lands in a disjoint IOVA window, so
    /// no two segments are ever contiguous.
    Scattered,
    /// Fault injection: translation always fails.
    Rejected,
}

/// How pinned virtual pages resolve to physical frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// Sequential pages back one physically contiguous run.
    Contiguous,
    /// Every page lands two frames after the previous one: pages resolve,
    /// but the range is physically scattered.
    Interleaved,
}

/// Operation counters, shared with the blocks a device hands out.
#[derive(Default)]
struct SoftState {
    coherent_allocs: AtomicU64,
    coherent_frees: AtomicU64,
    pins: AtomicU64,
    unpins: AtomicU64,
    dirty_unpins: AtomicU64,
    translations: AtomicU64,
    translation_releases: AtomicU64,
    device_syncs: AtomicU64,
    cpu_syncs: AtomicU64,
    next_phys: AtomicU64,
    next_iova: AtomicU64,
}

/// Snapshot of a [`SoftDevice`]'s operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftStats {
    /// Coherent blocks allocated.
    pub coherent_allocs: u64,
    /// Coherent blocks freed.
    pub coherent_frees: u64,
    /// User ranges pinned.
    pub pins: u64,
    /// User ranges unpinned.
    pub unpins: u64,
    /// Unpins that marked their pages modified.
    pub dirty_unpins: u64,
    /// Segment translations performed.
    pub translations: u64,
    /// Segment translations released.
    pub translation_releases: u64,
    /// CPU-to-device cache syncs.
    pub device_syncs: u64,
    /// Device-to-CPU cache syncs.
    pub cpu_syncs: u64,
}

/// A [`DmaDevice`] implemented in software.
pub struct SoftDevice {
    name: String,
    alignment: usize,
    translation: Translation,
    frame_layout: FrameLayout,
    page_structs: bool,
    state: Arc<SoftState>,
}

impl SoftDevice {
    /// Create a device with the default configuration: 64-byte cache
    /// alignment, remapped translation, contiguous frames, page
    /// structures available.
    pub fn new() -> Self {
        Self {
            name: "soft-dma".to_string(),
            alignment: 64,
            translation: Translation::Remapped,
            frame_layout: FrameLayout::Contiguous,
            page_structs: true,
            state: Arc::new(SoftState {
                next_phys: AtomicU64::new(PHYS_BASE),
                next_iova: AtomicU64::new(IOVA_BASE),
                ..SoftState::default()
            }),
        }
    }

    /// Set the device name shown in diagnostics.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the cache alignment user ranges must satisfy.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the translation policy.
    pub fn with_translation(mut self, translation: Translation) -> Self {
        self.translation = translation;
        self
    }

    /// Set how pinned pages resolve to physical frames.
    pub fn with_frame_layout(mut self, frame_layout: FrameLayout) -> Self {
        self.frame_layout = frame_layout;
        self
    }

    /// Pretend the platform has no per-page structures, forcing the
    /// physical-contiguity fallback on every pin.
    pub fn without_page_structs(mut self) -> Self {
        self.page_structs = false;
        self
    }

    /// Snapshot the operation counters.
    pub fn stats(&self) -> SoftStats {
        let s = &self.state;
        SoftStats {
            coherent_allocs: s.coherent_allocs.load(Ordering::Acquire),
            coherent_frees: s.coherent_frees.load(Ordering::Acquire),
            pins: s.pins.load(Ordering::Acquire),
            unpins: s.unpins.load(Ordering::Acquire),
            dirty_unpins: s.dirty_unpins.load(Ordering::Acquire),
            translations: s.translations.load(Ordering::Acquire),
            translation_releases: s.translation_releases.load(Ordering::Acquire),
            device_syncs: s.device_syncs.load(Ordering::Acquire),
            cpu_syncs: s.cpu_syncs.load(Ordering::Acquire),
        }
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftDevice")
            .field("name", &self.name)
            .field("translation", &self.translation)
            .field("frame_layout", &self.frame_layout)
            .field("page_structs", &self.page_structs)
            .finish()
    }
}

/// A coherent block backed by memfd memory.
struct SoftBlock {
    ptr: NonNull<u8>,
    len: usize,
    dma_addr: DmaAddr,
    /// Keeps the memfd alive for the mapping's lifetime.
    _fd: OwnedFd,
    state: Arc<SoftState>,
}

impl CoherentBlock for SoftBlock {
    fn cpu_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn dma_addr(&self) -> DmaAddr {
        self.dma_addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SoftBlock {
    fn drop(&mut self) {
        // SAFETY: ptr/len are the mapping created in alloc_coherent and
        // nothing else unmaps it.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        self.state.coherent_frees.fetch_add(1, Ordering::AcqRel);
    }
}

// SAFETY: the mapping is plain shared memory usable from any thread;
// concurrent access discipline is the caller's, same as any shared
// memory.
unsafe impl Send for SoftBlock {}
unsafe impl Sync for SoftBlock {}

impl DmaDevice for SoftDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn cache_alignment(&self) -> usize {
        self.alignment
    }

    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn CoherentBlock>> {
        let cname =
            CString::new("contigbuf-coherent").map_err(|e| Error::OutOfMemory(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::OutOfMemory(format!("memfd_create failed: {}", e)))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::OutOfMemory(format!("ftruncate failed: {}", e)))?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| Error::OutOfMemory(format!("mmap failed: {}", e)))?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::OutOfMemory("mmap returned null".into()))?;

        // The soft coherent region is direct-mapped: its device address
        // doubles as its physical address.
        let dma_addr = self
            .state
            .next_phys
            .fetch_add(align_up(size, PAGE_SIZE) as u64, Ordering::AcqRel);

        self.state.coherent_allocs.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SoftBlock {
            ptr,
            len: size,
            dma_addr,
            _fd: fd,
            state: Arc::clone(&self.state),
        }))
    }

    fn describe_coherent(&self, block: &dyn CoherentBlock) -> Result<SegmentTable> {
        // Page-granular description, the shape a table built from the
        // block's pages would have.
        let pages = align_up(block.len(), PAGE_SIZE) / PAGE_SIZE;
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(pages)
            .map_err(|_| Error::OutOfMemory("segment table storage".into()))?;
        let mut remaining = block.len();
        for i in 0..pages {
            let len = remaining.min(PAGE_SIZE);
            segments.push(Segment {
                phys_addr: block.dma_addr() + (i * PAGE_SIZE) as u64,
                len,
                dma_addr: 0,
            });
            remaining -= len;
        }
        Ok(SegmentTable::new(segments))
    }

    fn pin_user_pages(&self, vaddr: u64, size: usize, _writable: bool) -> Result<FrameVector> {
        if size == 0 {
            return Err(Error::InvalidArgument("cannot pin an empty range".into()));
        }
        let offset = (vaddr as usize) & (PAGE_SIZE - 1);
        let first_vpn = vaddr >> PAGE_SHIFT;
        let pages = align_up(offset + size, PAGE_SIZE) / PAGE_SIZE;

        let mut frames = Vec::new();
        frames
            .try_reserve_exact(pages)
            .map_err(|_| Error::OutOfMemory("frame vector storage".into()))?;
        for i in 0..pages as u64 {
            let frame = match self.frame_layout {
                FrameLayout::Contiguous => first_vpn + i,
                FrameLayout::Interleaved => first_vpn + i * 2,
            };
            frames.push(frame);
        }

        self.state.pins.fetch_add(1, Ordering::AcqRel);
        Ok(FrameVector::new(frames, offset, self.page_structs))
    }

    fn unpin_user_pages(&self, _frames: &FrameVector, mark_dirty: bool) {
        if mark_dirty {
            self.state.dirty_unpins.fetch_add(1, Ordering::AcqRel);
        }
        self.state.unpins.fetch_add(1, Ordering::AcqRel);
    }

    fn map_segments(&self, segments: &mut [Segment], direction: DmaDirection) -> Result<usize> {
        if direction == DmaDirection::None {
            return Err(Error::InvalidArgument(
                "a mapping needs a transfer direction".into(),
            ));
        }
        match self.translation {
            Translation::Rejected => {
                return Err(Error::Io("address translation rejected".into()));
            }
            Translation::Direct => {
                for s in segments.iter_mut() {
                    s.dma_addr = s.phys_addr;
                }
            }
            Translation::Remapped => {
                let total: usize = segments.iter().map(|s| s.len).sum();
                let mut iova = self
                    .state
                    .next_iova
                    .fetch_add(align_up(total, PAGE_SIZE) as u64, Ordering::AcqRel);
                for s in segments.iter_mut() {
                    s.dma_addr = iova;
                    iova += s.len as u64;
                }
            }
            Translation::Scattered => {
                for s in segments.iter_mut() {
                    // One window per segment, with a guard page between.
                    s.dma_addr = self
                        .state
                        .next_iova
                        .fetch_add(align_up(s.len, PAGE_SIZE) as u64 + PAGE_SIZE as u64, Ordering::AcqRel);
                }
            }
        }
        self.state.translations.fetch_add(1, Ordering::AcqRel);
        Ok(segments.len())
    }

    fn unmap_segments(&self, _segments: &[Segment], _direction: DmaDirection) {
        self.state
            .translation_releases
            .fetch_add(1, Ordering::AcqRel);
    }

    fn sync_for_device(&self, _table: &SegmentTable, _direction: DmaDirection) {
        self.state.device_syncs.fetch_add(1, Ordering::AcqRel);
    }

    fn sync_for_cpu(&self, _table: &SegmentTable, _direction: DmaDirection) {
        self.state.cpu_syncs.fetch_add(1, Ordering::AcqRel);
    }
}
