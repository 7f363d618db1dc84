//! The buffer descriptor and its reference-counted lifecycle.
//!
//! A [`DmaBuffer`] is a handle to one DMA-capable memory region. Three
//! acquisition strategies produce one:
//!
//! - [`DmaBuffer::alloc`] — driver-owned coherent memory, CPU- and
//!   device-addressable for its whole life.
//! - [`DmaBuffer::pin_user`] — pages borrowed and pinned from a caller's
//!   virtual address range.
//! - [`DmaBuffer::attach_shared`] — a foreign shared buffer wrapped via
//!   the exporter/importer protocol in [`crate::share`].
//!
//! Whatever the strategy, the result behaves identically afterwards:
//! cloning the handle takes a reference, dropping one releases it, and
//! the last drop tears the backing down exactly once — pages unpinned,
//! translations released, memory freed, device reference dropped, in
//! reverse acquisition order.
//!
//! # Example
//!
//! ```rust,ignore
//! use contigbuf::{AllocContext, DmaBuffer, DmaDirection, SoftDevice};
//! use std::sync::Arc;
//!
//! let ctx = AllocContext::new(Arc::new(SoftDevice::new()));
//! let buf = DmaBuffer::alloc(&ctx, 4096, DmaDirection::FromDevice)?;
//!
//! buf.prepare();
//! // ... device transfer against buf.device_address() ...
//! buf.finish();
//!
//! drop(buf); // last reference: memory freed, device released
//! ```

use crate::device::{
    AllocContext, CoherentBlock, CpuMapping, DmaAddr, DmaDevice, DmaDirection, FrameVector,
};
use crate::error::{Error, Result};
use crate::segment::SegmentTable;
use crate::share::{Attachment, ExportedBuffer, SharedBuffer, SharedHandle};
use std::sync::{Arc, Mutex};

/// How a buffer's memory was acquired. Fixed for the buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Driver-owned coherent allocation.
    Coherent,
    /// Pages pinned from a user virtual range.
    UserPinned,
    /// Attached foreign shared buffer.
    Imported,
}

/// Backing-specific state, dispatched by exhaustive match everywhere it
/// matters so the wrong kind's teardown can never run.
enum Backing {
    Coherent {
        block: Box<dyn CoherentBlock>,
        /// Base segment table describing the block, built lazily on first
        /// export and cached for the buffer's life.
        export_table: Mutex<Option<Arc<SegmentTable>>>,
    },
    UserPinned {
        frames: FrameVector,
        /// Present on the page-resolved path; absent when the single-run
        /// fallback synthesized `dma_addr` directly.
        table: Option<SegmentTable>,
        dma_addr: DmaAddr,
    },
    Imported {
        shared: Arc<dyn SharedBuffer>,
        state: Mutex<ImportState>,
    },
}

/// Mutable state of an imported buffer.
struct ImportState {
    /// Some until detach at teardown.
    attachment: Option<Attachment>,
    /// Some exactly while mapped.
    dma_addr: Option<DmaAddr>,
    /// Lazily filled CPU view from the exporter; dropped on unmap.
    cpu: Option<CpuMapping>,
}

/// Shared core of a buffer; one per acquisition, dropped exactly once.
struct BufferCore {
    size: usize,
    direction: DmaDirection,
    backing: Backing,
    /// Declared after `backing`: teardown of the backing may still call
    /// into the device.
    device: Arc<dyn DmaDevice>,
}

/// Handle to a DMA buffer.
///
/// Cheap to clone (reference increment); the backing is torn down when
/// the last handle drops. The count is observable via
/// [`DmaBuffer::reference_count`], and exported handles
/// ([`DmaBuffer::export`]) hold a reference of their own.
#[derive(Clone)]
pub struct DmaBuffer {
    core: Arc<BufferCore>,
}

impl DmaBuffer {
    /// Allocate a driver-owned coherent buffer.
    ///
    /// The buffer is born mapped: its device address is fixed for its
    /// whole life and a CPU view exists from the start.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero size or missing direction;
    /// `OutOfMemory` when the allocator fails (no side effects remain).
    pub fn alloc(ctx: &AllocContext, size: usize, direction: DmaDirection) -> Result<Self> {
        check_direction(direction)?;
        if size == 0 {
            return Err(Error::InvalidArgument("buffer size must be nonzero".into()));
        }
        let device = ctx.device();
        let block = device.alloc_coherent(size).inspect_err(|e| {
            tracing::error!(device = device.name(), size, "coherent allocation failed: {e}");
        })?;
        Ok(Self::from_backing(
            Backing::Coherent {
                block,
                export_table: Mutex::new(None),
            },
            device,
            size,
            direction,
        ))
    }

    /// Pin a user virtual range and wrap it as a buffer.
    ///
    /// The range is resolved to pinned page frames. When per-page
    /// structures are unavailable (reserved memory), the range is usable
    /// only if its frames form one physically contiguous run, in which
    /// case a single device address is synthesized and the buffer carries
    /// no segment table. Otherwise a segment table is built, translated
    /// for the device, and its contiguous run must cover `size` bytes.
    ///
    /// No CPU sync happens here; the first [`DmaBuffer::prepare`] does it.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `vaddr` or `size` misses the device's cache
    /// alignment or `size` is zero; `ContiguityViolation` when the
    /// validated run is too short; `OutOfMemory`/`Io` from table
    /// construction and translation. Every failure releases exactly the
    /// resources acquired before it, in reverse order.
    pub fn pin_user(
        ctx: &AllocContext,
        vaddr: u64,
        size: usize,
        direction: DmaDirection,
    ) -> Result<Self> {
        check_direction(direction)?;
        let device = ctx.device();

        // Only cache-aligned transfers are reliable on non-coherent
        // hardware.
        let align = device.cache_alignment() as u64;
        if align > 1 && (vaddr | size as u64) & (align - 1) != 0 {
            tracing::debug!(vaddr, size, align, "user range must be cache aligned");
            return Err(Error::InvalidArgument(format!(
                "user range must be aligned to {align} bytes"
            )));
        }
        if size == 0 {
            tracing::debug!("pin request with zero size");
            return Err(Error::InvalidArgument("buffer size must be nonzero".into()));
        }

        let frames = device.pin_user_pages(vaddr, size, direction.device_writes())?;

        if !frames.pages_resolved() {
            // No per-page structures for this memory. It is still usable
            // when the frames form one physical run: synthesize a single
            // device address covering the whole range, no segment table.
            if !frames.is_single_run() {
                let got = frames.contiguous_prefix() * crate::device::PAGE_SIZE;
                device.unpin_user_pages(&frames, false);
                return Err(Error::ContiguityViolation { need: size, got });
            }
            let dma_addr = device.frame_to_dma(frames.frames()[0]) + frames.offset() as u64;
            return Ok(Self::from_backing(
                Backing::UserPinned {
                    frames,
                    table: None,
                    dma_addr,
                },
                device,
                size,
                direction,
            ));
        }

        let mut table = match SegmentTable::from_frames(&frames, size) {
            Ok(table) => table,
            Err(e) => {
                device.unpin_user_pages(&frames, false);
                return Err(e);
            }
        };
        if let Err(e) = table.map_for_device(device.as_ref(), direction) {
            device.unpin_user_pages(&frames, false);
            return Err(e);
        }

        let contig = table.contiguous_run_length();
        let dma_addr = match table.device_address() {
            Some(addr) if contig >= size => addr,
            _ => {
                tracing::error!(contig, size, "contiguous mapping is too small");
                table.unmap_for_device(device.as_ref(), direction);
                device.unpin_user_pages(&frames, false);
                return Err(Error::ContiguityViolation {
                    need: size,
                    got: contig,
                });
            }
        };

        Ok(Self::from_backing(
            Backing::UserPinned {
                frames,
                table: Some(table),
                dma_addr,
            },
            device,
            size,
            direction,
        ))
    }

    /// Attach a foreign shared buffer.
    ///
    /// The buffer starts unmapped; call [`DmaBuffer::map_shared`] before
    /// using its device address.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the shared buffer is smaller than `size`,
    /// `size` is zero, or the direction is missing; attachment errors
    /// propagate from the exporter.
    pub fn attach_shared(
        ctx: &AllocContext,
        shared: Arc<dyn SharedBuffer>,
        size: usize,
        direction: DmaDirection,
    ) -> Result<Self> {
        check_direction(direction)?;
        if size == 0 {
            return Err(Error::InvalidArgument("buffer size must be nonzero".into()));
        }
        if shared.size() < size {
            return Err(Error::InvalidArgument(format!(
                "shared buffer too small: {} < {}",
                shared.size(),
                size
            )));
        }
        let device = ctx.device();
        let attachment = shared.attach(device)?;
        Ok(Self::from_backing(
            Backing::Imported {
                shared,
                state: Mutex::new(ImportState {
                    attachment: Some(attachment),
                    dma_addr: None,
                    cpu: None,
                }),
            },
            device,
            size,
            direction,
        ))
    }

    /// Map an imported buffer for this device.
    ///
    /// Requests the foreign segment table for the buffer's direction and
    /// validates that its contiguous run covers the buffer. Returns the
    /// device address.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a non-imported or already-mapped buffer (the
    /// double map is rejected, not silently accepted);
    /// `ContiguityViolation` when the foreign chunk is too small (the
    /// just-acquired mapping is released again); translation errors
    /// propagate from the exporter.
    pub fn map_shared(&self) -> Result<DmaAddr> {
        let Backing::Imported { shared, state } = &self.core.backing else {
            tracing::warn!("map_shared on a buffer that is not imported");
            return Err(Error::InvalidState("buffer is not an imported buffer"));
        };
        let mut st = lock(state);
        if st.dma_addr.is_some() {
            tracing::warn!("imported buffer is already mapped");
            return Err(Error::InvalidState("imported buffer is already mapped"));
        }
        let Some(attachment) = st.attachment.as_mut() else {
            return Err(Error::InvalidState("imported buffer is detached"));
        };

        shared.map_attachment(attachment, self.core.direction)?;

        let contig = attachment.table().contiguous_run_length();
        let dma_addr = match attachment.table().device_address() {
            Some(addr) if contig >= self.core.size => addr,
            _ => {
                tracing::error!(
                    contig,
                    size = self.core.size,
                    "imported contiguous chunk is too small"
                );
                shared.unmap_attachment(attachment, self.core.direction);
                return Err(Error::ContiguityViolation {
                    need: self.core.size,
                    got: contig,
                });
            }
        };

        st.dma_addr = Some(dma_addr);
        Ok(dma_addr)
    }

    /// Unmap an imported buffer.
    ///
    /// Releases the CPU view first, then the device-side mapping of the
    /// foreign segment table.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a non-imported or currently unmapped buffer.
    pub fn unmap_shared(&self) -> Result<()> {
        let Backing::Imported { shared, state } = &self.core.backing else {
            tracing::warn!("unmap_shared on a buffer that is not imported");
            return Err(Error::InvalidState("buffer is not an imported buffer"));
        };
        let mut st = lock(state);
        if st.dma_addr.is_none() {
            tracing::warn!("imported buffer is not mapped");
            return Err(Error::InvalidState("imported buffer is not mapped"));
        }
        st.cpu = None;
        if let Some(attachment) = st.attachment.as_mut() {
            shared.unmap_attachment(attachment, self.core.direction);
        }
        st.dma_addr = None;
        Ok(())
    }

    /// Export this buffer as a shareable handle.
    ///
    /// Lazily builds (once, cached) a segment table describing the
    /// buffer's memory and takes a reference on the buffer; dropping the
    /// returned handle releases that reference. Only driver-allocated
    /// buffers describe their own memory, so only they can be exported.
    ///
    /// # Errors
    ///
    /// `InvalidState` for user-pinned or imported buffers; table
    /// construction errors propagate from the device.
    pub fn export(&self) -> Result<SharedHandle> {
        let Backing::Coherent {
            block,
            export_table,
        } = &self.core.backing
        else {
            tracing::warn!("export of a buffer that does not own its memory");
            return Err(Error::InvalidState(
                "only driver-allocated buffers can be exported",
            ));
        };
        let base = {
            let mut cached = export_table
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if cached.is_none() {
                let table = self.core.device.describe_coherent(block.as_ref())?;
                *cached = Some(Arc::new(table));
            }
            // Filled just above.
            cached.as_ref().map(Arc::clone)
        };
        match base {
            Some(base) => Ok(Arc::new(ExportedBuffer::new(self.clone(), base))),
            None => Err(Error::Io("export table was not built".into())),
        }
    }

    /// Flush CPU-cached writes so the device observes them. Call after
    /// the last CPU write and before device access.
    ///
    /// No-op for buffers without a local segment table: coherent memory
    /// needs no sync, and a foreign exporter synchronizes its own memory.
    pub fn prepare(&self) {
        if let Backing::UserPinned {
            table: Some(table), ..
        } = &self.core.backing
        {
            self.core.device.sync_for_device(table, self.core.direction);
        }
    }

    /// Invalidate/refresh CPU caches so the CPU observes device writes.
    /// Call after device access and before the next CPU read.
    ///
    /// Same no-op condition as [`DmaBuffer::prepare`].
    pub fn finish(&self) {
        if let Backing::UserPinned {
            table: Some(table), ..
        } = &self.core.backing
        {
            self.core.device.sync_for_cpu(table, self.core.direction);
        }
    }

    /// The buffer's device-visible address, when mapped.
    ///
    /// Coherent and user-pinned buffers are always mapped; imported
    /// buffers only between [`DmaBuffer::map_shared`] and
    /// [`DmaBuffer::unmap_shared`].
    pub fn device_address(&self) -> Option<DmaAddr> {
        match &self.core.backing {
            Backing::Coherent { block, .. } => Some(block.dma_addr()),
            Backing::UserPinned { dma_addr, .. } => Some(*dma_addr),
            Backing::Imported { state, .. } => lock(state).dma_addr,
        }
    }

    /// The buffer's CPU-visible view, when one exists.
    ///
    /// Coherent buffers carry one from birth. Imported buffers establish
    /// one lazily from their exporter and cache it until unmap.
    /// User-pinned buffers have none: the caller already owns a virtual
    /// view of that memory.
    pub fn cpu_mapping(&self) -> Option<CpuMapping> {
        match &self.core.backing {
            Backing::Coherent { block, .. } => {
                Some(CpuMapping::new(block.cpu_ptr(), self.core.size))
            }
            Backing::UserPinned { .. } => None,
            Backing::Imported { shared, state } => {
                let mut st = lock(state);
                if st.cpu.is_none() && st.attachment.is_some() {
                    st.cpu = shared.cpu_map();
                }
                st.cpu
            }
        }
    }

    /// Number of live references to this buffer, exported handles
    /// included.
    #[inline]
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.core.size
    }

    /// Transfer direction the buffer was acquired for.
    #[inline]
    pub fn direction(&self) -> DmaDirection {
        self.core.direction
    }

    /// How the buffer's memory was acquired.
    pub fn kind(&self) -> BackingKind {
        match &self.core.backing {
            Backing::Coherent { .. } => BackingKind::Coherent,
            Backing::UserPinned { .. } => BackingKind::UserPinned,
            Backing::Imported { .. } => BackingKind::Imported,
        }
    }

    /// Whether the buffer currently has a device address.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.device_address().is_some()
    }

    fn from_backing(
        backing: Backing,
        device: &Arc<dyn DmaDevice>,
        size: usize,
        direction: DmaDirection,
    ) -> Self {
        Self {
            core: Arc::new(BufferCore {
                size,
                direction,
                backing,
                device: Arc::clone(device),
            }),
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("kind", &self.kind())
            .field("size", &self.core.size)
            .field("direction", &self.core.direction)
            .field("mapped", &self.is_mapped())
            .field("refcount", &self.reference_count())
            .finish()
    }
}

impl Drop for BufferCore {
    fn drop(&mut self) {
        match &mut self.backing {
            Backing::Coherent { .. } => {
                // Cached export table and the block itself free on drop;
                // the device reference follows.
            }
            Backing::UserPinned { frames, table, .. } => {
                if let Some(table) = table.as_mut() {
                    // No CPU sync here: finish() has already run.
                    table.unmap_for_device(self.device.as_ref(), self.direction);
                }
                self.device
                    .unpin_user_pages(frames, self.direction.device_writes());
            }
            Backing::Imported { shared, state } => {
                let st = state
                    .get_mut()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if st.dma_addr.is_some() {
                    // The framework should have unmapped before the last
                    // release; refuse to leak the mapping.
                    tracing::warn!("releasing an imported buffer that is still mapped");
                    st.cpu = None;
                    if let Some(attachment) = st.attachment.as_mut() {
                        shared.unmap_attachment(attachment, self.direction);
                    }
                    st.dma_addr = None;
                }
                if let Some(attachment) = st.attachment.take() {
                    shared.detach(attachment);
                }
            }
        }
    }
}

fn check_direction(direction: DmaDirection) -> Result<()> {
    if direction == DmaDirection::None {
        return Err(Error::InvalidArgument(
            "a buffer needs a transfer direction".into(),
        ));
    }
    Ok(())
}

fn lock(state: &Mutex<ImportState>) -> std::sync::MutexGuard<'_, ImportState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
