//! Export/import bridge: sharing one physical buffer between producers
//! and consumers without copying.
//!
//! The exporter side wraps a [`DmaBuffer`] as a [`SharedHandle`]; the
//! importer side is [`DmaBuffer::attach_shared`] plus the
//! map/unmap/detach protocol. Two instances of this crate, or a third
//! party implementing [`SharedBuffer`], can share one buffer this way.
//!
//! # Protocol
//!
//! ```text
//! exporter                           importer
//! --------                           --------
//! export()        ── handle ──▶      attach_shared(handle, ..)
//!                 ◀─ attach ──
//!                 ◀── map ────       map_shared()      (per use)
//!                 ◀── unmap ──       unmap_shared()
//!                 ◀── detach ─       drop(buffer)
//! drop(handle)
//! ```
//!
//! Each attachment owns a private copy of the exporter's segment table:
//! one translation cache cannot serve several consumers at once. Map and
//! unmap are serialized by a mutex owned by the exported buffer itself,
//! because concurrent remapping with different directions on one cache is
//! unsafe; independent buffers never contend.

use crate::buffer::DmaBuffer;
use crate::device::{CpuMapping, DmaDevice, DmaDirection};
use crate::error::{Error, Result};
use crate::segment::SegmentTable;
use std::sync::{Arc, Mutex};

/// A shareable handle to an exported buffer.
///
/// Holds one reference on the underlying buffer; dropping the last
/// handle releases it.
pub type SharedHandle = Arc<ExportedBuffer>;

/// A consumer's attachment to a shared buffer.
///
/// Owns a private unmapped copy of the exporter's segment table and the
/// direction of the pending mapping (`None` when nothing is mapped).
pub struct Attachment {
    consumer: Arc<dyn DmaDevice>,
    table: SegmentTable,
    direction: DmaDirection,
}

impl Attachment {
    /// Create an attachment for `consumer` over an unmapped table copy.
    pub fn new(consumer: Arc<dyn DmaDevice>, table: SegmentTable) -> Self {
        Self {
            consumer,
            table,
            direction: DmaDirection::None,
        }
    }

    /// The attachment's segment table (translated while a mapping is
    /// pending).
    #[inline]
    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    /// Direction of the pending mapping; `None` when unmapped.
    #[inline]
    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Translate the table for the consumer device in `direction`.
    pub fn map(&mut self, direction: DmaDirection) -> Result<()> {
        self.table
            .map_for_device(self.consumer.as_ref(), direction)?;
        self.direction = direction;
        Ok(())
    }

    /// Release the pending translation, if any.
    pub fn release_mapping(&mut self) {
        if self.direction != DmaDirection::None {
            self.table
                .unmap_for_device(self.consumer.as_ref(), self.direction);
            self.direction = DmaDirection::None;
        }
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("consumer", &self.consumer.name())
            .field("segments", &self.table.segment_count())
            .field("direction", &self.direction)
            .finish()
    }
}

/// Contract a shared-buffer exporter offers its consumers.
///
/// Implemented by [`ExportedBuffer`] and consumed by
/// [`DmaBuffer::attach_shared`]; a third-party producer implements it to
/// lend its buffers to this crate. A platform that cannot export simply
/// does not implement it.
pub trait SharedBuffer: Send + Sync {
    /// Total size of the shared memory in bytes.
    fn size(&self) -> usize;

    /// Record an attachment for a consumer device.
    fn attach(&self, consumer: &Arc<dyn DmaDevice>) -> Result<Attachment>;

    /// Release an attachment, tearing down any translation it still
    /// holds.
    fn detach(&self, attachment: Attachment);

    /// Map the attachment for `direction`, filling its segment table with
    /// device addresses. Mapping again with an unchanged direction is
    /// idempotent and keeps the cached translation; a direction change
    /// releases the previous translation first.
    fn map_attachment(&self, attachment: &mut Attachment, direction: DmaDirection) -> Result<()>;

    /// Release the attachment's mapping for `direction`.
    fn unmap_attachment(&self, attachment: &mut Attachment, direction: DmaDirection);

    /// The exporter's own CPU view of the memory, for consumers that need
    /// one.
    fn cpu_map(&self) -> Option<CpuMapping>;
}

/// The exporter side of the bridge: a [`DmaBuffer`] wrapped for sharing.
///
/// Created by [`DmaBuffer::export`]. Holds its own reference on the
/// buffer, keeping it alive for every consumer.
pub struct ExportedBuffer {
    buffer: DmaBuffer,
    /// Segment table describing the buffer's memory, built once at
    /// export.
    base: Arc<SegmentTable>,
    /// Serializes map/unmap across this buffer's attachments.
    map_lock: Mutex<()>,
}

impl ExportedBuffer {
    pub(crate) fn new(buffer: DmaBuffer, base: Arc<SegmentTable>) -> Self {
        Self {
            buffer,
            base,
            map_lock: Mutex::new(()),
        }
    }

    /// The underlying buffer.
    #[inline]
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }
}

impl SharedBuffer for ExportedBuffer {
    fn size(&self) -> usize {
        self.buffer.size()
    }

    fn attach(&self, consumer: &Arc<dyn DmaDevice>) -> Result<Attachment> {
        let table = self.base.clone_unmapped()?;
        Ok(Attachment::new(Arc::clone(consumer), table))
    }

    fn detach(&self, mut attachment: Attachment) {
        attachment.release_mapping();
    }

    fn map_attachment(&self, attachment: &mut Attachment, direction: DmaDirection) -> Result<()> {
        if direction == DmaDirection::None {
            return Err(Error::InvalidArgument(
                "a mapping needs a transfer direction".into(),
            ));
        }
        let _guard = self
            .map_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Unchanged direction: hand back the cached translation.
        if attachment.direction() == direction {
            return Ok(());
        }
        attachment.release_mapping();
        attachment.map(direction)
    }

    fn unmap_attachment(&self, _attachment: &mut Attachment, _direction: DmaDirection) {
        // The translation cache is retained until detach or a direction
        // change.
    }

    fn cpu_map(&self) -> Option<CpuMapping> {
        self.buffer.cpu_mapping()
    }
}

impl std::fmt::Debug for ExportedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedBuffer")
            .field("buffer", &self.buffer)
            .field("segments", &self.base.segment_count())
            .finish()
    }
}
