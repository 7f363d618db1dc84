//! Scatter/gather segment tables for device-addressable memory.
//!
//! A [`SegmentTable`] is an ordered list of (address, length) pairs
//! describing possibly non-contiguous memory as a set of contiguous runs.
//! Tables are built from pinned page frames (or from a coherent block's
//! layout), translated to device addresses through the owning device, and
//! validated with [`SegmentTable::contiguous_run_length`] before a buffer
//! is ever handed to the framework.

use crate::device::{DmaAddr, DmaDevice, DmaDirection, FrameVector, PAGE_SHIFT, PAGE_SIZE};
use crate::error::{Error, Result};

/// One contiguous run of memory within a segment table.
///
/// `dma_addr` is written by the device's translation step and is
/// meaningful only while the owning table reports the segment as mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical address of the run.
    pub phys_addr: u64,
    /// Length of the run in bytes.
    pub len: usize,
    /// Device-visible address, filled in by translation.
    pub dma_addr: DmaAddr,
}

/// An ordered segment table with its device-mapping state.
///
/// Segment order is authoritative: it is produced by the build and
/// translation steps and never reordered afterwards.
#[derive(Debug)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    /// Number of leading segments with a usable translation; 0 means the
    /// table is not device-mapped.
    mapped: usize,
}

impl SegmentTable {
    /// Create an unmapped table from prepared segments.
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            mapped: 0,
        }
    }

    /// Build an unmapped table from a pinned frame set.
    ///
    /// Adjacent frames are grouped into physical runs; the sub-page
    /// offset of the range start is applied to the first run and the
    /// total is trimmed to `size`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when segment storage cannot be reserved;
    /// `InvalidArgument` when the frame set does not cover `size` bytes.
    pub fn from_frames(frames: &FrameVector, size: usize) -> Result<Self> {
        let nums = frames.frames();
        if nums.is_empty() || frames.offset() + size > nums.len() * PAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "frame set ({} pages) does not cover {} bytes",
                nums.len(),
                size
            )));
        }

        let runs = 1 + nums.windows(2).filter(|w| w[1] != w[0] + 1).count();
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(runs)
            .map_err(|_| Error::OutOfMemory("segment table storage".into()))?;

        let mut remaining = size;
        let mut run_start = nums[0];
        let mut run_pages = 1usize;
        let mut first = true;
        for i in 1..=nums.len() {
            if i < nums.len() && nums[i] == nums[i - 1] + 1 {
                run_pages += 1;
                continue;
            }
            let mut phys = run_start << PAGE_SHIFT;
            let mut len = run_pages * PAGE_SIZE;
            if first {
                phys += frames.offset() as u64;
                len -= frames.offset();
                first = false;
            }
            let len = len.min(remaining);
            if len > 0 {
                segments.push(Segment {
                    phys_addr: phys,
                    len,
                    dma_addr: 0,
                });
                remaining -= len;
            }
            if remaining == 0 {
                break;
            }
            if i < nums.len() {
                run_start = nums[i];
                run_pages = 1;
            }
        }

        Ok(Self {
            segments,
            mapped: 0,
        })
    }

    /// The segments, in authoritative order.
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments in the table.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total bytes described by the table.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Whether the table currently carries a device translation.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped > 0
    }

    /// Device address of the first mapped segment, if any.
    pub fn device_address(&self) -> Option<DmaAddr> {
        if self.mapped > 0 {
            self.segments.first().map(|s| s.dma_addr)
        } else {
            None
        }
    }

    /// Request device-address translation for every segment.
    ///
    /// Returns the number of usable segments. Fails with `Io` when
    /// translation yields none.
    pub fn map_for_device(
        &mut self,
        device: &dyn DmaDevice,
        direction: DmaDirection,
    ) -> Result<usize> {
        let nents = device.map_segments(&mut self.segments, direction)?;
        if nents == 0 {
            tracing::error!(device = device.name(), "failed to map segment table");
            return Err(Error::Io("translation yielded no usable segments".into()));
        }
        self.mapped = nents.min(self.segments.len());
        Ok(self.mapped)
    }

    /// Release the device translation, if one is held.
    pub fn unmap_for_device(&mut self, device: &dyn DmaDevice, direction: DmaDirection) {
        if self.mapped > 0 {
            device.unmap_segments(&self.segments, direction);
            self.mapped = 0;
        }
    }

    /// Length of the leading contiguous device-address run.
    ///
    /// Single deterministic pass starting at the first segment's device
    /// address: the run extends while each segment's address equals the
    /// previous segment's end address.
    pub fn contiguous_run_length(&self) -> usize {
        let mut expected = match self.segments.first() {
            Some(s) => s.dma_addr,
            None => return 0,
        };
        let mut size = 0;
        for s in &self.segments[..self.mapped] {
            if s.dma_addr != expected {
                break;
            }
            expected = s.dma_addr + s.len as u64;
            size += s.len;
        }
        size
    }

    /// Copy the table for a new attachment: physical layout retained,
    /// device addresses cleared. One translation cache cannot serve
    /// multiple attachments at the same time.
    pub fn clone_unmapped(&self) -> Result<Self> {
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(self.segments.len())
            .map_err(|_| Error::OutOfMemory("segment table storage".into()))?;
        segments.extend(self.segments.iter().map(|s| Segment {
            phys_addr: s.phys_addr,
            len: s.len,
            dma_addr: 0,
        }));
        Ok(Self {
            segments,
            mapped: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_table(entries: &[(DmaAddr, usize)]) -> SegmentTable {
        let segments: Vec<Segment> = entries
            .iter()
            .map(|&(dma_addr, len)| Segment {
                phys_addr: dma_addr,
                len,
                dma_addr,
            })
            .collect();
        let mapped = segments.len();
        SegmentTable { segments, mapped }
    }

    #[test]
    fn test_contiguous_run_stops_at_gap() {
        const A: DmaAddr = 0x10_0000;
        let table = mapped_table(&[(A, 10), (A + 10, 20), (A + 40, 5)]);
        assert_eq!(table.contiguous_run_length(), 30);
    }

    #[test]
    fn test_contiguous_run_overlapping_segments() {
        const A: DmaAddr = 0x10_0000;
        let table = mapped_table(&[(A, 10), (A + 5, 20)]);
        assert_eq!(table.contiguous_run_length(), 10);
    }

    #[test]
    fn test_contiguous_run_fully_contiguous() {
        const A: DmaAddr = 0x8000;
        let table = mapped_table(&[(A, 4096), (A + 4096, 4096)]);
        assert_eq!(table.contiguous_run_length(), 8192);
    }

    #[test]
    fn test_contiguous_run_empty_table() {
        let table = SegmentTable::new(Vec::new());
        assert_eq!(table.contiguous_run_length(), 0);
    }

    #[test]
    fn test_contiguous_run_unmapped_is_zero() {
        const A: DmaAddr = 0x8000;
        let mut table = mapped_table(&[(A, 4096)]);
        table.mapped = 0;
        assert_eq!(table.contiguous_run_length(), 0);
        assert_eq!(table.device_address(), None);
    }

    #[test]
    fn test_from_frames_groups_adjacent() {
        let frames = FrameVector::new(vec![100, 101, 200, 201, 202], 0, true);
        let table = SegmentTable::from_frames(&frames, 5 * PAGE_SIZE).unwrap();
        assert_eq!(table.segment_count(), 2);
        assert_eq!(table.segments()[0].phys_addr, 100 << PAGE_SHIFT);
        assert_eq!(table.segments()[0].len, 2 * PAGE_SIZE);
        assert_eq!(table.segments()[1].phys_addr, 200 << PAGE_SHIFT);
        assert_eq!(table.segments()[1].len, 3 * PAGE_SIZE);
        assert_eq!(table.total_len(), 5 * PAGE_SIZE);
    }

    #[test]
    fn test_from_frames_applies_offset_and_trims() {
        // Range starts 256 bytes into the first page and covers 4096
        // bytes, so it spills 256 bytes into the second page.
        let frames = FrameVector::new(vec![100, 101], 256, true);
        let table = SegmentTable::from_frames(&frames, PAGE_SIZE).unwrap();
        assert_eq!(table.segment_count(), 1);
        assert_eq!(table.segments()[0].phys_addr, (100 << PAGE_SHIFT) + 256);
        assert_eq!(table.segments()[0].len, PAGE_SIZE);
        assert_eq!(table.total_len(), PAGE_SIZE);
    }

    #[test]
    fn test_from_frames_trims_scattered_tail() {
        let frames = FrameVector::new(vec![100, 200], 0, true);
        let table = SegmentTable::from_frames(&frames, PAGE_SIZE + 100).unwrap();
        assert_eq!(table.segment_count(), 2);
        assert_eq!(table.segments()[1].len, 100);
        assert_eq!(table.total_len(), PAGE_SIZE + 100);
    }

    #[test]
    fn test_from_frames_undersized_set_fails() {
        let frames = FrameVector::new(vec![100], 0, true);
        assert!(matches!(
            SegmentTable::from_frames(&frames, 2 * PAGE_SIZE),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_clone_unmapped_clears_translation() {
        const A: DmaAddr = 0xD000_0000;
        let table = mapped_table(&[(A, 4096), (A + 4096, 4096)]);
        let copy = table.clone_unmapped().unwrap();
        assert!(!copy.is_mapped());
        assert_eq!(copy.segment_count(), 2);
        assert_eq!(copy.segments()[0].dma_addr, 0);
        assert_eq!(copy.segments()[0].phys_addr, table.segments()[0].phys_addr);
    }
}
