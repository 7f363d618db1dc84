//! # contigbuf
//!
//! A pluggable buffer-memory backend for streaming capture pipelines
//! whose devices DMA into system memory.
//!
//! Given a buffer request, contigbuf produces a region addressable by
//! both the device (a device-visible address, validated contiguous) and
//! the CPU (a virtual view, when one is needed) — whether the memory is
//! allocated by the driver itself, borrowed and pinned from a user
//! process, or imported from another producer through a shared-buffer
//! handle. All three acquisitions share one reference-counted lifecycle:
//! the last holder to let go tears the backing down, exactly once.
//!
//! ## Features
//!
//! - **Three acquisition strategies**: coherent allocation, userspace
//!   pinning (with a physical-contiguity fallback for reserved memory),
//!   and shared-buffer import
//! - **Uniform lifecycle**: clone to take a reference, drop to release;
//!   exporting a buffer extends its life across consumers
//! - **Scatter/gather validation**: segment tables with a deterministic
//!   contiguous-run check before any buffer reaches the framework
//! - **Cache-coherency bracket**: `prepare()`/`finish()` around every
//!   transfer
//! - **Hardware-free testing**: a fully instrumented software device
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use contigbuf::{AllocContext, DmaBuffer, DmaDirection, SoftDevice};
//! use std::sync::Arc;
//!
//! let ctx = AllocContext::new(Arc::new(SoftDevice::new()));
//!
//! // Driver-owned capture buffer
//! let buf = DmaBuffer::alloc(&ctx, 4096, DmaDirection::FromDevice)?;
//! buf.prepare();
//! // ... device writes to buf.device_address() ...
//! buf.finish();
//!
//! // Lend it to another consumer without copying
//! let handle = buf.export()?;
//! let imported = DmaBuffer::attach_shared(&ctx, handle, 4096, DmaDirection::FromDevice)?;
//! let addr = imported.map_shared()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod device;
pub mod error;
pub mod segment;
pub mod share;
pub mod soft;

pub use buffer::{BackingKind, DmaBuffer};
pub use device::{
    AllocContext, CoherentBlock, CpuMapping, DmaAddr, DmaDevice, DmaDirection, FrameVector,
    PAGE_SHIFT, PAGE_SIZE,
};
pub use error::{Error, Result};
pub use segment::{Segment, SegmentTable};
pub use share::{Attachment, ExportedBuffer, SharedBuffer, SharedHandle};
pub use soft::{FrameLayout, SoftDevice, SoftStats, Translation};
