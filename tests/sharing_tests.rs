//! Integration tests for the export/import bridge.
//!
//! These tests share one exported buffer between a producer device and a
//! consumer device and verify the attach/map/unmap/detach protocol, the
//! translation cache, and the reference-count round trips.

use contigbuf::{
    AllocContext, BackingKind, DmaBuffer, DmaDirection, Error, SharedBuffer, SoftDevice,
    Translation, PAGE_SIZE,
};
use std::sync::Arc;

fn context(device: SoftDevice) -> (Arc<SoftDevice>, AllocContext) {
    let device = Arc::new(device);
    let ctx = AllocContext::new(device.clone());
    (device, ctx)
}

// ============================================================================
// Export Side
// ============================================================================

#[test]
fn test_export_release_reference_round_trip() {
    let (_device, ctx) = context(SoftDevice::new());
    let buf = DmaBuffer::alloc(&ctx, 4096, DmaDirection::ToDevice).unwrap();
    assert_eq!(buf.reference_count(), 1);

    let first = buf.export().unwrap();
    assert_eq!(buf.reference_count(), 2);

    // A second export reuses the cached base table but takes its own
    // reference.
    let second = buf.export().unwrap();
    assert_eq!(buf.reference_count(), 3);

    drop(first);
    assert_eq!(buf.reference_count(), 2);
    drop(second);
    assert_eq!(buf.reference_count(), 1);
}

/// An exported handle keeps the buffer alive after the framework lets
/// go of it.
#[test]
fn test_export_extends_buffer_lifetime() {
    let (device, ctx) = context(SoftDevice::new());
    let buf = DmaBuffer::alloc(&ctx, 4096, DmaDirection::FromDevice).unwrap();
    let handle = buf.export().unwrap();

    drop(buf);
    assert_eq!(device.stats().coherent_frees, 0);
    assert_eq!(handle.buffer().reference_count(), 1);

    drop(handle);
    assert_eq!(device.stats().coherent_frees, 1);
}

// ============================================================================
// Import Protocol
// ============================================================================

#[test]
fn test_attach_map_unmap_detach_cycle() {
    let (_producer, producer_ctx) = context(SoftDevice::new().with_name("producer"));
    let (consumer, consumer_ctx) = context(SoftDevice::new().with_name("consumer"));

    let buf = DmaBuffer::alloc(&producer_ctx, 2 * PAGE_SIZE, DmaDirection::FromDevice).unwrap();
    let handle = buf.export().unwrap();

    let imported =
        DmaBuffer::attach_shared(&consumer_ctx, handle, 2 * PAGE_SIZE, DmaDirection::FromDevice)
            .unwrap();
    assert_eq!(imported.kind(), BackingKind::Imported);
    assert!(!imported.is_mapped());
    assert_eq!(imported.device_address(), None);

    let addr = imported.map_shared().unwrap();
    assert!(imported.is_mapped());
    assert_eq!(imported.device_address(), Some(addr));
    assert_eq!(consumer.stats().translations, 1);

    imported.unmap_shared().unwrap();
    assert!(!imported.is_mapped());

    drop(imported);
    // Detach releases the translation the exporter-side cache retained.
    assert_eq!(consumer.stats().translation_releases, 1);
}

#[test]
fn test_undersized_shared_buffer_rejected() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    let (_consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::ToDevice).unwrap();
    let handle = buf.export().unwrap();

    assert!(matches!(
        DmaBuffer::attach_shared(&consumer_ctx, handle, 8192, DmaDirection::ToDevice),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_double_map_and_double_unmap_rejected() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    let (_consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::ToDevice).unwrap();
    let imported = DmaBuffer::attach_shared(
        &consumer_ctx,
        buf.export().unwrap(),
        4096,
        DmaDirection::ToDevice,
    )
    .unwrap();

    assert!(matches!(
        imported.unmap_shared(),
        Err(Error::InvalidState(_))
    ));

    let addr = imported.map_shared().unwrap();
    assert!(matches!(imported.map_shared(), Err(Error::InvalidState(_))));
    // The rejected double map leaves the original mapping untouched.
    assert_eq!(imported.device_address(), Some(addr));

    imported.unmap_shared().unwrap();
    assert!(matches!(
        imported.unmap_shared(),
        Err(Error::InvalidState(_))
    ));
}

/// Remapping with an unchanged direction reuses the cached translation.
#[test]
fn test_remap_same_direction_is_idempotent() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    let (consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::ToDevice).unwrap();
    let imported = DmaBuffer::attach_shared(
        &consumer_ctx,
        buf.export().unwrap(),
        4096,
        DmaDirection::ToDevice,
    )
    .unwrap();

    let first = imported.map_shared().unwrap();
    imported.unmap_shared().unwrap();
    let second = imported.map_shared().unwrap();

    assert_eq!(first, second);
    assert_eq!(consumer.stats().translations, 1);
    assert_eq!(consumer.stats().translation_releases, 0);
}

/// A direction change releases the old translation before producing a
/// fresh one. Exercised at the exporter contract level, where the cache
/// lives.
#[test]
fn test_direction_change_forces_fresh_translation() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    let (consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::Bidirectional).unwrap();
    let handle = buf.export().unwrap();

    let mut attachment = handle.attach(consumer_ctx.device()).unwrap();

    handle
        .map_attachment(&mut attachment, DmaDirection::ToDevice)
        .unwrap();
    handle
        .map_attachment(&mut attachment, DmaDirection::ToDevice)
        .unwrap();
    assert_eq!(consumer.stats().translations, 1);

    handle
        .map_attachment(&mut attachment, DmaDirection::FromDevice)
        .unwrap();
    assert_eq!(consumer.stats().translation_releases, 1);
    assert_eq!(consumer.stats().translations, 2);

    handle.detach(attachment);
    assert_eq!(consumer.stats().translation_releases, 2);
}

#[test]
fn test_import_contiguity_violation_unmaps_again() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    // A consumer without remapping hardware scatters the two-page table.
    let (consumer, consumer_ctx) =
        context(SoftDevice::new().with_translation(Translation::Scattered));

    let buf = DmaBuffer::alloc(&producer_ctx, 2 * PAGE_SIZE, DmaDirection::ToDevice).unwrap();
    let imported = DmaBuffer::attach_shared(
        &consumer_ctx,
        buf.export().unwrap(),
        2 * PAGE_SIZE,
        DmaDirection::ToDevice,
    )
    .unwrap();

    assert!(matches!(
        imported.map_shared(),
        Err(Error::ContiguityViolation { .. })
    ));
    assert!(!imported.is_mapped());
    assert_eq!(consumer.stats().translations, 1);

    // Detach still releases the translation the exporter cache retained.
    drop(imported);
    assert_eq!(consumer.stats().translation_releases, 1);
}

/// Dropping a still-mapped imported buffer is a caller bug; teardown
/// unmaps as a safety net instead of leaking the translation.
#[test]
fn test_drop_while_mapped_forces_unmap() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    let (consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::ToDevice).unwrap();
    let imported = DmaBuffer::attach_shared(
        &consumer_ctx,
        buf.export().unwrap(),
        4096,
        DmaDirection::ToDevice,
    )
    .unwrap();
    imported.map_shared().unwrap();

    drop(imported);
    assert_eq!(consumer.stats().translation_releases, 1);
}

// ============================================================================
// CPU Views Across the Bridge
// ============================================================================

#[test]
fn test_imported_cpu_view_shares_memory() {
    let (_producer, producer_ctx) = context(SoftDevice::new());
    let (_consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::Bidirectional).unwrap();
    let handle = buf.export().unwrap();
    let imported =
        DmaBuffer::attach_shared(&consumer_ctx, handle, 4096, DmaDirection::Bidirectional)
            .unwrap();
    imported.map_shared().unwrap();

    let producer_view = buf.cpu_mapping().unwrap();
    // SAFETY: the test serializes all access to the shared pages.
    unsafe {
        producer_view.as_mut_slice()[..5].copy_from_slice(b"hello");
    }

    // The importer's lazy CPU view comes from the exporter and sees the
    // same memory.
    let imported_view = imported.cpu_mapping().unwrap();
    assert_eq!(imported_view.as_ptr(), producer_view.as_ptr());
    // SAFETY: no concurrent writers.
    assert_eq!(unsafe { &imported_view.as_slice()[..5] }, b"hello");

    imported.unmap_shared().unwrap();
}

/// The sync bracket is the exporter's job for imported buffers.
#[test]
fn test_imported_buffer_needs_no_local_sync() {
    let (producer, producer_ctx) = context(SoftDevice::new());
    let (consumer, consumer_ctx) = context(SoftDevice::new());

    let buf = DmaBuffer::alloc(&producer_ctx, 4096, DmaDirection::FromDevice).unwrap();
    let imported = DmaBuffer::attach_shared(
        &consumer_ctx,
        buf.export().unwrap(),
        4096,
        DmaDirection::FromDevice,
    )
    .unwrap();
    imported.map_shared().unwrap();

    imported.prepare();
    imported.finish();
    assert_eq!(producer.stats().device_syncs, 0);
    assert_eq!(producer.stats().cpu_syncs, 0);
    assert_eq!(consumer.stats().device_syncs, 0);
    assert_eq!(consumer.stats().cpu_syncs, 0);

    imported.unmap_shared().unwrap();
}
