use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use automem_rs::paging::{evict_queue, Entity, PlacementStat};
use automem_rs::tensor::Storage;
use automem_rs_device_ref::{HostDeviceTransfer, PinnedHostAllocator};

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn paged_storage(nbytes: usize) -> (Arc<Storage>, Arc<Entity>) {
    let storage = Storage::from_bytes(vec![3u8; nbytes]);
    let entity = storage
        .enable_paging(
            Arc::new(HostDeviceTransfer::with_latency(Duration::from_millis(5))),
            Arc::new(PinnedHostAllocator),
        )
        .expect("paging enabled for the process");
    (storage, entity)
}

#[test]
fn shutdown_drains_the_backlog_and_drops_later_submissions() -> Result<()> {
    evict_queue().start_actions();

    let slots: Vec<_> = (0..5).map(|_| paged_storage(16)).collect();
    for (_, entity) in &slots {
        assert!(entity.pageout());
    }

    evict_queue().wait_and_stop_actions();

    // Every queued transfer completed before the worker retired.
    assert!(wait_for(|| {
        slots
            .iter()
            .all(|(_, entity)| entity.placement() == PlacementStat::Offline)
    }));
    assert_eq!(evict_queue().pending(), 0);

    // The queue no longer accepts work, and the refused entity is left in a
    // consistent state rather than stranded in transit.
    let (_storage, late) = paged_storage(16);
    assert!(!late.pageout());
    assert_eq!(late.placement(), PlacementStat::Online);
    assert_eq!(evict_queue().pending(), 0);
    Ok(())
}
