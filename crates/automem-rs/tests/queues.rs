use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use automem_rs::paging::{
    evict_queue, fetch_queue, DeviceTransfer, Entity, PlacementStat,
};
use automem_rs::tensor::Storage;
use automem_rs_device_ref::{HostDeviceTransfer, PinnedHostAllocator};

fn queue_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("queue guard poisoned")
}

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

/// Memcpy transfer that records the byte length of every copy it performs.
struct RecordingTransfer {
    pageouts: Mutex<Vec<usize>>,
    pageins: Mutex<Vec<usize>>,
}

impl RecordingTransfer {
    fn new() -> Self {
        RecordingTransfer {
            pageouts: Mutex::new(Vec::new()),
            pageins: Mutex::new(Vec::new()),
        }
    }

    fn pageout_sizes(&self) -> Vec<usize> {
        self.pageouts.lock().unwrap().clone()
    }

    fn pagein_sizes(&self) -> Vec<usize> {
        self.pageins.lock().unwrap().clone()
    }
}

impl DeviceTransfer for RecordingTransfer {
    fn do_pageout(&self, dst: &mut [u8], src: &[u8], _sync: bool) {
        self.pageouts.lock().unwrap().push(src.len());
        dst.copy_from_slice(src);
    }

    fn do_pagein(&self, dst: &mut [u8], src: &[u8], _sync: bool) {
        self.pageins.lock().unwrap().push(src.len());
        dst.copy_from_slice(src);
    }
}

fn recorded_storage(nbytes: usize, recorder: &Arc<RecordingTransfer>) -> (Arc<Storage>, Arc<Entity>) {
    let storage = Storage::from_bytes(vec![1u8; nbytes]);
    let entity = storage
        .enable_paging(
            Arc::clone(recorder) as Arc<dyn DeviceTransfer>,
            Arc::new(PinnedHostAllocator),
        )
        .expect("paging enabled for the process");
    (storage, entity)
}

fn latency_storage(nbytes: usize, latency: Duration) -> (Arc<Storage>, Arc<Entity>) {
    let storage = Storage::from_bytes(vec![0u8; nbytes]);
    let entity = storage
        .enable_paging(
            Arc::new(HostDeviceTransfer::with_latency(latency)),
            Arc::new(PinnedHostAllocator),
        )
        .expect("paging enabled for the process");
    (storage, entity)
}

#[test]
fn evict_queue_services_fifo_and_fetch_queue_lifo() -> Result<()> {
    let _guard = queue_guard();
    evict_queue().start_actions();
    fetch_queue().start_actions();

    let recorder = Arc::new(RecordingTransfer::new());
    let (_decoy_storage, decoy) = latency_storage(2, Duration::from_millis(120));

    // Occupy the evict worker, then backlog three transfers.
    assert!(decoy.pageout());
    thread::sleep(Duration::from_millis(30));
    let (_s1, e1) = recorded_storage(4, &recorder);
    let (_s2, e2) = recorded_storage(8, &recorder);
    let (_s3, e3) = recorded_storage(12, &recorder);
    assert!(e1.pageout());
    assert!(e2.pageout());
    assert!(e3.pageout());

    evict_queue().wait_actions();
    assert!(wait_for(|| {
        e1.placement() == PlacementStat::Offline
            && e2.placement() == PlacementStat::Offline
            && e3.placement() == PlacementStat::Offline
    }));
    assert_eq!(recorder.pageout_sizes(), vec![4, 8, 12]);

    // Same game on the fetch side: the most recently requested storage is
    // serviced first.
    assert!(wait_for(|| decoy.placement() == PlacementStat::Offline));
    assert!(decoy.pagein());
    thread::sleep(Duration::from_millis(30));
    assert!(e1.pagein());
    assert!(e2.pagein());
    assert!(e3.pagein());

    fetch_queue().wait_actions();
    assert!(wait_for(|| {
        e1.placement() == PlacementStat::Online
            && e2.placement() == PlacementStat::Online
            && e3.placement() == PlacementStat::Online
    }));
    assert_eq!(recorder.pagein_sizes(), vec![12, 8, 4]);
    Ok(())
}

#[test]
fn erase_removes_a_queued_entry() -> Result<()> {
    let _guard = queue_guard();
    evict_queue().start_actions();

    assert!(!evict_queue().erase(u64::MAX));

    let (_decoy_storage, decoy) = latency_storage(2, Duration::from_millis(120));
    assert!(decoy.pageout());
    thread::sleep(Duration::from_millis(30));

    let (_storage, entity) = latency_storage(16, Duration::from_millis(1));
    assert!(entity.pageout());
    assert_eq!(evict_queue().pending(), 1);

    assert!(evict_queue().erase(entity.id()));
    assert_eq!(evict_queue().pending(), 0);
    assert!(!evict_queue().erase(entity.id()));

    evict_queue().wait_actions();
    Ok(())
}

#[test]
fn wait_actions_drains_and_reenables() -> Result<()> {
    let _guard = queue_guard();
    evict_queue().start_actions();

    let (_s1, e1) = latency_storage(8, Duration::from_millis(20));
    assert!(e1.pageout());
    evict_queue().wait_actions();
    assert_eq!(evict_queue().pending(), 0);
    assert!(wait_for(|| e1.placement() == PlacementStat::Offline));

    // Submissions still work after the drain.
    let (_s2, e2) = latency_storage(8, Duration::from_millis(1));
    assert!(e2.pageout());
    assert!(wait_for(|| e2.placement() == PlacementStat::Offline));
    Ok(())
}
