//! Reference host-memory device for the automem-rs paging core.
//!
//! Stands in for a real accelerator: "device" and "host" are both process
//! memory, transfers are memcpys, and an optional artificial latency makes
//! the asynchronous paths observable in tests.

use std::thread;
use std::time::Duration;

use automem_rs::paging::{DeviceTransfer, HostAllocator};

/// Copy engine backed by plain memcpys.
pub struct HostDeviceTransfer {
    latency: Option<Duration>,
}

impl HostDeviceTransfer {
    pub fn new() -> Self {
        HostDeviceTransfer { latency: None }
    }

    /// Sleeps for `latency` before every copy, simulating a slow link.
    pub fn with_latency(latency: Duration) -> Self {
        HostDeviceTransfer {
            latency: Some(latency),
        }
    }

    fn simulate_link(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }
}

impl Default for HostDeviceTransfer {
    fn default() -> Self {
        HostDeviceTransfer::new()
    }
}

impl DeviceTransfer for HostDeviceTransfer {
    fn do_pageout(&self, dst: &mut [u8], src: &[u8], _sync: bool) {
        self.simulate_link();
        dst.copy_from_slice(src);
    }

    fn do_pagein(&self, dst: &mut [u8], src: &[u8], _sync: bool) {
        self.simulate_link();
        dst.copy_from_slice(src);
    }
}

/// Staging allocator handing out zeroed host buffers.
pub struct PinnedHostAllocator;

impl HostAllocator for PinnedHostAllocator {
    fn allocate(&self, len: usize) -> Box<[u8]> {
        vec![0u8; len].into_boxed_slice()
    }
}
