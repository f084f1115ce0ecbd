//! Physical byte buffer backing one or more tensors.
//!
//! A [`Storage`] uniquely owns its device-side bytes; two tensors alias if
//! and only if they share a storage. A storage may opt into paging by
//! attaching an [`Entity`] descriptor, after which every data access funnels
//! through [`Entity::ensure_data`] before the bytes are touched. Dropping the
//! last storage handle marks the entity dirty so in-flight transfers are
//! abandoned instead of touching freed memory.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::env;
use crate::paging::entity::Entity;
use crate::paging::transfer::{DeviceTransfer, HostAllocator};
use crate::profiling::{debug_log, impl_profile, LogLevel};

static STORAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_storage_id() -> u64 {
    STORAGE_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

pub struct Storage {
    id: u64,
    nbytes: usize,
    resizable: bool,
    /// Device-resident payload; `None` while the storage is paged out.
    buf: Mutex<Option<Box<[u8]>>>,
    entity: OnceCell<Arc<Entity>>,
}

impl Storage {
    /// Wraps an existing byte payload as a device-resident storage.
    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Storage> {
        let nbytes = bytes.len();
        let bytes = bytes.into_boxed_slice();
        let storage = Arc::new(Storage {
            id: next_storage_id(),
            nbytes,
            resizable: false,
            buf: Mutex::new(Some(bytes)),
            entity: OnceCell::new(),
        });
        impl_profile().storage_life_start(storage.id);
        impl_profile().storage_set_storage(storage.id, storage.data_tag(), nbytes as u64);
        storage
    }

    /// Allocates a zero-filled storage of `nbytes`.
    pub fn zeroed(nbytes: usize) -> Arc<Storage> {
        Storage::from_bytes(vec![0u8; nbytes])
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn resizable(&self) -> bool {
        self.resizable
    }

    /// Attaches a paging descriptor, making the storage eligible for
    /// pageout/pagein. Returns `None` when paging is disabled for the
    /// process, and at most one descriptor is ever attached.
    pub fn enable_paging(
        self: &Arc<Self>,
        transfer: Arc<dyn DeviceTransfer>,
        host_alloc: Arc<dyn HostAllocator>,
    ) -> Option<Arc<Entity>> {
        if !env::paging_enabled() {
            return None;
        }
        let entity = self
            .entity
            .get_or_init(|| Entity::new(Arc::downgrade(self), transfer, host_alloc));
        Some(Arc::clone(entity))
    }

    /// Returns the attached paging descriptor, if any.
    pub fn entity(&self) -> Option<&Arc<Entity>> {
        self.entity.get()
    }

    /// Stable tag identifying the current device allocation, for profiling.
    fn data_tag(&self) -> u64 {
        let buf = self.buf.lock().expect("storage buffer poisoned");
        buf.as_ref().map(|b| b.as_ptr() as u64).unwrap_or(0)
    }

    fn ensure(&self) {
        if let Some(entity) = self.entity.get() {
            entity.ensure_data();
        }
    }

    /// Runs `f` over the device bytes, paging them in first when necessary.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        loop {
            self.ensure();
            let guard = self.buf.lock().expect("storage buffer poisoned");
            if let Some(bytes) = guard.as_ref() {
                impl_profile().storage_append_access(self.id);
                return f(bytes);
            }
            // Paged out between the ensure and the lock; go around again.
            drop(guard);
            self.check_not_dirty();
        }
    }

    /// Mutable variant of [`Storage::with_bytes`].
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        loop {
            self.ensure();
            let mut guard = self.buf.lock().expect("storage buffer poisoned");
            if let Some(bytes) = guard.as_mut() {
                impl_profile().storage_append_access(self.id);
                return f(bytes);
            }
            drop(guard);
            self.check_not_dirty();
        }
    }

    /// A dirty descriptor will never page the bytes back in; reading through
    /// it is a caller bug, not something to spin on.
    fn check_not_dirty(&self) {
        if let Some(entity) = self.entity.get() {
            assert!(
                !entity.is_dirty(),
                "storage bytes unavailable: paging descriptor is dirty"
            );
        }
    }

    /// Copies the device bytes into a fresh host staging buffer and releases
    /// the device allocation. Returns `None` when the storage is already
    /// offline. Called only from the paging descriptor.
    pub(crate) fn export_for_pageout(
        &self,
        transfer: &dyn DeviceTransfer,
        host_alloc: &dyn HostAllocator,
    ) -> Option<Box<[u8]>> {
        let mut guard = self.buf.lock().expect("storage buffer poisoned");
        let bytes = guard.as_ref()?;
        let mut host = host_alloc.allocate(bytes.len());
        transfer.do_pageout(&mut host, bytes, true);
        *guard = None;
        Some(host)
    }

    /// Restores the device allocation from a host staging buffer. Called only
    /// from the paging descriptor.
    pub(crate) fn import_for_pagein(&self, transfer: &dyn DeviceTransfer, host: Box<[u8]>) {
        let mut device = vec![0u8; host.len()].into_boxed_slice();
        transfer.do_pagein(&mut device, &host, true);
        let mut guard = self.buf.lock().expect("storage buffer poisoned");
        *guard = Some(device);
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(entity) = self.entity.get() {
            debug_log().add(LogLevel::Debug, "Storage::drop", "marking entity dirty");
            entity.mark_dirty();
        }
        impl_profile().storage_life_end(self.id);
    }
}
