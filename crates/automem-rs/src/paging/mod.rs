//! Paging subsystem: per-storage entity descriptors and the background
//! transfer queues that move storage bytes between device and host.

pub mod entity;
pub mod queue;
pub mod transfer;

pub use entity::{Entity, PlacementStat, TransStat};
pub use queue::{evict_queue, fetch_queue, TransferQueue};
pub use transfer::{DeviceTransfer, HostAllocator};
