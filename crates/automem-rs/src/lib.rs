pub mod checkpoint;
mod env;
pub mod paging;
pub mod profiling;
pub mod tensor;
pub mod util;

pub use checkpoint::{
    checkpoint, decheckpoint, evict_checkpoint, get_pointer, is_checkpoint, need_prefetch,
    pagein_manual, pageout_manual, remat_checkpoint, try_checkpoint, uncheckpoint,
    CheckpointTensor,
};
pub use profiling::set_debug_callback;
pub use tensor::{DType, Device, KeySet, Shape, Storage, Tensor};
