//! Public surface of the rematerialization graph.
//!
//! The free functions wrap, unwrap, and poke checkpointed tensors; the
//! lowering entries on [`CheckpointTensor`] are what an operator dispatcher
//! calls to route a functional or in-place operator through the graph.

use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::profiling::{debug_log, LogLevel};
use crate::tensor::Tensor;

use super::cell::{TensorCell, WeakCell};
use super::external::External;
use super::pool::{AliasPool, PoolLockGuard};
use super::registry;
use super::remat::{RematFn, Rematerializer};
use super::CheckpointTensor;

/// Wraps a plain tensor as a checkpointed tensor. Panics when the tensor is
/// already checkpointed; use [`try_checkpoint`] for the idempotent form.
pub fn checkpoint(t: &Tensor) -> Tensor {
    assert!(
        !is_checkpoint(t),
        "tensor is already routed through the checkpoint graph"
    );
    Tensor::from_checkpoint(CheckpointTensor::from_external(External::from_tensor(t)))
}

/// Materializes and returns the underlying tensor. Panics on a tensor that
/// is not checkpointed.
pub fn uncheckpoint(t: &Tensor) -> Result<Tensor> {
    t.checkpoint_handle()
        .expect("uncheckpoint called on a non-checkpoint tensor")
        .materialize()
}

/// Returns the unwrapped tensor, or a clone of `t` when it is not
/// checkpointed.
pub fn decheckpoint(t: &Tensor) -> Result<Tensor> {
    match t.checkpoint_handle() {
        Some(handle) => handle.materialize(),
        None => Ok(t.clone()),
    }
}

pub fn is_checkpoint(t: &Tensor) -> bool {
    t.checkpoint_handle().is_some()
}

/// Identity on already-checkpointed tensors; wraps otherwise.
pub fn try_checkpoint(t: &Tensor) -> Tensor {
    if is_checkpoint(t) {
        t.clone()
    } else {
        checkpoint(t)
    }
}

/// Drops the held value of a checkpointed tensor's whole alias pool.
/// Returns `false` when the tensor is not checkpointed; panics when the pool
/// cannot be evicted (roots and locked pools).
pub fn evict_checkpoint(t: &Tensor) -> bool {
    match t.checkpoint_handle() {
        Some(handle) => {
            handle.cell().pool().evict();
            true
        }
        None => false,
    }
}

/// Forces materialization; identity on non-checkpoint tensors.
pub fn remat_checkpoint(t: &Tensor) -> Result<Tensor> {
    match t.checkpoint_handle() {
        Some(handle) => handle.materialize(),
        None => Ok(t.clone()),
    }
}

/// Bypasses policy and pages the tensor's storage out. Returns whether a
/// transfer was actually enqueued.
pub fn pageout_manual(t: &Tensor) -> Result<bool> {
    let storage = t.storage()?;
    Ok(match storage.entity() {
        Some(entity) => entity.pageout(),
        None => false,
    })
}

/// Bypasses policy and pages the tensor's storage back in.
pub fn pagein_manual(t: &Tensor) -> Result<bool> {
    let storage = t.storage()?;
    Ok(match storage.entity() {
        Some(entity) => entity.pagein(),
        None => false,
    })
}

/// Prefetch hint for the tensor's storage.
pub fn need_prefetch(t: &Tensor) -> Result<bool> {
    let storage = t.storage()?;
    Ok(match storage.entity() {
        Some(entity) => entity.need_prefetch(),
        None => false,
    })
}

/// Entity id of the tensor's storage, as a debug identity. `None` when the
/// storage has no paging descriptor.
pub fn get_pointer(t: &Tensor) -> Result<Option<u64>> {
    let storage = t.storage()?;
    Ok(storage.entity().map(|entity| entity.id()))
}

pub(crate) struct MakeRawResult {
    pub outputs: Vec<Rc<External>>,
    pub aliases: Vec<isize>,
    pub time: Duration,
    #[allow(dead_code)]
    pub remat: Rc<Rematerializer>,
}

/// Index of the first defined input aliasing `t`, or `-1`.
///
/// Alias detection only makes sense for defined outputs; an undefined output
/// aliases nothing.
fn get_alias(raw_inputs: &[Tensor], t: &Tensor) -> isize {
    if t.defined() {
        for (i, input) in raw_inputs.iter().enumerate() {
            if input.defined() && t.is_alias_of(input) {
                return i as isize;
            }
        }
    }
    -1
}

fn uncheckpoint_cells(inputs: &[Rc<TensorCell>]) -> Result<Vec<Tensor>> {
    inputs.iter().map(|cell| cell.get()).collect()
}

/// Runs an operator over materialized inputs and wires its outputs into the
/// graph: one rematerializer for the invocation, a fresh pool per non-aliased
/// output, pool reuse (with cost accumulation) per aliased output.
pub(crate) fn make_raw(func: RematFn, inputs: Vec<Rc<TensorCell>>) -> Result<MakeRawResult> {
    let _locks: Vec<PoolLockGuard> = inputs
        .iter()
        .map(|cell| PoolLockGuard::new(cell.pool()))
        .collect();
    let raw_inputs = uncheckpoint_cells(&inputs)?;
    let start = Instant::now();
    let raw_outputs = (func)(&raw_inputs)?;
    let time = start.elapsed();

    let remat = Rematerializer::new(Rc::clone(&func), inputs.clone(), time);
    let mut outputs: Vec<Rc<External>> = Vec::with_capacity(raw_outputs.len());
    let mut aliases: Vec<isize> = Vec::with_capacity(raw_outputs.len());
    let mut weak_outputs: Vec<WeakCell> = Vec::with_capacity(raw_outputs.len());

    for t in &raw_outputs {
        let alias = get_alias(&raw_inputs, t);
        let pool = if alias < 0 {
            let pool = AliasPool::new(Some(Rc::clone(&remat)), t.nbytes());
            registry::add_pool(&pool);
            pool
        } else {
            let pool = inputs[alias as usize].pool();
            // Aliasing outputs share the input's provenance; replaying it now
            // also replays this op.
            if let Some(head) = pool.head_remat() {
                head.add_cost(time);
            }
            pool
        };
        let cell = TensorCell::new(t, Rc::clone(&pool), Some(Rc::clone(&remat)));
        pool.add_member(&cell);
        weak_outputs.push(Rc::downgrade(&cell));
        outputs.push(External::from_cell(cell));
        aliases.push(alias);
    }
    remat.set_outputs(weak_outputs);

    Ok(MakeRawResult {
        outputs,
        aliases,
        time,
        remat,
    })
}

fn input_cells(inputs: &[Tensor]) -> Vec<Rc<TensorCell>> {
    inputs
        .iter()
        .map(try_checkpoint)
        .map(|t| {
            t.checkpoint_handle()
                .expect("try_checkpoint produced a non-checkpoint tensor")
                .cell()
        })
        .collect()
}

impl CheckpointTensor {
    /// Operator lowering entry: runs `func` over the (checkpointed) inputs
    /// and returns its outputs as checkpointed tensors.
    pub fn make(
        name: &str,
        func: impl Fn(&[Tensor]) -> Result<Vec<Tensor>> + 'static,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let cells = input_cells(inputs);
        let func: RematFn = Rc::new(func);
        let ret = make_raw(func, cells)?;
        debug_log().add(
            LogLevel::Info,
            "CheckpointTensor::make",
            &format!("{name}: {:?}", ret.time),
        );
        Ok(ret
            .outputs
            .into_iter()
            .map(|external| Tensor::from_checkpoint(CheckpointTensor::from_external(external)))
            .collect())
    }

    /// Mutation lowering entry: `mutate_idx` names the inputs the in-place
    /// operator writes to. A synthetic rematerializer clones those inputs,
    /// mutates the clones, and returns them, so the original cells are never
    /// written through; the mutated handles are then reseated to the
    /// replacement cells while prior aliases keep the pre-mutation values.
    pub fn mutate(
        name: &str,
        mutate: impl Fn(&[Tensor]) -> Result<()> + 'static,
        inputs: &[Tensor],
        mutate_idx: &[usize],
    ) -> Result<()> {
        debug_log().add(LogLevel::Info, "CheckpointTensor::mutate", name);
        let idx = mutate_idx.to_vec();
        let remat_fn: RematFn = Rc::new(move |ts: &[Tensor]| -> Result<Vec<Tensor>> {
            let mut values: Vec<Tensor> = ts.to_vec();
            for &i in &idx {
                values[i] = ts[i].deep_clone()?;
            }
            mutate(&values)?;
            Ok(values)
        });
        let cells = input_cells(inputs);
        let ret = make_raw(remat_fn, cells)?;
        for &i in mutate_idx {
            // The clone inside the synthetic rematerializer guarantees the
            // replacement value owns fresh storage.
            debug_assert!(ret.aliases[i] < 0, "mutated output aliases an input");
            let handle = inputs[i]
                .checkpoint_handle()
                .expect("mutated input must be a checkpoint tensor");
            handle.reseat(Rc::clone(&ret.outputs[i]));
        }
        Ok(())
    }
}
