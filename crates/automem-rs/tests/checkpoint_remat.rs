use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use automem_rs::tensor::{DType, Device, KeySet};
use automem_rs::{
    checkpoint, decheckpoint, evict_checkpoint, is_checkpoint, remat_checkpoint, try_checkpoint,
    uncheckpoint, CheckpointTensor, Shape, Tensor,
};

#[test]
fn simple_evict_and_replay() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let mut outputs = CheckpointTensor::make(
        "add",
        move |ts| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ts[0].add(&ts[1])?])
        },
        &[a.clone(), a.clone()],
    )?;
    let b = outputs.remove(0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let pool = b.checkpoint_handle().expect("checkpointed output").cell().pool();
    assert!(pool.evictable());
    assert!(!pool.is_evicted());
    assert_eq!(pool.memory(), 16);

    assert!(evict_checkpoint(&b));
    assert!(pool.is_evicted());
    assert!(!b.checkpoint_handle().unwrap().cell().has_value());

    let restored = uncheckpoint(&b)?;
    assert_eq!(restored.to_vec()?, vec![2.0; 4]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!pool.is_evicted());
    Ok(())
}

#[test]
fn roots_always_hold_their_value() {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let cell = a.checkpoint_handle().unwrap().cell();
    assert!(cell.is_root());
    assert!(cell.has_value());
    assert!(!cell.pool().evictable());
}

#[test]
#[should_panic(expected = "pool is not evictable")]
fn evicting_a_root_pool_is_fatal() {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    evict_checkpoint(&a);
}

#[test]
fn try_checkpoint_is_idempotent() {
    let t = Tensor::ones(Shape::new([3]));
    let once = try_checkpoint(&t);
    let twice = try_checkpoint(&once);
    assert!(is_checkpoint(&twice));
    assert!(Rc::ptr_eq(
        &once.checkpoint_handle().unwrap().cell(),
        &twice.checkpoint_handle().unwrap().cell(),
    ));
}

#[test]
fn fill_is_a_noop_on_a_defined_cell() -> Result<()> {
    let a = checkpoint(&Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0])?);
    let cell = a.checkpoint_handle().unwrap().cell();
    cell.fill(Tensor::from_vec(Shape::new([2]), vec![9.0, 9.0])?);
    assert_eq!(uncheckpoint(&a)?.to_vec()?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn operator_failure_releases_input_locks() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([2])));
    let pool = a.checkpoint_handle().unwrap().cell().pool();
    let result = CheckpointTensor::make(
        "boom",
        |_| -> Result<Vec<Tensor>> { anyhow::bail!("kernel exploded") },
        &[a.clone()],
    );
    assert!(result.is_err());
    assert_eq!(pool.lock_count(), 0);
    // The graph is still usable afterwards.
    let out = CheckpointTensor::make("scale", |ts| Ok(vec![ts[0].scale(2.0)?]), &[a])?;
    assert_eq!(out[0].to_vec()?, vec![2.0, 2.0]);
    Ok(())
}

#[test]
fn failed_replay_leaves_the_cell_for_a_retry() -> Result<()> {
    let a = checkpoint(&Tensor::from_vec(Shape::new([2]), vec![3.0, 4.0])?);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut out = CheckpointTensor::make(
        "flaky_scale",
        move |ts| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                anyhow::bail!("transient kernel failure");
            }
            Ok(vec![ts[0].scale(2.0)?])
        },
        &[a],
    )?;
    let b = out.remove(0);
    let cell = b.checkpoint_handle().unwrap().cell();
    let pool = cell.pool();

    assert!(evict_checkpoint(&b));
    assert!(uncheckpoint(&b).is_err());
    assert!(!cell.has_value());
    assert_eq!(pool.lock_count(), 0);

    assert_eq!(uncheckpoint(&b)?.to_vec()?, vec![6.0, 8.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn pin_turns_the_cell_into_a_root() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let mut out = CheckpointTensor::make("scale", |ts| Ok(vec![ts[0].scale(5.0)?]), &[a])?;
    let b = out.remove(0);
    let cell = b.checkpoint_handle().unwrap().cell();
    assert!(!cell.is_root());
    assert!(cell.pool().evictable());

    cell.pin()?;
    assert!(cell.is_root());
    assert!(cell.has_value());
    assert!(!cell.pool().evictable());
    assert_eq!(uncheckpoint(&b)?.to_vec()?, vec![5.0; 4]);
    Ok(())
}

#[test]
fn checkpoint_metadata_tracks_the_wrapped_tensor() {
    let t = Tensor::ones(Shape::new([4])).with_requires_grad(true);
    let a = checkpoint(&t);
    assert!(a.key_set().has(KeySet::CHECKPOINT));
    assert!(a.key_set().has(KeySet::AUTOGRAD));
    assert!(a.requires_grad());
    assert_eq!(a.dtype(), DType::F32);
    assert_eq!(a.optional_device(), Some(Device::Cpu));
    assert_eq!(a.nbytes(), 16);
}

#[test]
fn decheckpoint_passes_plain_tensors_through() -> Result<()> {
    let t = Tensor::ones(Shape::new([2]));
    assert!(!is_checkpoint(&t));
    assert_eq!(decheckpoint(&t)?.to_vec()?, vec![1.0, 1.0]);
    assert_eq!(remat_checkpoint(&t)?.to_vec()?, vec![1.0, 1.0]);

    let c = checkpoint(&t);
    assert!(is_checkpoint(&c));
    assert_eq!(decheckpoint(&c)?.to_vec()?, vec![1.0, 1.0]);
    assert_eq!(remat_checkpoint(&c)?.to_vec()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn external_count_follows_handle_lifetime() {
    let a = checkpoint(&Tensor::ones(Shape::new([2])));
    let pool = a.checkpoint_handle().unwrap().cell().pool();
    assert_eq!(pool.external_count(), 1);

    // Clones share the slot and the external: still one external per cell.
    let a2 = a.clone();
    assert_eq!(pool.external_count(), 1);

    drop(a);
    assert_eq!(pool.external_count(), 1);
    drop(a2);
    assert_eq!(pool.external_count(), 0);
}

#[test]
fn undefined_outputs_are_tracked() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([2])));
    let out = CheckpointTensor::make("maybe_empty", |_| Ok(vec![Tensor::undefined()]), &[a])?;
    let cell = out[0].checkpoint_handle().unwrap().cell();
    assert!(cell.is_undefined_tensor());
    assert_eq!(cell.memory(), 0);
    Ok(())
}

#[test]
#[should_panic(expected = "operator replay produced")]
fn replay_arity_mismatch_is_fatal() {
    let a = checkpoint(&Tensor::ones(Shape::new([2])));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut out = CheckpointTensor::make(
        "unstable_arity",
        move |ts| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![ts[0].clone()])
            } else {
                Ok(vec![ts[0].clone(), ts[0].clone()])
            }
        },
        &[a],
    )
    .expect("first invocation succeeds");
    let b = out.remove(0);
    evict_checkpoint(&b);
    let _ = uncheckpoint(&b);
}

#[test]
fn replay_accumulates_compute_cost() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let mut out = CheckpointTensor::make(
        "slow_scale",
        |ts| {
            std::thread::sleep(std::time::Duration::from_millis(2));
            Ok(vec![ts[0].scale(2.0)?])
        },
        &[a],
    )?;
    let b = out.remove(0);
    let pool = b.checkpoint_handle().unwrap().cell().pool();
    let initial = pool.recompute_cost().expect("pool has a head rematerializer");

    evict_checkpoint(&b);
    uncheckpoint(&b)?;
    let replayed = pool.recompute_cost().unwrap();
    assert!(replayed > initial);
    Ok(())
}
