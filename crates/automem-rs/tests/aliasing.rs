use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use automem_rs::{checkpoint, evict_checkpoint, uncheckpoint, CheckpointTensor, Shape, Tensor};

#[test]
fn view_outputs_share_the_input_pool() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let mut out = CheckpointTensor::make("scale", |ts| Ok(vec![ts[0].scale(3.0)?]), &[a])?;
    let b = out.remove(0);
    let b_pool = b.checkpoint_handle().unwrap().cell().pool();
    let cost_before = b_pool.recompute_cost().expect("made pool has a head rematerializer");

    let mut out = CheckpointTensor::make(
        "view",
        |ts| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(vec![ts[0].alias()?])
        },
        &[b.clone()],
    )?;
    let v = out.remove(0);
    let v_pool = v.checkpoint_handle().unwrap().cell().pool();

    assert!(Rc::ptr_eq(&b_pool, &v_pool));
    // The aliasing op's cost folds into the shared provenance.
    let cost_after = b_pool.recompute_cost().unwrap();
    assert!(cost_after >= cost_before + Duration::from_millis(4));

    let b_raw = uncheckpoint(&b)?;
    let v_raw = uncheckpoint(&v)?;
    assert!(v_raw.is_alias_of(&b_raw));
    Ok(())
}

#[test]
fn one_evict_drops_the_whole_pool() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let mut out = CheckpointTensor::make("scale", |ts| Ok(vec![ts[0].scale(3.0)?]), &[a])?;
    let b = out.remove(0);
    let mut out = CheckpointTensor::make("view", |ts| Ok(vec![ts[0].alias()?]), &[b.clone()])?;
    let v = out.remove(0);

    let b_cell = b.checkpoint_handle().unwrap().cell();
    let v_cell = v.checkpoint_handle().unwrap().cell();
    let pool = b_cell.pool();

    assert!(evict_checkpoint(&v));
    assert!(pool.is_evicted());
    assert!(!b_cell.has_value());
    assert!(!v_cell.has_value());

    // Rematerializing through the view restores every member of the pool.
    assert_eq!(uncheckpoint(&v)?.to_vec()?, vec![3.0; 4]);
    assert!(b_cell.has_value());
    assert!(!pool.is_evicted());
    Ok(())
}

#[test]
fn aliasing_into_a_root_pool_stays_unevictable() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let a_pool = a.checkpoint_handle().unwrap().cell().pool();
    let mut out = CheckpointTensor::make("view", |ts| Ok(vec![ts[0].alias()?]), &[a.clone()])?;
    let v = out.remove(0);
    let v_pool = v.checkpoint_handle().unwrap().cell().pool();

    assert!(Rc::ptr_eq(&a_pool, &v_pool));
    // A root pool has no head rematerializer, so joining it cannot make it
    // evictable.
    assert!(!v_pool.evictable());
    assert_eq!(uncheckpoint(&v)?.to_vec()?, vec![1.0; 4]);
    Ok(())
}

#[test]
fn independent_outputs_get_independent_pools() -> Result<()> {
    let a = checkpoint(&Tensor::ones(Shape::new([4])));
    let out = CheckpointTensor::make(
        "split",
        |ts| Ok(vec![ts[0].scale(2.0)?, ts[0].scale(4.0)?]),
        &[a],
    )?;
    let p0 = out[0].checkpoint_handle().unwrap().cell().pool();
    let p1 = out[1].checkpoint_handle().unwrap().cell().pool();
    assert!(!Rc::ptr_eq(&p0, &p1));

    // Evicting one output leaves the sibling intact.
    assert!(evict_checkpoint(&out[0]));
    assert!(out[1].checkpoint_handle().unwrap().cell().has_value());
    assert_eq!(uncheckpoint(&out[0])?.to_vec()?, vec![2.0; 4]);
    Ok(())
}
