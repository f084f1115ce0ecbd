//! Captured operator invocations that can replay to reproduce their outputs.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::tensor::Tensor;

use super::cell::{TensorCell, WeakCell};
use super::pool::PoolLockGuard;

/// A pure operator callable replayed over materialized inputs.
pub type RematFn = Rc<dyn Fn(&[Tensor]) -> Result<Vec<Tensor>>>;

/// One operator invocation in the provenance graph.
///
/// Inputs are held strongly (a replay must keep them reachable), outputs only
/// weakly: the output cells hold the strong edge back to this rematerializer,
/// and the weak direction is what lets a pruned subgraph collect.
pub struct Rematerializer {
    func: RematFn,
    inputs: RefCell<Vec<Rc<TensorCell>>>,
    outputs: RefCell<Vec<WeakCell>>,
    compute_cost: Cell<Duration>,
}

impl Rematerializer {
    pub(crate) fn new(
        func: RematFn,
        inputs: Vec<Rc<TensorCell>>,
        compute_cost: Duration,
    ) -> Rc<Rematerializer> {
        Rc::new(Rematerializer {
            func,
            inputs: RefCell::new(inputs),
            outputs: RefCell::new(Vec::new()),
            compute_cost: Cell::new(compute_cost),
        })
    }

    pub(crate) fn set_outputs(&self, outputs: Vec<WeakCell>) {
        *self.outputs.borrow_mut() = outputs;
    }

    /// Accumulated wall-clock cost of running the captured operator.
    pub fn compute_cost(&self) -> Duration {
        self.compute_cost.get()
    }

    pub(crate) fn add_cost(&self, delta: Duration) {
        self.compute_cost.set(self.compute_cost.get() + delta);
    }

    /// Replays the captured operator and refills every still-live output
    /// cell.
    ///
    /// Input pools are locked through scoped guards for the whole replay so
    /// the inputs cannot be evicted mid-flight, and the locks release on
    /// every exit path, including an operator failure. Expired output cells
    /// have been pruned from the graph; their results are discarded.
    pub fn remat(&self) -> Result<()> {
        let inputs: Vec<Rc<TensorCell>> = self.inputs.borrow().clone();
        let _locks: Vec<PoolLockGuard> = inputs
            .iter()
            .map(|cell| PoolLockGuard::new(cell.pool()))
            .collect();
        let raw: Vec<Tensor> = inputs
            .iter()
            .map(|cell| cell.get())
            .collect::<Result<Vec<_>>>()?;
        let start = Instant::now();
        let ret = (self.func)(&raw)?;
        self.add_cost(start.elapsed());
        let outputs: Vec<WeakCell> = self.outputs.borrow().clone();
        assert_eq!(
            ret.len(),
            outputs.len(),
            "operator replay produced {} outputs, expected {}",
            ret.len(),
            outputs.len()
        );
        for (weak, value) in outputs.iter().zip(ret) {
            if let Some(cell) = weak.upgrade() {
                cell.fill(value);
            }
        }
        Ok(())
    }

    /// Drops the captured callable and both edge lists.
    pub fn release_resources(&self) {
        self.inputs.borrow_mut().clear();
        self.outputs.borrow_mut().clear();
    }
}
