//! The scan entry point and loop executor.
//!
//! [`ScanContext::scan`] drives the compiled forward program across the
//! leading dimension of `xs`, stacking per-step outputs, and hands back a
//! [`ScanBackward`] that replays the compiled backward program once per step
//! in reverse order. The context owns the computation cache; tensors stay
//! owned by the caller and all intermediate values stay on device.
use std::cell::RefCell;
use std::sync::Arc;

use crate::{
    ArgMeta, ArrayTy, Buffer, Client, ComputationCache, Error, PartitionPolicy, PyTree,
    ScanComputation, StepFn, Tensor, fn_key, policy_key, trace_and_partition,
};

/// Owns the client and the computation cache for scan calls.
pub struct ScanContext {
    client: Client,
    cache: RefCell<ComputationCache>,
}

/// Result of a scan: the threaded-through carry, the stacked per-step
/// outputs, and, when any input requires gradients, the backward handle.
#[derive(Debug)]
pub struct ScanOutput {
    pub final_carry: PyTree<Tensor>,
    pub ys: PyTree<Tensor>,
    pub backward: Option<ScanBackward>,
}

impl ScanContext {
    pub fn new(client: Client) -> Self {
        ScanContext {
            client,
            cache: RefCell::new(ComputationCache::new()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Number of combine functions with cached computations.
    pub fn cached_fn_count(&self) -> usize {
        self.cache.borrow().fn_count()
    }

    pub fn cache_contains(&self, step: &Arc<StepFn>) -> bool {
        self.cache.borrow().contains_fn(fn_key(step))
    }

    /// Size of the per-policy cache level for one combine function.
    pub fn cached_policy_count(&self, step: &Arc<StepFn>) -> usize {
        self.cache.borrow().policy_count(fn_key(step))
    }

    /// Scans `step` over the leading dimension of `xs`, threading the carry
    /// from `init`. Compiled computations are cached per
    /// `(step, policy)` handle pair, but only when `is_fn_pure` is set.
    pub fn scan(
        &self,
        step: &Arc<StepFn>,
        init: &PyTree<Tensor>,
        xs: &PyTree<Tensor>,
        policy: &Arc<dyn PartitionPolicy>,
        is_fn_pure: bool,
    ) -> Result<ScanOutput, Error> {
        // argument validation happens before any tracing
        let xs_leaves = xs.leaves();
        if xs_leaves.is_empty() {
            return Err(Error::ScanMissingArg);
        }
        let mut steps = None;
        for leaf in &xs_leaves {
            let first = *leaf.ty().shape.first().ok_or(Error::ScanArgRankZero)?;
            match steps {
                None => steps = Some(first),
                Some(n) if n != first => return Err(Error::ScanShapeMismatch),
                Some(_) => {}
            }
        }
        let n = steps.unwrap_or(0);
        if n == 0 {
            return Err(Error::ScanMissingArg);
        }

        let init_meta = init.map(Tensor::meta);
        let x_meta = xs.map(|t| {
            let ty = t.ty();
            ArgMeta {
                // rank was validated above, so the leading dim exists
                ty: ArrayTy::new(ty.element_type, ty.shape[1..].iter().copied().collect()),
                requires_grad: t.requires_grad,
            }
        });
        let comp = self.computation(step, &init_meta, &x_meta, policy, is_fn_pure)?;
        let meta = &comp.meta;
        if init.leaves().len() != meta.n_carry || xs_leaves.len() != meta.n_x {
            return Err(Error::LeafCountMismatch {
                expected: meta.n_carry + meta.n_x,
                got: init.leaves().len() + xs_leaves.len(),
            });
        }

        let mut carry: Vec<Buffer> = init.leaves().iter().map(|t| t.buffer.clone()).collect();
        let mut ys_steps: Vec<Vec<Buffer>> = vec![Vec::with_capacity(n as usize); meta.n_y];
        let mut activations: Vec<Vec<Buffer>> = Vec::with_capacity(n as usize);
        for i in 0..n {
            let x_i = xs_leaves
                .iter()
                .map(|t| t.buffer.index_leading(i))
                .collect::<Result<Vec<_>, _>>()?;
            let args: Vec<Buffer> = carry.iter().chain(x_i.iter()).cloned().collect();
            let mut outs = comp.forward.run(&self.client, &args)?.into_iter();
            carry = outs.by_ref().take(meta.n_carry).collect();
            let y_i: Vec<Buffer> = outs.by_ref().take(meta.n_y).collect();
            if meta.any_grad {
                let partial: Vec<Buffer> = outs.collect();
                activations.push(comp.alias.resolve(&partial, &x_i)?);
            }
            for (leaf, y) in ys_steps.iter_mut().zip(y_i) {
                leaf.push(y);
            }
        }

        let final_carry = PyTree::unflatten(
            &meta.carry_spec,
            carry
                .into_iter()
                .map(|b| Tensor::new(b, meta.any_grad))
                .collect(),
        )?;
        // a step output that is absent at trace time collapses to a single
        // absent leaf, never a sequence of absents
        let ys_leaves = ys_steps
            .iter()
            .map(|rows| Ok(Tensor::new(Buffer::stack(rows)?, meta.any_grad)))
            .collect::<Result<Vec<_>, Error>>()?;
        let ys = PyTree::unflatten(&meta.y_spec, ys_leaves)?;

        let backward = meta.any_grad.then(|| ScanBackward {
            client: self.client.clone(),
            comp: comp.clone(),
            activations,
            n,
        });
        Ok(ScanOutput {
            final_carry,
            ys,
            backward,
        })
    }

    fn computation(
        &self,
        step: &Arc<StepFn>,
        init: &PyTree<ArgMeta>,
        x: &PyTree<ArgMeta>,
        policy: &Arc<dyn PartitionPolicy>,
        is_fn_pure: bool,
    ) -> Result<Arc<ScanComputation>, Error> {
        if !is_fn_pure {
            // without the purity declaration the cache is neither read nor
            // written, even if an entry already exists for this function
            return Ok(Arc::new(trace_and_partition(step, init, x, policy)?));
        }
        let (fk, pk) = (fn_key(step), policy_key(policy));
        if let Some(hit) = self.cache.borrow().get(fk, pk) {
            return Ok(hit);
        }
        let comp = Arc::new(trace_and_partition(step, init, x, policy)?);
        self.cache.borrow_mut().insert(fk, pk, comp.clone());
        Ok(comp)
    }
}

/// The deferred backward pass over one scan invocation. Consumes itself on
/// [`ScanBackward::run`]: the per-step activations are used exactly once.
#[derive(Debug)]
pub struct ScanBackward {
    client: Client,
    comp: Arc<ScanComputation>,
    activations: Vec<Vec<Buffer>>,
    n: i64,
}

impl ScanBackward {
    /// Replays the backward program from step `n - 1` down to `0`,
    /// threading the running carry cotangent and stacking the per-step `x`
    /// gradients back into sequence order. Missing seeds are zero-filled.
    /// Leaves that do not require gradients come back as `None`.
    pub fn run(
        self,
        grad_final_carry: Option<&PyTree<Buffer>>,
        grad_ys: Option<&PyTree<Buffer>>,
    ) -> Result<(PyTree<Option<Buffer>>, PyTree<Option<Buffer>>), Error> {
        let meta = &self.comp.meta;
        let mut grad_carry: Vec<Buffer> = match grad_final_carry {
            Some(tree) => {
                let leaves = tree.leaves();
                if leaves.len() != meta.n_carry {
                    return Err(Error::LeafCountMismatch {
                        expected: meta.n_carry,
                        got: leaves.len(),
                    });
                }
                leaves.into_iter().cloned().collect()
            }
            None => meta.carry_tys.iter().cloned().map(Buffer::zeros).collect(),
        };
        let grad_ys_leaves = match grad_ys {
            Some(tree) => {
                let leaves = tree.leaves();
                if leaves.len() != meta.n_y {
                    return Err(Error::LeafCountMismatch {
                        expected: meta.n_y,
                        got: leaves.len(),
                    });
                }
                Some(leaves.into_iter().cloned().collect::<Vec<_>>())
            }
            None => None,
        };

        let mut grad_x_steps: Vec<Vec<Buffer>> = vec![Vec::with_capacity(self.n as usize); meta.n_x];
        for i in (0..self.n).rev() {
            let grad_y_i: Vec<Buffer> = match &grad_ys_leaves {
                Some(leaves) => leaves
                    .iter()
                    .map(|b| b.index_leading(i))
                    .collect::<Result<Vec<_>, _>>()?,
                None => meta.y_tys.iter().cloned().map(Buffer::zeros).collect(),
            };
            let acts = &self.activations[i as usize];
            let args: Vec<Buffer> = grad_carry
                .iter()
                .chain(grad_y_i.iter())
                .chain(acts.iter())
                .cloned()
                .collect();
            let mut outs = self.comp.backward.run(&self.client, &args)?.into_iter();
            grad_carry = outs.by_ref().take(meta.n_carry).collect();
            for (leaf, gx) in grad_x_steps.iter_mut().zip(outs) {
                leaf.push(gx);
            }
        }

        let grad_init = PyTree::unflatten(
            &meta.carry_spec,
            grad_carry
                .into_iter()
                .zip(&meta.carry_rg)
                .map(|(b, rg)| rg.then_some(b))
                .collect(),
        )?;
        let grad_xs_leaves = grad_x_steps
            .into_iter()
            .zip(&meta.x_rg)
            .map(|(mut rows, rg)| {
                rows.reverse();
                rg.then(|| Buffer::stack(&rows)).transpose()
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let grad_xs = PyTree::unflatten(&meta.x_spec, grad_xs_leaves)?;
        Ok((grad_init, grad_xs))
    }
}
