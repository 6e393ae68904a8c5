//! Joint-graph construction and forward/backward partitioning.
//!
//! The combine function is executed exactly twice here: once to discover the
//! output structure, once to record the graph that reverse-mode
//! differentiation extends into the joint forward+backward graph. A
//! [`PartitionPolicy`] then decides which forward values the backward
//! program consumes as saved activations; everything else it recomputes.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use crate::error::internal;
use crate::{
    AliasResolver, ArgMeta, ArrayTy, BinaryOp, Broadcast, Capexpr, CapexprId, CapexprNode, Error,
    Index, Program, PyTree, Stack, StepFn, TracedStep, TreeSpec, alias_activations, grad,
    trace_step,
};

/// The recorded step graph together with its gradient graph.
pub struct JointGraph {
    pub carry_params: Vec<Capexpr>,
    pub x_params: Vec<Capexpr>,
    pub new_carry: Vec<Capexpr>,
    pub y: Vec<Capexpr>,
    pub grad_carry_seeds: Vec<Capexpr>,
    pub grad_y_seeds: Vec<Capexpr>,
    pub grad_carry: Vec<Capexpr>,
    pub grad_x: Vec<Capexpr>,
    forward_ids: HashSet<CapexprId>,
}

impl JointGraph {
    pub fn build(step: &TracedStep) -> Result<JointGraph, Error> {
        let mut seeds = Vec::with_capacity(step.new_carry.len() + step.y.len());
        for (i, ty) in step.carry_tys.iter().enumerate() {
            seeds.push(Capexpr::parameter(
                seeds.len() as i64,
                ty.clone(),
                format!("grad_carry_{i}"),
            ));
        }
        for (i, ty) in step.y_tys.iter().enumerate() {
            seeds.push(Capexpr::parameter(
                seeds.len() as i64,
                ty.clone(),
                format!("grad_y_{i}"),
            ));
        }

        let outputs: Vec<Capexpr> = step
            .new_carry
            .iter()
            .chain(step.y.iter())
            .cloned()
            .collect();
        let wrt: Vec<Capexpr> = step
            .carry_params
            .iter()
            .chain(step.x_params.iter())
            .cloned()
            .collect();
        let grads = grad::grad(&outputs, &seeds, &wrt)?;

        let n_carry = step.carry_params.len();
        // leaves with no path from the outputs still get a cotangent so the
        // backward program has a fixed layout
        let grad_carry = grads[..n_carry]
            .iter()
            .zip(&step.carry_tys)
            .map(|(g, ty)| g.clone().unwrap_or_else(|| Capexpr::zeros(ty.clone())))
            .collect();
        let grad_x = grads[n_carry..]
            .iter()
            .zip(&step.x_tys)
            .map(|(g, ty)| g.clone().unwrap_or_else(|| Capexpr::zeros(ty.clone())))
            .collect();

        let mut forward_ids = HashSet::new();
        let mut stack: Vec<Capexpr> = outputs.iter().chain(wrt.iter()).cloned().collect();
        while let Some(node) = stack.pop() {
            if !forward_ids.insert(node.id()) {
                continue;
            }
            stack.extend(node.children().into_iter().cloned());
        }

        let (grad_carry_seeds, grad_y_seeds) = {
            let (c, y) = seeds.split_at(n_carry);
            (c.to_vec(), y.to_vec())
        };
        Ok(JointGraph {
            carry_params: step.carry_params.clone(),
            x_params: step.x_params.clone(),
            new_carry: step.new_carry.clone(),
            y: step.y.clone(),
            grad_carry_seeds,
            grad_y_seeds,
            grad_carry,
            grad_x,
            forward_ids,
        })
    }

    fn is_forward(&self, id: CapexprId) -> bool {
        self.forward_ids.contains(&id)
    }

    fn backward_roots(&self) -> impl Iterator<Item = &Capexpr> {
        self.grad_carry.iter().chain(self.grad_x.iter())
    }
}

/// The forward half: step inputs to step outputs plus saved activations.
pub struct ForwardGraph {
    pub params: Vec<Capexpr>,
    pub new_carry: Vec<Capexpr>,
    pub y: Vec<Capexpr>,
    pub saved: Vec<Capexpr>,
}

/// The backward half: cotangent seeds and activations to input gradients.
pub struct BackwardGraph {
    pub grad_seeds: Vec<Capexpr>,
    pub activation_params: Vec<Capexpr>,
    pub grad_carry: Vec<Capexpr>,
    pub grad_x: Vec<Capexpr>,
}

/// Strategy deciding which forward values the backward program consumes
/// directly instead of recomputing.
pub trait PartitionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The forward nodes to save, in a deterministic order. Constants are
    /// never saved (they are embedded); random draws must always be saved,
    /// since replaying them would redraw.
    fn saved_nodes(&self, joint: &JointGraph) -> Vec<Capexpr>;

    /// Splits the joint graph into the forward and backward programs.
    fn partition(&self, joint: &JointGraph) -> Result<(ForwardGraph, BackwardGraph), Error> {
        split(joint, self.saved_nodes(joint))
    }
}

/// Saves every forward value the backward graph touches; the backward
/// program recomputes nothing.
pub struct DefaultPartition;

impl PartitionPolicy for DefaultPartition {
    fn name(&self) -> &'static str {
        "default"
    }

    fn saved_nodes(&self, joint: &JointGraph) -> Vec<Capexpr> {
        collect_cut(joint, |node| match &*node.node {
            CapexprNode::Constant(_) => Cut::Embed,
            _ => Cut::Save,
        })
    }
}

/// Saves only the step inputs (and random draws); the backward program
/// recomputes intermediate forward values from them.
pub struct RematPartition;

impl PartitionPolicy for RematPartition {
    fn name(&self) -> &'static str {
        "rematerialize"
    }

    fn saved_nodes(&self, joint: &JointGraph) -> Vec<Capexpr> {
        collect_cut(joint, |node| match &*node.node {
            CapexprNode::Constant(_) => Cut::Embed,
            CapexprNode::Param(_) | CapexprNode::Rand(_) => Cut::Save,
            _ => Cut::Recompute,
        })
    }
}

enum Cut {
    /// Keep the node as a backward-program parameter.
    Save,
    /// Descend into operands; the backward program re-executes the node.
    Recompute,
    /// Leave the node in place without saving (constants).
    Embed,
}

fn collect_cut(joint: &JointGraph, decide: impl Fn(&Capexpr) -> Cut) -> Vec<Capexpr> {
    let mut saved = Vec::new();
    let mut visited: HashSet<CapexprId> = HashSet::new();
    let mut stack: Vec<Capexpr> = joint.backward_roots().cloned().collect();
    while let Some(node) = stack.pop() {
        if !visited.insert(node.id()) {
            continue;
        }
        if joint.is_forward(node.id()) {
            match decide(&node) {
                Cut::Save => saved.push(node),
                Cut::Recompute => stack.extend(node.children().into_iter().cloned()),
                Cut::Embed => {}
            }
        } else {
            stack.extend(node.children().into_iter().cloned());
        }
    }
    saved
}

fn split(joint: &JointGraph, saved: Vec<Capexpr>) -> Result<(ForwardGraph, BackwardGraph), Error> {
    let n_seeds = joint.grad_carry_seeds.len() + joint.grad_y_seeds.len();
    let mut activation_params = Vec::with_capacity(saved.len());
    let mut replacements: HashMap<CapexprId, Capexpr> = HashMap::new();
    // cotangent seeds are parameters of the backward program itself and pass
    // through the rewrite unchanged
    for seed in joint.grad_carry_seeds.iter().chain(joint.grad_y_seeds.iter()) {
        replacements.insert(seed.id(), seed.clone());
    }
    for (k, node) in saved.iter().enumerate() {
        let ty = node
            .ty()
            .ok_or_else(|| Error::UntypedExpression(node.name().into()))?;
        let param = Capexpr::parameter((n_seeds + k) as i64, ty, format!("act_{k}"));
        replacements.insert(node.id(), param.clone());
        activation_params.push(param);
    }

    let mut rewriter = Rewriter {
        replacements,
        cache: HashMap::new(),
    };
    let grad_carry = joint
        .grad_carry
        .iter()
        .map(|e| rewriter.visit(e))
        .collect::<Result<Vec<_>, _>>()?;
    let grad_x = joint
        .grad_x
        .iter()
        .map(|e| rewriter.visit(e))
        .collect::<Result<Vec<_>, _>>()?;

    let forward = ForwardGraph {
        params: joint
            .carry_params
            .iter()
            .chain(joint.x_params.iter())
            .cloned()
            .collect(),
        new_carry: joint.new_carry.clone(),
        y: joint.y.clone(),
        saved,
    };
    let backward = BackwardGraph {
        grad_seeds: joint
            .grad_carry_seeds
            .iter()
            .chain(joint.grad_y_seeds.iter())
            .cloned()
            .collect(),
        activation_params,
        grad_carry,
        grad_x,
    };
    Ok((forward, backward))
}

/// Rebuilds expressions with saved nodes replaced by activation parameters.
/// The rebuilt graph shares nothing with the forward graph, so whatever was
/// not saved is genuinely re-executed by the backward program.
struct Rewriter {
    replacements: HashMap<CapexprId, Capexpr>,
    cache: HashMap<CapexprId, Capexpr>,
}

impl Rewriter {
    fn visit(&mut self, expr: &Capexpr) -> Result<Capexpr, Error> {
        let id = expr.id();
        if let Some(replacement) = self.replacements.get(&id) {
            return Ok(replacement.clone());
        }
        if let Some(done) = self.cache.get(&id) {
            return Ok(done.clone());
        }
        let out = match &*expr.node {
            CapexprNode::Param(p) => {
                // a surviving parameter here means the cut missed an input
                return Err(Error::StalePlaceholder(p.name.clone().into()));
            }
            CapexprNode::Constant(c) => Capexpr::constant(c.data.clone()),
            CapexprNode::Rand(_) => {
                return Err(internal("random draw must be saved, not replayed"));
            }
            CapexprNode::Add(b) => self.visit_binary(b, |l, r| l + r)?,
            CapexprNode::Sub(b) => self.visit_binary(b, |l, r| l - r)?,
            CapexprNode::Mul(b) => self.visit_binary(b, |l, r| l * r)?,
            CapexprNode::Div(b) => self.visit_binary(b, |l, r| l / r)?,
            CapexprNode::Dot(b) => self.visit_binary(b, |l, r| l.dot(&r))?,
            CapexprNode::Neg(e) => -self.visit(e)?,
            CapexprNode::Sin(e) => self.visit(e)?.sin(),
            CapexprNode::Cos(e) => self.visit(e)?.cos(),
            CapexprNode::Sqrt(e) => self.visit(e)?.sqrt(),
            CapexprNode::Log(e) => self.visit(e)?.log(),
            CapexprNode::Exp(e) => self.visit(e)?.exp(),
            CapexprNode::Transpose(e) => self.visit(e)?.transpose(),
            CapexprNode::ReduceSum(e) => self.visit(e)?.reduce_sum(),
            CapexprNode::Broadcast(Broadcast { expr, shape }) => {
                self.visit(expr)?.broadcast(shape.clone())
            }
            CapexprNode::Index(Index { expr, index }) => self.visit(expr)?.index(*index),
            CapexprNode::Stack(Stack { nodes }) => {
                let nodes = nodes
                    .iter()
                    .map(|n| self.visit(n))
                    .collect::<Result<Vec<_>, _>>()?;
                Capexpr::stack(nodes)
            }
        };
        self.cache.insert(id, out.clone());
        Ok(out)
    }

    fn visit_binary(
        &mut self,
        op: &BinaryOp,
        f: impl FnOnce(Capexpr, Capexpr) -> Capexpr,
    ) -> Result<Capexpr, Error> {
        let lhs = self.visit(&op.lhs)?;
        let rhs = self.visit(&op.rhs)?;
        Ok(f(lhs, rhs))
    }
}

/// The shared default policy handle. The handle's identity keys the
/// computation cache, so it is a per-process singleton.
pub fn default_partition() -> Arc<dyn PartitionPolicy> {
    static POLICY: LazyLock<Arc<dyn PartitionPolicy>> =
        LazyLock::new(|| Arc::new(DefaultPartition));
    POLICY.clone()
}

/// The shared rematerializing policy handle.
pub fn remat_partition() -> Arc<dyn PartitionPolicy> {
    static POLICY: LazyLock<Arc<dyn PartitionPolicy>> = LazyLock::new(|| Arc::new(RematPartition));
    POLICY.clone()
}

/// Everything the loop executor needs for one `(fn, policy)` pair.
#[derive(Debug)]
pub struct ScanComputation {
    pub forward: Program,
    pub alias: AliasResolver,
    pub backward: Program,
    pub meta: ScanMeta,
}

/// Structure and layout metadata captured at trace time.
#[derive(Debug)]
pub struct ScanMeta {
    pub carry_spec: TreeSpec,
    pub x_spec: TreeSpec,
    pub y_spec: TreeSpec,
    pub n_carry: usize,
    pub n_x: usize,
    pub n_y: usize,
    pub carry_tys: Vec<ArrayTy>,
    pub x_tys: Vec<ArrayTy>,
    pub y_tys: Vec<ArrayTy>,
    pub carry_rg: Vec<bool>,
    pub x_rg: Vec<bool>,
    pub any_grad: bool,
}

/// Traces the combine function, differentiates it, partitions the joint
/// graph under `policy`, and lowers both halves. The function body runs
/// exactly twice: the structure-discovery trace and the joint trace.
pub fn trace_and_partition(
    step: &Arc<StepFn>,
    init: &PyTree<ArgMeta>,
    x: &PyTree<ArgMeta>,
    policy: &Arc<dyn PartitionPolicy>,
) -> Result<ScanComputation, Error> {
    let structure = trace_step(step, init, x)?;
    let traced = trace_step(step, init, x)?;
    if structure.y_spec != traced.y_spec || structure.y_tys != traced.y_tys {
        return Err(Error::Unsupported(
            "combine function produced a different structure when re-traced".into(),
        ));
    }

    let meta = ScanMeta {
        carry_spec: traced.carry_spec.clone(),
        x_spec: traced.x_spec.clone(),
        y_spec: traced.y_spec.clone(),
        n_carry: traced.carry_params.len(),
        n_x: traced.x_params.len(),
        n_y: traced.y.len(),
        carry_tys: traced.carry_tys.clone(),
        x_tys: traced.x_tys.clone(),
        y_tys: traced.y_tys.clone(),
        carry_rg: traced.carry_rg.clone(),
        x_rg: traced.x_rg.clone(),
        any_grad: traced.carry_rg.iter().chain(traced.x_rg.iter()).any(|rg| *rg),
    };

    let forward_params: Vec<Capexpr> = traced
        .carry_params
        .iter()
        .chain(traced.x_params.iter())
        .cloned()
        .collect();
    let step_outputs: Vec<Capexpr> = traced
        .new_carry
        .iter()
        .chain(traced.y.iter())
        .cloned()
        .collect();

    if !meta.any_grad {
        // no gradient consumer: no joint graph, no activations
        let forward = Program::compile(forward_params, step_outputs)?;
        let backward = Program::compile(Vec::new(), Vec::new())?;
        return Ok(ScanComputation {
            forward,
            alias: AliasResolver::default(),
            backward,
            meta,
        });
    }

    let joint = JointGraph::build(&traced)?;
    let (fwd, bwd) = policy.partition(&joint)?;
    let (materialized, alias) = alias_activations(&fwd.saved, &joint.x_params);

    let forward_outputs: Vec<Capexpr> = step_outputs
        .into_iter()
        .chain(materialized)
        .collect();
    let forward = Program::compile(fwd.params, forward_outputs)?;
    let backward_params: Vec<Capexpr> = bwd
        .grad_seeds
        .into_iter()
        .chain(bwd.activation_params)
        .collect();
    let backward_outputs: Vec<Capexpr> = bwd
        .grad_carry
        .into_iter()
        .chain(bwd.grad_x)
        .collect();
    let backward = Program::compile(backward_params, backward_outputs)?;

    Ok(ScanComputation {
        forward,
        alias,
        backward,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementType, Error as CrateError};

    fn meta_leaf(shape: &[i64]) -> PyTree<ArgMeta> {
        PyTree::Leaf(ArgMeta {
            ty: ArrayTy::new(ElementType::F64, shape.iter().copied().collect()),
            requires_grad: true,
        })
    }

    fn sin_chain() -> Arc<StepFn> {
        Arc::new(|carry, x| {
            let carry = carry.as_leaf().ok_or(CrateError::TreeStructureMismatch)?;
            let x = x.as_leaf().ok_or(CrateError::TreeStructureMismatch)?;
            let mut carry = carry.clone_value();
            let mut x = x.clone_value();
            for _ in 0..10 {
                carry = carry.sin();
            }
            for _ in 0..10 {
                x = x.sin();
            }
            Ok((PyTree::Leaf(carry), PyTree::Leaf(x)))
        })
    }

    #[test]
    fn test_default_partition_never_recomputes() {
        let comp = trace_and_partition(
            &sin_chain(),
            &meta_leaf(&[4, 4]),
            &meta_leaf(&[4, 4]),
            &default_partition(),
        )
        .unwrap();
        assert_eq!(comp.backward.op_count("Sin"), 0);
        // cos-of-saved-activation is how the derivative is formed instead
        assert!(comp.backward.op_count("Cos") >= 20);
    }

    #[test]
    fn test_remat_partition_recomputes_forward_ops() {
        let comp = trace_and_partition(
            &sin_chain(),
            &meta_leaf(&[4, 4]),
            &meta_leaf(&[4, 4]),
            &remat_partition(),
        )
        .unwrap();
        assert!(comp.backward.op_count("Sin") > 10);
        // only the two inputs survive as activations
        assert_eq!(comp.alias.len(), 2);
        assert_eq!(comp.alias.aliased_count(), 1);
    }

    #[test]
    fn test_policy_handles_are_singletons() {
        assert!(Arc::ptr_eq(&default_partition(), &default_partition()));
        assert!(!Arc::ptr_eq(&default_partition(), &remat_partition()));
    }
}
