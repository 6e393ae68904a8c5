//! Reverse-mode differentiation over recorded expression graphs.
//!
//! Walks the graph in reverse topological order, accumulating cotangent
//! expressions per node. The returned gradients are themselves expressions,
//! so a joint forward+backward graph is just more IR.
use std::collections::{HashMap, HashSet};

use crate::error::internal;
use crate::{ArrayTy, Capexpr, CapexprId, CapexprNode, Error};

/// Differentiates `outputs` with respect to `wrt`, seeding each output with
/// the matching cotangent expression. Returns one gradient expression per
/// `wrt` entry; `None` when no path from the outputs reaches it.
pub fn grad(
    outputs: &[Capexpr],
    seeds: &[Capexpr],
    wrt: &[Capexpr],
) -> Result<Vec<Option<Capexpr>>, Error> {
    if outputs.len() != seeds.len() {
        return Err(internal("one cotangent seed is required per output"));
    }
    let order = topo_order(outputs);
    let mut cotangents: HashMap<CapexprId, Capexpr> = HashMap::new();
    for (output, seed) in outputs.iter().zip(seeds) {
        accumulate(&mut cotangents, output, seed.clone());
    }
    // reverse postorder: every use of a node is visited before the node
    for node in order.iter().rev() {
        let Some(g) = cotangents.get(&node.id()).cloned() else {
            continue;
        };
        backprop_node(&mut cotangents, node, g)?;
    }
    Ok(wrt
        .iter()
        .map(|param| cotangents.get(&param.id()).cloned())
        .collect())
}

fn backprop_node(
    cotangents: &mut HashMap<CapexprId, Capexpr>,
    node: &Capexpr,
    g: Capexpr,
) -> Result<(), Error> {
    match &*node.node {
        CapexprNode::Param(_) | CapexprNode::Constant(_) | CapexprNode::Rand(_) => {}
        CapexprNode::Add(b) => {
            accumulate_reduced(cotangents, &b.lhs, g.clone())?;
            accumulate_reduced(cotangents, &b.rhs, g)?;
        }
        CapexprNode::Sub(b) => {
            accumulate_reduced(cotangents, &b.lhs, g.clone())?;
            accumulate_reduced(cotangents, &b.rhs, -g)?;
        }
        CapexprNode::Mul(b) => {
            accumulate_reduced(cotangents, &b.lhs, g.clone() * b.rhs.clone())?;
            accumulate_reduced(cotangents, &b.rhs, g * b.lhs.clone())?;
        }
        CapexprNode::Div(b) => {
            accumulate_reduced(cotangents, &b.lhs, g.clone() / b.rhs.clone())?;
            let rhs_sq = b.rhs.clone() * b.rhs.clone();
            accumulate_reduced(cotangents, &b.rhs, -(g * b.lhs.clone() / rhs_sq))?;
        }
        CapexprNode::Dot(b) => {
            // C = A B  =>  dA = dC Bᵀ, dB = Aᵀ dC
            accumulate(cotangents, &b.lhs, g.clone().dot(&b.rhs.clone().transpose()));
            accumulate(cotangents, &b.rhs, b.lhs.clone().transpose().dot(&g));
        }
        CapexprNode::Neg(e) => accumulate(cotangents, e, -g),
        CapexprNode::Sin(e) => accumulate(cotangents, e, g * e.clone().cos()),
        CapexprNode::Cos(e) => accumulate(cotangents, e, -(g * e.clone().sin())),
        CapexprNode::Sqrt(e) => {
            let half = Capexpr::scalar(0.5, element_type(node)?);
            accumulate(cotangents, e, g * half / node.clone());
        }
        CapexprNode::Log(e) => accumulate(cotangents, e, g / e.clone()),
        CapexprNode::Exp(e) => accumulate(cotangents, e, g * node.clone()),
        CapexprNode::Transpose(e) => accumulate(cotangents, e, g.transpose()),
        CapexprNode::ReduceSum(e) => {
            let ty = operand_ty(e)?;
            accumulate(cotangents, e, g.broadcast(ty.shape));
        }
        CapexprNode::Broadcast(b) => accumulate(cotangents, &b.expr, g.reduce_sum()),
        CapexprNode::Index(i) => {
            // the cotangent of a row select scatters into an otherwise
            // zero-valued stack
            let ty = operand_ty(&i.expr)?;
            let row_ty = ty.drop_leading()?;
            let len = ty.shape[0];
            let rows = (0..len)
                .map(|row| {
                    if row == i.index {
                        g.clone()
                    } else {
                        Capexpr::zeros(row_ty.clone())
                    }
                })
                .collect();
            accumulate(cotangents, &i.expr, Capexpr::stack(rows));
        }
        CapexprNode::Stack(s) => {
            for (row, child) in s.nodes.iter().enumerate() {
                accumulate(cotangents, child, g.clone().index(row as i64));
            }
        }
    }
    Ok(())
}

fn accumulate(cotangents: &mut HashMap<CapexprId, Capexpr>, node: &Capexpr, g: Capexpr) {
    match cotangents.remove(&node.id()) {
        Some(existing) => {
            cotangents.insert(node.id(), existing + g);
        }
        None => {
            cotangents.insert(node.id(), g);
        }
    }
}

/// Accumulates a cotangent into an operand of a broadcasting op, summing the
/// cotangent back down when the operand was a scalar that got broadcast.
fn accumulate_reduced(
    cotangents: &mut HashMap<CapexprId, Capexpr>,
    node: &Capexpr,
    g: Capexpr,
) -> Result<(), Error> {
    let target = operand_ty(node)?;
    let g_ty = g
        .ty()
        .ok_or_else(|| Error::UntypedExpression(g.name().into()))?;
    let reduced = if g_ty.shape == target.shape {
        g
    } else if target.is_scalar() {
        g.reduce_sum()
    } else if g_ty.is_scalar() {
        g.broadcast(target.shape)
    } else {
        return Err(Error::Unsupported(
            "gradient shape does not reduce to its operand".into(),
        ));
    };
    accumulate(cotangents, node, reduced);
    Ok(())
}

fn operand_ty(node: &Capexpr) -> Result<ArrayTy, Error> {
    node.ty()
        .ok_or_else(|| Error::UntypedExpression(node.name().into()))
}

fn element_type(node: &Capexpr) -> Result<crate::ElementType, Error> {
    Ok(operand_ty(node)?.element_type)
}

/// Postorder over the DAG reachable from `roots`: operands appear before
/// their users, each node exactly once.
fn topo_order(roots: &[Capexpr]) -> Vec<Capexpr> {
    let mut order = Vec::new();
    let mut visited: HashSet<CapexprId> = HashSet::new();
    let mut stack: Vec<(Capexpr, bool)> = roots.iter().map(|r| (r.clone(), false)).collect();
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((node.clone(), true));
        for child in node.children() {
            if !visited.contains(&child.id()) {
                stack.push((child.clone(), false));
            }
        }
    }
    order
}
