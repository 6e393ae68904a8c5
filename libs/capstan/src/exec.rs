//! Lowers expression graphs into runnable programs.
//!
//! [`Program::compile`] type-checks a graph against its parameter list;
//! [`Program::run`] replays it against concrete device buffers. Evaluation is
//! memoized per run, keyed by expression identity, so shared subgraphs are
//! computed once.
use std::collections::HashMap;

use crate::error::internal;
use crate::{ArrayTy, Buffer, Capexpr, CapexprId, CapexprNode, Client, Data, Error};

/// A lowered computation: parameter placeholders plus output expressions.
#[derive(Debug)]
pub struct Program {
    params: Vec<Capexpr>,
    outputs: Vec<Capexpr>,
    output_tys: Vec<ArrayTy>,
}

impl Program {
    /// Validates the graph and fixes the output types. Every parameter must
    /// be a `Param` node; every output must type-check.
    pub fn compile(params: Vec<Capexpr>, outputs: Vec<Capexpr>) -> Result<Self, Error> {
        for param in &params {
            if !matches!(&*param.node, CapexprNode::Param(_)) {
                return Err(Error::ProgramArgMismatch(
                    "program parameters must be placeholder expressions".into(),
                ));
            }
        }
        let output_tys = outputs
            .iter()
            .map(|out| {
                out.ty()
                    .ok_or_else(|| Error::UntypedExpression(out.name().into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Program {
            params,
            outputs,
            output_tys,
        })
    }

    pub fn params(&self) -> &[Capexpr] {
        &self.params
    }

    pub fn outputs(&self) -> &[Capexpr] {
        &self.outputs
    }

    pub fn output_tys(&self) -> &[ArrayTy] {
        &self.output_tys
    }

    /// Counts distinct nodes of the given kind reachable from the outputs.
    pub fn op_count(&self, name: &str) -> usize {
        let mut seen = HashMap::new();
        let mut count = 0;
        let mut stack: Vec<Capexpr> = self.outputs.to_vec();
        while let Some(expr) = stack.pop() {
            if seen.insert(expr.id(), ()).is_some() {
                continue;
            }
            if expr.name() == name {
                count += 1;
            }
            stack.extend(expr.children().into_iter().cloned());
        }
        count
    }

    /// Executes the program against device buffers, producing one buffer per
    /// output. Evaluation stays on device.
    pub fn run(&self, client: &Client, args: &[Buffer]) -> Result<Vec<Buffer>, Error> {
        if args.len() != self.params.len() {
            return Err(Error::ProgramArgMismatch(
                format!(
                    "expected {} arguments, got {}",
                    self.params.len(),
                    args.len()
                )
                .into(),
            ));
        }
        let mut evaluator = Evaluator {
            client,
            cache: HashMap::new(),
        };
        for (param, arg) in self.params.iter().zip(args) {
            let expected = param.ty().ok_or_else(|| internal("untyped parameter"))?;
            if expected != *arg.ty() {
                return Err(Error::ProgramArgMismatch(
                    format!("argument type {:?} does not match {:?}", arg.ty(), expected).into(),
                ));
            }
            evaluator.cache.insert(param.id(), arg.clone());
        }
        self.outputs
            .iter()
            .map(|out| evaluator.visit(out))
            .collect()
    }
}

struct Evaluator<'a> {
    client: &'a Client,
    cache: HashMap<CapexprId, Buffer>,
}

impl Evaluator<'_> {
    fn visit(&mut self, expr: &Capexpr) -> Result<Buffer, Error> {
        let id = expr.id();
        if let Some(buf) = self.cache.get(&id) {
            return Ok(buf.clone());
        }

        let ty = expr
            .ty()
            .ok_or_else(|| Error::UntypedExpression(expr.name().into()))?;
        let buf = match &*expr.node {
            // Unbound parameters reaching evaluation indicate a placeholder
            // captured from a trace this program was not compiled from.
            CapexprNode::Param(p) => {
                return Err(Error::StalePlaceholder(p.name.clone().into()));
            }
            CapexprNode::Constant(c) => {
                Buffer::from_parts(c.data.ty().clone(), c.data.data().clone())
            }
            CapexprNode::Rand(ty) => {
                let mut state = self.client.next_seed();
                let values = (0..ty.len())
                    .map(|_| {
                        state = state
                            .wrapping_mul(0x5851_f42d_4c95_7f2d)
                            .wrapping_add(0x1405_7b7e_f767_814f);
                        (state >> 11) as f64 / (1u64 << 53) as f64
                    })
                    .collect();
                Buffer::from_parts(ty.clone(), Data::from_f64_vec(ty.element_type, values))
            }
            CapexprNode::Add(b) => self.visit_elementwise(b_pair(b), &ty, |l, r| l + r)?,
            CapexprNode::Sub(b) => self.visit_elementwise(b_pair(b), &ty, |l, r| l - r)?,
            CapexprNode::Mul(b) => self.visit_elementwise(b_pair(b), &ty, |l, r| l * r)?,
            CapexprNode::Div(b) => self.visit_elementwise(b_pair(b), &ty, |l, r| l / r)?,
            CapexprNode::Dot(b) => {
                let lhs = self.visit(&b.lhs)?;
                let rhs = self.visit(&b.rhs)?;
                dot(&lhs, &rhs, &ty)?
            }
            CapexprNode::Neg(e) => self.visit_unary(e, &ty, |x| -x)?,
            CapexprNode::Sin(e) => self.visit_unary(e, &ty, f64::sin)?,
            CapexprNode::Cos(e) => self.visit_unary(e, &ty, f64::cos)?,
            CapexprNode::Sqrt(e) => self.visit_unary(e, &ty, f64::sqrt)?,
            CapexprNode::Log(e) => self.visit_unary(e, &ty, f64::ln)?,
            CapexprNode::Exp(e) => self.visit_unary(e, &ty, f64::exp)?,
            CapexprNode::Transpose(e) => {
                let arg = self.visit(e)?;
                let [rows, cols] = arg.shape() else {
                    return Err(Error::Unsupported("transpose of a non-matrix".into()));
                };
                let (rows, cols) = (*rows as usize, *cols as usize);
                let src = arg.data.to_f64_vec();
                let mut values = vec![0.0; src.len()];
                for r in 0..rows {
                    for c in 0..cols {
                        values[c * rows + r] = src[r * cols + c];
                    }
                }
                Buffer::from_parts(ty.clone(), Data::from_f64_vec(ty.element_type, values))
            }
            CapexprNode::ReduceSum(e) => {
                let arg = self.visit(e)?;
                let total: f64 = arg.data.to_f64_vec().iter().sum();
                Buffer::from_parts(ty.clone(), Data::from_f64_vec(ty.element_type, vec![total]))
            }
            CapexprNode::Broadcast(b) => {
                let arg = self.visit(&b.expr)?;
                let value = *arg
                    .data
                    .to_f64_vec()
                    .first()
                    .ok_or_else(|| internal("broadcast of an empty buffer"))?;
                Buffer::from_parts(
                    ty.clone(),
                    Data::from_f64_vec(ty.element_type, vec![value; ty.len()]),
                )
            }
            CapexprNode::Index(i) => self.visit(&i.expr)?.index_leading(i.index)?,
            CapexprNode::Stack(s) => {
                let rows = s
                    .nodes
                    .iter()
                    .map(|n| self.visit(n))
                    .collect::<Result<Vec<_>, _>>()?;
                Buffer::stack(&rows)?
            }
        };
        self.cache.insert(id, buf.clone());
        Ok(buf)
    }

    fn visit_unary(
        &mut self,
        expr: &Capexpr,
        ty: &ArrayTy,
        f: impl Fn(f64) -> f64,
    ) -> Result<Buffer, Error> {
        let arg = self.visit(expr)?;
        let values = arg.data.to_f64_vec().into_iter().map(f).collect();
        Ok(Buffer::from_parts(
            ty.clone(),
            Data::from_f64_vec(ty.element_type, values),
        ))
    }

    fn visit_elementwise(
        &mut self,
        (lhs, rhs): (&Capexpr, &Capexpr),
        ty: &ArrayTy,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Buffer, Error> {
        let lhs = self.visit(lhs)?;
        let rhs = self.visit(rhs)?;
        let l = lhs.data.to_f64_vec();
        let r = rhs.data.to_f64_vec();
        let len = ty.len();
        // scalar operands repeat; equal-shape operands pair up
        let values = (0..len)
            .map(|i| f(l[i % l.len().max(1)], r[i % r.len().max(1)]))
            .collect();
        Ok(Buffer::from_parts(
            ty.clone(),
            Data::from_f64_vec(ty.element_type, values),
        ))
    }
}

fn b_pair(b: &crate::BinaryOp) -> (&Capexpr, &Capexpr) {
    (&b.lhs, &b.rhs)
}

fn dot(lhs: &Buffer, rhs: &Buffer, ty: &ArrayTy) -> Result<Buffer, Error> {
    let [m, k] = lhs.shape() else {
        return Err(Error::Unsupported("dot lhs must be a matrix".into()));
    };
    let (m, k) = (*m as usize, *k as usize);
    let l = lhs.data.to_f64_vec();
    let r = rhs.data.to_f64_vec();
    let n = match rhs.shape() {
        [k2, n] if *k2 as usize == k => *n as usize,
        _ => return Err(Error::Unsupported("dot shape mismatch".into())),
    };
    let mut values = vec![0.0; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0;
            for i in 0..k {
                acc += l[row * k + i] * r[i * n + col];
            }
            values[row * n + col] = acc;
        }
    }
    Ok(Buffer::from_parts(
        ty.clone(),
        Data::from_f64_vec(ty.element_type, values),
    ))
}
