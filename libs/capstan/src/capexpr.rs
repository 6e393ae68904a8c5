use std::{
    ops::{Add, Deref, Div, Mul, Neg, Sub},
    sync::Arc,
};

use itertools::Itertools;
use smallvec::SmallVec;

use crate::{ArrayTy, ElementType, Literal};

#[derive(Debug)]
pub enum CapexprNode {
    // Params / Variables
    Param(ParamExpr),

    // Constants
    Constant(Constant),

    // Per-evaluation uniform draw; the state advances between evaluations
    Rand(ArrayTy),

    // Element Wise Binary Ops
    Add(BinaryOp),
    Sub(BinaryOp),
    Mul(BinaryOp),
    Div(BinaryOp),

    // Matrix Multiplication
    Dot(BinaryOp),

    // Unary Ops
    Neg(Capexpr),
    Sin(Capexpr),
    Cos(Capexpr),
    Sqrt(Capexpr),
    Log(Capexpr),
    Exp(Capexpr),

    // Shape ops
    Transpose(Capexpr),
    ReduceSum(Capexpr),
    Broadcast(Broadcast),

    // Leading-dimension ops
    Index(Index),
    Stack(Stack),
}

pub struct Constant {
    pub data: Literal,
}

impl std::fmt::Debug for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Constant").field("ty", self.data.ty()).finish()
    }
}

#[derive(Debug)]
pub struct ParamExpr {
    pub number: i64,
    pub name: String,
    pub ty: ArrayTy,
}

#[derive(Debug)]
pub struct BinaryOp {
    pub lhs: Capexpr,
    pub rhs: Capexpr,
}

impl BinaryOp {
    fn ty(&self) -> Option<ArrayTy> {
        let lhs = self.lhs.ty()?;
        let rhs = self.rhs.ty()?;
        if lhs.element_type != rhs.element_type {
            return None;
        }
        let shape = broadcast_dims(&lhs.shape, &rhs.shape)?;
        Some(ArrayTy::new(lhs.element_type, shape))
    }
}

/// Broadcast rule restricted to scalar-vs-array: two shapes are compatible
/// when they are equal or one of them is rank zero.
pub(crate) fn broadcast_dims(lhs: &[i64], rhs: &[i64]) -> Option<SmallVec<[i64; 4]>> {
    if lhs.is_empty() {
        return Some(rhs.iter().copied().collect());
    }
    if rhs.is_empty() {
        return Some(lhs.iter().copied().collect());
    }
    lhs.iter()
        .copied()
        .zip_longest(rhs.iter().copied())
        .map(|pair| match pair {
            itertools::EitherOrBoth::Both(l, r) if l == r => Some(l),
            _ => None,
        })
        .collect()
}

#[derive(Debug)]
pub struct Broadcast {
    pub expr: Capexpr,
    pub shape: SmallVec<[i64; 4]>,
}

#[derive(Debug)]
pub struct Index {
    pub expr: Capexpr,
    pub index: i64,
}

#[derive(Debug)]
pub struct Stack {
    pub nodes: Vec<Capexpr>,
}

/// Core structure for representing computational expressions.
#[derive(Debug, Clone)]
pub struct Capexpr {
    pub node: Arc<CapexprNode>,
    pub id: CapexprId,
}

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub struct CapexprId(usize);

impl Default for CapexprId {
    /// Provides default generation of unique identifiers for expressions.
    fn default() -> Self {
        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        Self(COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }
}

impl Capexpr {
    pub fn new(node: CapexprNode) -> Self {
        Self {
            node: Arc::new(node),
            id: CapexprId::default(),
        }
    }

    pub fn parameter(number: i64, ty: ArrayTy, name: String) -> Self {
        Self::new(CapexprNode::Param(ParamExpr { number, name, ty }))
    }

    pub fn constant(data: Literal) -> Self {
        Self::new(CapexprNode::Constant(Constant { data }))
    }

    /// A scalar constant of the given element type.
    pub fn scalar(value: f64, element_type: ElementType) -> Self {
        Self::constant(Literal::full(ArrayTy::scalar(element_type), value))
    }

    pub fn zeros(ty: ArrayTy) -> Self {
        Self::constant(Literal::zeros(ty))
    }

    pub fn rand(ty: ArrayTy) -> Self {
        Self::new(CapexprNode::Rand(ty))
    }

    pub fn dot(self, rhs: &Capexpr) -> Self {
        Self::new(CapexprNode::Dot(BinaryOp {
            lhs: self,
            rhs: rhs.clone(),
        }))
    }

    pub fn sin(self) -> Self {
        Self::new(CapexprNode::Sin(self))
    }

    pub fn cos(self) -> Self {
        Self::new(CapexprNode::Cos(self))
    }

    pub fn sqrt(self) -> Self {
        Self::new(CapexprNode::Sqrt(self))
    }

    pub fn log(self) -> Self {
        Self::new(CapexprNode::Log(self))
    }

    pub fn exp(self) -> Self {
        Self::new(CapexprNode::Exp(self))
    }

    pub fn transpose(self) -> Self {
        Self::new(CapexprNode::Transpose(self))
    }

    pub fn reduce_sum(self) -> Self {
        Self::new(CapexprNode::ReduceSum(self))
    }

    pub fn broadcast(self, shape: SmallVec<[i64; 4]>) -> Self {
        Self::new(CapexprNode::Broadcast(Broadcast { expr: self, shape }))
    }

    pub fn index(self, index: i64) -> Self {
        Self::new(CapexprNode::Index(Index { expr: self, index }))
    }

    pub fn stack(nodes: Vec<Capexpr>) -> Self {
        Self::new(CapexprNode::Stack(Stack { nodes }))
    }

    pub fn id(&self) -> CapexprId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        match self.deref() {
            CapexprNode::Param(_) => "Param",
            CapexprNode::Constant(_) => "Constant",
            CapexprNode::Rand(_) => "Rand",
            CapexprNode::Add(_) => "Add",
            CapexprNode::Sub(_) => "Sub",
            CapexprNode::Mul(_) => "Mul",
            CapexprNode::Div(_) => "Div",
            CapexprNode::Dot(_) => "Dot",
            CapexprNode::Neg(_) => "Neg",
            CapexprNode::Sin(_) => "Sin",
            CapexprNode::Cos(_) => "Cos",
            CapexprNode::Sqrt(_) => "Sqrt",
            CapexprNode::Log(_) => "Log",
            CapexprNode::Exp(_) => "Exp",
            CapexprNode::Transpose(_) => "Transpose",
            CapexprNode::ReduceSum(_) => "ReduceSum",
            CapexprNode::Broadcast(_) => "Broadcast",
            CapexprNode::Index(_) => "Index",
            CapexprNode::Stack(_) => "Stack",
        }
    }

    /// Operand expressions, in a fixed order per node kind.
    pub fn children(&self) -> SmallVec<[&Capexpr; 2]> {
        let mut out = SmallVec::new();
        match self.deref() {
            CapexprNode::Param(_) | CapexprNode::Constant(_) | CapexprNode::Rand(_) => {}
            CapexprNode::Add(b)
            | CapexprNode::Sub(b)
            | CapexprNode::Mul(b)
            | CapexprNode::Div(b)
            | CapexprNode::Dot(b) => {
                out.push(&b.lhs);
                out.push(&b.rhs);
            }
            CapexprNode::Neg(e)
            | CapexprNode::Sin(e)
            | CapexprNode::Cos(e)
            | CapexprNode::Sqrt(e)
            | CapexprNode::Log(e)
            | CapexprNode::Exp(e)
            | CapexprNode::Transpose(e)
            | CapexprNode::ReduceSum(e) => out.push(e),
            CapexprNode::Broadcast(b) => out.push(&b.expr),
            CapexprNode::Index(i) => out.push(&i.expr),
            CapexprNode::Stack(s) => out.extend(s.nodes.iter()),
        }
        out
    }

    /// Retrieves the type of the expression, which might be useful for
    /// type-checking or transformations.
    pub fn ty(&self) -> Option<ArrayTy> {
        match self.deref() {
            CapexprNode::Param(p) => Some(p.ty.clone()),
            CapexprNode::Constant(c) => Some(c.data.ty().clone()),
            CapexprNode::Rand(ty) => Some(ty.clone()),
            CapexprNode::Add(b)
            | CapexprNode::Sub(b)
            | CapexprNode::Mul(b)
            | CapexprNode::Div(b) => b.ty(),
            CapexprNode::Dot(b) => {
                let lhs = b.lhs.ty()?;
                let rhs = b.rhs.ty()?;
                if lhs.element_type != rhs.element_type {
                    return None;
                }
                let shape: SmallVec<[i64; 4]> = match (lhs.shape.as_slice(), rhs.shape.as_slice())
                {
                    ([m, k1], [k2, n]) if k1 == k2 => SmallVec::from_slice(&[*m, *n]),
                    _ => return None,
                };
                Some(ArrayTy::new(lhs.element_type, shape))
            }
            CapexprNode::Neg(e)
            | CapexprNode::Sin(e)
            | CapexprNode::Cos(e)
            | CapexprNode::Sqrt(e)
            | CapexprNode::Log(e)
            | CapexprNode::Exp(e) => e.ty(),
            CapexprNode::Transpose(e) => {
                let ty = e.ty()?;
                let [m, n] = ty.shape.as_slice() else {
                    return None;
                };
                Some(ArrayTy::new(ty.element_type, SmallVec::from_slice(&[*n, *m])))
            }
            CapexprNode::ReduceSum(e) => {
                let ty = e.ty()?;
                Some(ArrayTy::scalar(ty.element_type))
            }
            CapexprNode::Broadcast(b) => {
                let ty = b.expr.ty()?;
                if !ty.is_scalar() {
                    return None;
                }
                Some(ArrayTy::new(ty.element_type, b.shape.clone()))
            }
            CapexprNode::Index(i) => {
                let ty = i.expr.ty()?;
                let (&len, rest) = ty.shape.split_first()?;
                if i.index < 0 || i.index >= len {
                    return None;
                }
                Some(ArrayTy::new(ty.element_type, rest.iter().copied().collect()))
            }
            CapexprNode::Stack(s) => {
                let first = s.nodes.first()?.ty()?;
                for node in &s.nodes[1..] {
                    if node.ty()? != first {
                        return None;
                    }
                }
                let mut shape = SmallVec::with_capacity(first.shape.len() + 1);
                shape.push(s.nodes.len() as i64);
                shape.extend_from_slice(&first.shape);
                Some(ArrayTy::new(first.element_type, shape))
            }
        }
    }
}

impl Deref for Capexpr {
    type Target = CapexprNode;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl Neg for Capexpr {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::new(CapexprNode::Neg(self))
    }
}

macro_rules! impl_binary_op {
    ($trait:tt, $trait_fn:tt, $variant:tt) => {
        impl $trait for Capexpr {
            type Output = Capexpr;

            fn $trait_fn(self, rhs: Self) -> Self::Output {
                Capexpr::new(CapexprNode::$variant(BinaryOp { lhs: self, rhs }))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Mul, mul, Mul);
impl_binary_op!(Div, div, Div);
impl_binary_op!(Sub, sub, Sub);

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn param(shape: &[i64]) -> Capexpr {
        Capexpr::parameter(
            0,
            ArrayTy::new(ElementType::F32, shape.iter().copied().collect()),
            "p".to_string(),
        )
    }

    #[test]
    fn test_ids_are_unique() {
        let a = param(&[2]);
        let b = a.clone();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), param(&[2]).id());
    }

    #[test]
    fn test_binary_ty_scalar_broadcast() {
        let a = param(&[2, 3]);
        let s = Capexpr::scalar(2.0, ElementType::F32);
        let ty = (a * s).ty().unwrap();
        let expected: SmallVec<[i64; 4]> = smallvec![2, 3];
        assert_eq!(ty.shape, expected);
    }

    #[test]
    fn test_binary_ty_rejects_shape_mismatch() {
        let a = param(&[2, 3]);
        let b = param(&[3, 2]);
        assert!((a + b).ty().is_none());
    }

    #[test]
    fn test_dot_ty() {
        let a = param(&[2, 3]);
        let b = param(&[3, 4]);
        let ty = a.dot(&b).ty().unwrap();
        assert_eq!(ty.shape.as_slice(), &[2, 4]);
    }

    #[test]
    fn test_index_and_stack_ty() {
        let xs = param(&[3, 2]);
        let row = xs.clone().index(1);
        assert_eq!(row.ty().unwrap().shape.as_slice(), &[2]);
        assert!(xs.clone().index(3).ty().is_none());
        let stacked = Capexpr::stack(vec![row.clone(), row]);
        assert_eq!(stacked.ty().unwrap().shape.as_slice(), &[2, 2]);
    }
}
