//! Symbolic tracing of user combine functions.
//!
//! A [`TraceScope`] hands out placeholder values built from argument metadata
//! alone; running the user function against them records an expression graph
//! without touching real buffers. The scope doubles as the mutation and
//! purity guard: in-place writes to a placeholder and values smuggled in
//! from another trace both poison the scope, and [`TraceScope::finish`]
//! fails loudly instead of producing a silently wrong graph.
//!
//! Guard coverage is best effort: a concrete tensor lifted into a trace via
//! [`Traced::constant`] is baked in at its trace-time value, and later
//! mutation of the captured tensor goes unnoticed.
use std::{cell::RefCell, ops::{Add, AddAssign, Div, Mul, MulAssign, Sub, SubAssign}, rc::Rc, sync::Arc};

use crate::{
    ArgMeta, ArrayTy, Capexpr, ElementType, Error, Literal, PyTree, TreeSpec,
};

/// The combine function scanned over the sequence: `(carry, x)` to
/// `(new_carry, y)`, expressed on traced values.
pub type StepFn =
    dyn Fn(PyTree<Traced>, PyTree<Traced>) -> Result<(PyTree<Traced>, PyTree<Traced>), Error>;

#[derive(Clone, Default, Debug)]
pub struct TraceScope {
    state: Rc<RefCell<ScopeState>>,
}

#[derive(Default, Debug)]
struct ScopeState {
    params: Vec<Capexpr>,
    mutated: Vec<String>,
    foreign: Vec<String>,
}

impl TraceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a placeholder leaf. Only metadata crosses into the trace;
    /// no buffer is read and nothing moves between host and device.
    pub fn placeholder(
        &self,
        ty: ArrayTy,
        name: impl Into<String>,
        requires_grad: bool,
    ) -> Traced {
        let name = name.into();
        let mut state = self.state.borrow_mut();
        let number = state.params.len() as i64;
        let expr = Capexpr::parameter(number, ty, name.clone());
        state.params.push(expr.clone());
        Traced::new(TracedState {
            expr,
            scope: Some(self.clone()),
            origin: Origin::Placeholder,
            requires_grad,
            label: name,
        })
    }

    /// Placeholder tree mirroring the metadata tree, leaves named
    /// `{prefix}_{i}` in flattening order.
    pub fn placeholder_tree(&self, meta: &PyTree<ArgMeta>, prefix: &str) -> PyTree<Traced> {
        let mut i = 0;
        meta.map(|m| {
            let leaf = self.placeholder(m.ty.clone(), format!("{prefix}_{i}"), m.requires_grad);
            i += 1;
            leaf
        })
    }

    pub fn params(&self) -> Vec<Capexpr> {
        self.state.borrow().params.clone()
    }

    fn record_mutation(&self, label: &str) {
        self.state.borrow_mut().mutated.push(label.to_string());
    }

    fn mark_foreign(&self, label: &str) {
        self.state.borrow_mut().foreign.push(label.to_string());
    }

    fn same_scope(&self, other: &TraceScope) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Fails if the trace observed an in-place write to a placeholder or a
    /// value that belongs to a different trace.
    pub fn finish(&self) -> Result<(), Error> {
        let state = self.state.borrow();
        if let Some(label) = state.mutated.first() {
            return Err(Error::InPlaceOnScanInput(label.clone().into()));
        }
        if let Some(label) = state.foreign.first() {
            return Err(Error::StalePlaceholder(label.clone().into()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Origin {
    Placeholder,
    Local,
}

/// A symbolic tensor value observed by the user function during tracing.
#[derive(Clone)]
pub struct Traced {
    state: Rc<RefCell<TracedState>>,
}

struct TracedState {
    expr: Capexpr,
    scope: Option<TraceScope>,
    origin: Origin,
    requires_grad: bool,
    label: String,
}

impl Traced {
    fn new(state: TracedState) -> Self {
        Traced {
            state: Rc::new(RefCell::new(state)),
        }
    }

    fn local(scope: Option<TraceScope>, expr: Capexpr, requires_grad: bool) -> Self {
        Traced::new(TracedState {
            expr,
            scope,
            origin: Origin::Local,
            requires_grad,
            label: String::new(),
        })
    }

    /// Lifts a host literal into the trace as a constant.
    pub fn constant(literal: Literal) -> Self {
        Traced::local(None, Capexpr::constant(literal), false)
    }

    /// A fresh uniform draw per execution of the traced program.
    pub fn rand(ty: ArrayTy) -> Self {
        Traced::local(None, Capexpr::rand(ty), false)
    }

    pub fn expr(&self) -> Capexpr {
        self.state.borrow().expr.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.state.borrow().requires_grad
    }

    pub fn ty(&self) -> Option<ArrayTy> {
        self.state.borrow().expr.ty()
    }

    fn scope(&self) -> Option<TraceScope> {
        self.state.borrow().scope.clone()
    }

    pub(crate) fn in_scope(&self, scope: &TraceScope) -> bool {
        match self.scope() {
            Some(s) => s.same_scope(scope),
            None => true,
        }
    }

    pub(crate) fn label(&self) -> String {
        self.state.borrow().label.clone()
    }

    /// A value-level copy: mutating the copy in place never touches the
    /// original, so in-place updates on it are legal inside a scanned
    /// function.
    pub fn clone_value(&self) -> Traced {
        let state = self.state.borrow();
        Traced::local(state.scope.clone(), state.expr.clone(), state.requires_grad)
    }

    fn element_type(&self) -> ElementType {
        self.ty()
            .map(|ty| ty.element_type)
            .unwrap_or(ElementType::F64)
    }

    fn unary(&self, f: impl FnOnce(Capexpr) -> Capexpr) -> Traced {
        let state = self.state.borrow();
        Traced::local(state.scope.clone(), f(state.expr.clone()), state.requires_grad)
    }

    pub fn sin(&self) -> Traced {
        self.unary(Capexpr::sin)
    }

    pub fn cos(&self) -> Traced {
        self.unary(Capexpr::cos)
    }

    pub fn sqrt(&self) -> Traced {
        self.unary(Capexpr::sqrt)
    }

    pub fn log(&self) -> Traced {
        self.unary(Capexpr::log)
    }

    pub fn exp(&self) -> Traced {
        self.unary(Capexpr::exp)
    }

    pub fn neg(&self) -> Traced {
        self.unary(|e| -e)
    }

    /// Sums every element down to a scalar.
    pub fn sum(&self) -> Traced {
        self.unary(Capexpr::reduce_sum)
    }

    pub fn t(&self) -> Traced {
        self.unary(Capexpr::transpose)
    }

    pub fn sigmoid(&self) -> Traced {
        let one = Capexpr::scalar(1.0, self.element_type());
        self.unary(|e| one.clone() / (one + (-e).exp()))
    }

    pub fn index(&self, index: i64) -> Traced {
        self.unary(|e| e.index(index))
    }

    pub fn add_scalar(&self, value: f64) -> Traced {
        let c = Capexpr::scalar(value, self.element_type());
        self.unary(|e| e + c)
    }

    pub fn mul_scalar(&self, value: f64) -> Traced {
        let c = Capexpr::scalar(value, self.element_type());
        self.unary(|e| e * c)
    }

    pub fn matmul(&self, rhs: &Traced) -> Traced {
        binary(self, rhs, |l, r| l.dot(&r))
    }

    /// Stacks per-step values along a new leading dimension.
    pub fn stack(rows: &[Traced]) -> Traced {
        let scope = rows.iter().fold(None, |acc, row| match (acc, row.scope()) {
            (None, s) => s,
            (Some(a), Some(b)) => {
                if !a.same_scope(&b) {
                    a.mark_foreign(&row.label());
                    b.mark_foreign(&row.label());
                }
                Some(a)
            }
            (acc, None) => acc,
        });
        let exprs = rows.iter().map(|r| r.expr()).collect();
        let requires_grad = rows.iter().any(Traced::requires_grad);
        Traced::local(scope, Capexpr::stack(exprs), requires_grad)
    }

    fn assign_in_place(&mut self, rhs_expr: Capexpr, rhs_requires_grad: bool) {
        let mut state = self.state.borrow_mut();
        if state.origin == Origin::Placeholder {
            if let Some(scope) = &state.scope {
                scope.record_mutation(&state.label);
            }
        }
        state.expr = rhs_expr;
        state.requires_grad |= rhs_requires_grad;
    }
}

fn binary(lhs: &Traced, rhs: &Traced, f: impl FnOnce(Capexpr, Capexpr) -> Capexpr) -> Traced {
    let scope = match (lhs.scope(), rhs.scope()) {
        (Some(a), Some(b)) => {
            if !a.same_scope(&b) {
                a.mark_foreign(&rhs.label());
                b.mark_foreign(&rhs.label());
            }
            Some(a)
        }
        (Some(a), None) => Some(a),
        (None, b) => b,
    };
    let expr = f(lhs.expr(), rhs.expr());
    Traced::local(scope, expr, lhs.requires_grad() || rhs.requires_grad())
}

macro_rules! impl_traced_binary {
    ($trait:tt, $trait_fn:tt) => {
        impl $trait for &Traced {
            type Output = Traced;

            fn $trait_fn(self, rhs: Self) -> Self::Output {
                binary(self, rhs, |l, r| l.$trait_fn(r))
            }
        }
    };
}

impl_traced_binary!(Add, add);
impl_traced_binary!(Sub, sub);
impl_traced_binary!(Mul, mul);
impl_traced_binary!(Div, div);

macro_rules! impl_traced_assign {
    ($trait:tt, $trait_fn:tt, $op_fn:tt) => {
        impl $trait<&Traced> for Traced {
            fn $trait_fn(&mut self, rhs: &Traced) {
                let out = binary(self, rhs, |l, r| l.$op_fn(r));
                self.assign_in_place(out.expr(), rhs.requires_grad());
            }
        }
    };
}

impl_traced_assign!(AddAssign, add_assign, add);
impl_traced_assign!(SubAssign, sub_assign, sub);
impl_traced_assign!(MulAssign, mul_assign, mul);

impl Traced {
    /// In-place scalar add, the traced analogue of `add_(scalar)`.
    pub fn add_assign_scalar(&mut self, value: f64) {
        let out = self.add_scalar(value);
        self.assign_in_place(out.expr(), false);
    }
}

/// One recorded execution of a combine function against placeholders.
#[derive(Debug)]
pub struct TracedStep {
    pub scope: TraceScope,
    pub carry_params: Vec<Capexpr>,
    pub x_params: Vec<Capexpr>,
    pub carry_rg: Vec<bool>,
    pub x_rg: Vec<bool>,
    pub carry_tys: Vec<ArrayTy>,
    pub x_tys: Vec<ArrayTy>,
    pub y_tys: Vec<ArrayTy>,
    pub new_carry: Vec<Capexpr>,
    pub y: Vec<Capexpr>,
    pub carry_spec: TreeSpec,
    pub x_spec: TreeSpec,
    pub y_spec: TreeSpec,
}

/// Runs the combine function once against fresh placeholders and validates
/// the recorded graph.
pub fn trace_step(
    step: &Arc<StepFn>,
    init: &PyTree<ArgMeta>,
    x: &PyTree<ArgMeta>,
) -> Result<TracedStep, Error> {
    let scope = TraceScope::new();
    let carry_tree = scope.placeholder_tree(init, "carry");
    let x_tree = scope.placeholder_tree(x, "x");
    let n_carry = carry_tree.leaves().len();

    let (new_carry_tree, y_tree) = step(carry_tree.clone(), x_tree.clone())?;
    scope.finish()?;

    for leaf in new_carry_tree.leaves().into_iter().chain(y_tree.leaves()) {
        if !leaf.in_scope(&scope) {
            return Err(Error::StalePlaceholder(leaf.label().into()));
        }
    }

    let carry_spec = carry_tree.spec();
    let new_carry_spec = new_carry_tree.spec();
    if new_carry_spec != carry_spec {
        return Err(Error::CarryStructureMismatch);
    }
    let carry_tys: Vec<ArrayTy> = init.leaves().iter().map(|m| m.ty.clone()).collect();
    let new_carry: Vec<Capexpr> = new_carry_tree.leaves().iter().map(|t| t.expr()).collect();
    for (expr, ty) in new_carry.iter().zip(&carry_tys) {
        let out_ty = expr
            .ty()
            .ok_or_else(|| Error::UntypedExpression(expr.name().into()))?;
        if out_ty != *ty {
            return Err(Error::CarryStructureMismatch);
        }
    }

    let y: Vec<Capexpr> = y_tree.leaves().iter().map(|t| t.expr()).collect();
    let y_tys = y
        .iter()
        .map(|expr| {
            expr.ty()
                .ok_or_else(|| Error::UntypedExpression(expr.name().into()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let params = scope.params();
    let (carry_params, x_params) = params.split_at(n_carry);
    Ok(TracedStep {
        carry_params: carry_params.to_vec(),
        x_params: x_params.to_vec(),
        carry_rg: init.leaves().iter().map(|m| m.requires_grad).collect(),
        x_rg: x.leaves().iter().map(|m| m.requires_grad).collect(),
        carry_tys,
        x_tys: x.leaves().iter().map(|m| m.ty.clone()).collect(),
        y_tys,
        new_carry,
        y,
        carry_spec,
        x_spec: x_tree.spec(),
        y_spec: y_tree.spec(),
        scope,
    })
}
