use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use approx::assert_relative_eq;

use crate::*;

fn client() -> Client {
    Client::cpu().unwrap()
}

fn ctx() -> ScanContext {
    ScanContext::new(client())
}

fn t_f32(client: &Client, shape: &[i64], values: &[f32], requires_grad: bool) -> Tensor {
    let literal = Literal::f32(shape, values.to_vec()).unwrap();
    Tensor::from_literal(client, &literal, requires_grad)
}

fn t_f64(client: &Client, shape: &[i64], values: &[f64], requires_grad: bool) -> Tensor {
    let literal = Literal::f64(shape, values.to_vec()).unwrap();
    Tensor::from_literal(client, &literal, requires_grad)
}

fn host(client: &Client, buffer: &Buffer) -> Vec<f64> {
    client.to_host(buffer).data().to_f64_vec()
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len(), "value lengths differ");
    for (x, y) in a.iter().zip(b) {
        assert_relative_eq!(*x, *y, epsilon = 1e-4, max_relative = 1e-4);
    }
}

fn leaf(tree: &PyTree<Traced>) -> Result<&Traced, Error> {
    tree.as_leaf().ok_or(Error::TreeStructureMismatch)
}

/// Reference values computed from the unrolled graph: the step function is
/// applied once per row with explicit indexing, outputs stacked, and the
/// whole thing differentiated in one piece.
struct Reference {
    final_carry: Vec<Vec<f64>>,
    ys: Vec<Vec<f64>>,
    grad_init: Vec<Option<Vec<f64>>>,
    grad_xs: Vec<Option<Vec<f64>>>,
}

fn reference_scan(
    client: &Client,
    step: &Arc<StepFn>,
    init: &PyTree<Tensor>,
    xs: &PyTree<Tensor>,
) -> Reference {
    let scope = TraceScope::new();
    let init_ph = scope.placeholder_tree(&init.map(Tensor::meta), "init");
    let xs_ph = scope.placeholder_tree(&xs.map(Tensor::meta), "xs");
    let n = xs.leaves()[0].ty().shape[0];

    let mut carry = init_ph;
    let mut ys_steps = Vec::new();
    for i in 0..n {
        let x_i = xs_ph.map(|t| t.index(i));
        let (new_carry, y) = step(carry, x_i).unwrap();
        carry = new_carry;
        ys_steps.push(y);
    }
    scope.finish().unwrap();

    let n_y = ys_steps[0].leaves().len();
    let stacked_ys: Vec<Capexpr> = (0..n_y)
        .map(|j| {
            let rows: Vec<Traced> = ys_steps.iter().map(|t| t.leaves()[j].clone()).collect();
            Traced::stack(&rows).expr()
        })
        .collect();
    let carry_exprs: Vec<Capexpr> = carry.leaves().iter().map(|t| t.expr()).collect();
    let outputs: Vec<Capexpr> = carry_exprs.iter().chain(stacked_ys.iter()).cloned().collect();
    let params = scope.params();
    let args: Vec<Buffer> = init
        .leaves()
        .iter()
        .chain(xs.leaves().iter())
        .map(|t| t.buffer.clone())
        .collect();

    let forward = Program::compile(params.clone(), outputs.clone()).unwrap();
    let values = forward.run(client, &args).unwrap();
    let (carry_vals, y_vals) = values.split_at(carry_exprs.len());

    let seeds: Vec<Capexpr> = outputs
        .iter()
        .map(|o| Capexpr::constant(Literal::full(o.ty().unwrap(), 1.0)))
        .collect();
    let grads = grad(&outputs, &seeds, &params).unwrap();
    let present: Vec<Capexpr> = grads.iter().flatten().cloned().collect();
    let grad_program = Program::compile(params, present).unwrap();
    let mut grad_vals = grad_program.run(client, &args).unwrap().into_iter();
    let rg: Vec<bool> = init
        .leaves()
        .iter()
        .chain(xs.leaves().iter())
        .map(|t| t.requires_grad)
        .collect();
    let all: Vec<Option<Vec<f64>>> = grads
        .iter()
        .zip(&rg)
        .map(|(g, rg)| {
            let value = g.as_ref().map(|_| host(client, &grad_vals.next().unwrap()));
            if *rg { value } else { None }
        })
        .collect();
    let n_init = init.leaves().len();

    Reference {
        final_carry: carry_vals.iter().map(|b| host(client, b)).collect(),
        ys: y_vals.iter().map(|b| host(client, b)).collect(),
        grad_init: all[..n_init].to_vec(),
        grad_xs: all[n_init..].to_vec(),
    }
}

fn assert_tree_close(client: &Client, tree: &PyTree<Tensor>, expected: &[Vec<f64>]) {
    let leaves = tree.leaves();
    assert_eq!(leaves.len(), expected.len(), "leaf counts differ");
    for (leaf, want) in leaves.iter().zip(expected) {
        assert_close(&host(client, &leaf.buffer), want);
    }
}

fn assert_grads_close(
    client: &Client,
    got: &PyTree<Option<Buffer>>,
    expected: &[Option<Vec<f64>>],
) {
    let leaves = got.leaves();
    assert_eq!(leaves.len(), expected.len(), "gradient leaf counts differ");
    for (leaf, want) in leaves.iter().zip(expected) {
        match (leaf, want) {
            (None, None) => {}
            (Some(buf), Some(want)) => assert_close(&host(client, buf), want),
            (Some(buf), None) => {
                // a disconnected input comes back as an explicit zero
                let vals = host(client, buf);
                assert_close(&vals, &vec![0.0; vals.len()]);
            }
            (None, Some(_)) => panic!("missing gradient for a leaf that requires one"),
        }
    }
}

/// Runs the fused scan and compares values and gradients against the
/// unrolled reference, seeding the backward pass with ones everywhere.
fn run_test(
    ctx: &ScanContext,
    step: &Arc<StepFn>,
    init: &PyTree<Tensor>,
    xs: &PyTree<Tensor>,
    policy: &Arc<dyn PartitionPolicy>,
    is_fn_pure: bool,
) -> (PyTree<Tensor>, PyTree<Tensor>) {
    let out = ctx.scan(step, init, xs, policy, is_fn_pure).unwrap();
    let reference = reference_scan(ctx.client(), step, init, xs);
    assert_tree_close(ctx.client(), &out.final_carry, &reference.final_carry);
    assert_tree_close(ctx.client(), &out.ys, &reference.ys);

    if let Some(backward) = out.backward {
        let seed_carry = out.final_carry.map(|t| Buffer::full(t.ty().clone(), 1.0));
        let seed_ys = out.ys.map(|t| Buffer::full(t.ty().clone(), 1.0));
        let (grad_init, grad_xs) = backward.run(Some(&seed_carry), Some(&seed_ys)).unwrap();
        assert_grads_close(ctx.client(), &grad_init, &reference.grad_init);
        assert_grads_close(ctx.client(), &grad_xs, &reference.grad_xs);
    }
    (out.final_carry, out.ys)
}

fn cumsum_step() -> Arc<StepFn> {
    Arc::new(|carry, x| {
        let new_carry = leaf(&carry)? + leaf(&x)?;
        Ok((
            PyTree::Leaf(new_carry.clone()),
            PyTree::Leaf(new_carry),
        ))
    })
}

#[test]
fn test_scan_simple() {
    // scan as cumulative sum
    for is_fn_pure in [true, false] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
        let xs = PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        ));
        let (final_carry, ys) = run_test(
            &ctx,
            &cumsum_step(),
            &init,
            &xs,
            &default_partition(),
            is_fn_pure,
        );
        assert_tree_close(&client, &final_carry, &[vec![9.0, 12.0]]);
        assert_tree_close(&client, &ys, &[vec![1.0, 2.0, 4.0, 6.0, 9.0, 12.0]]);
    }
}

#[test]
fn test_scan_incompatible_length() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let calls = Rc::new(Cell::new(0usize));
    let counted = calls.clone();
    let step: Arc<StepFn> = Arc::new(move |carry, x| {
        counted.set(counted.get() + 1);
        Ok((carry, x))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[1.0, 1.0], false));
    let xs = PyTree::list(vec![
        PyTree::Leaf(t_f32(&client, &[3, 2], &[1.0; 6], false)),
        PyTree::Leaf(t_f32(&client, &[2, 2], &[1.0; 4], false)),
    ]);
    let err = ctx
        .scan(&step, &init, &xs, &default_partition(), false)
        .unwrap_err();
    assert!(matches!(err, Error::ScanShapeMismatch));
    // rejected before any tracing
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_scan_no_steps() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], false));
    let empty_xs: PyTree<Tensor> = PyTree::List(vec![]);
    assert!(matches!(
        ctx.scan(&cumsum_step(), &init, &empty_xs, &default_partition(), false),
        Err(Error::ScanMissingArg)
    ));
    let scalar_xs = PyTree::Leaf(t_f32(&client, &[], &[1.0], false));
    assert!(matches!(
        ctx.scan(&cumsum_step(), &init, &scalar_xs, &default_partition(), false),
        Err(Error::ScanArgRankZero)
    ));
}

#[test]
fn test_scan_tuples() {
    for is_fn_pure in [true, false] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let step: Arc<StepFn> = Arc::new(|carry, x| {
            let carries = carry.as_list().ok_or(Error::TreeStructureMismatch)?;
            let inputs = x.as_list().ok_or(Error::TreeStructureMismatch)?;
            let (c1, c2) = (leaf(&carries[0])?, leaf(&carries[1])?);
            let (x1, x2) = (leaf(&inputs[0])?, leaf(&inputs[1])?);
            let new_c1 = c1 + &x1.sum();
            let new_c2 = c2 + &x2.sum();
            let y1 = &x1.mul_scalar(2.0) + &new_c1.sum();
            let y2 = &x2.mul_scalar(2.0) + &new_c2.sum();
            Ok((
                PyTree::list(vec![PyTree::Leaf(new_c1), PyTree::Leaf(new_c2)]),
                PyTree::list(vec![PyTree::Leaf(y1), PyTree::Leaf(y2)]),
            ))
        });
        let init = PyTree::list(vec![
            PyTree::Leaf(t_f32(&client, &[1], &[0.0], true)),
            PyTree::Leaf(t_f32(&client, &[2], &[1.0, 2.0], true)),
        ]);
        let xs = PyTree::list(vec![
            PyTree::Leaf(t_f32(&client, &[2, 2], &[1.0, 2.0, 3.0, 4.0], true)),
            PyTree::Leaf(t_f32(
                &client,
                &[2, 3],
                &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
                true,
            )),
        ]);
        run_test(&ctx, &step, &init, &xs, &default_partition(), is_fn_pure);
    }
}

#[test]
fn test_scan_create_tensors() {
    for is_fn_pure in [true, false] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let step: Arc<StepFn> = Arc::new(|carry, x| {
            let a = Traced::constant(Literal::f32(&[2], vec![1.0, 2.0]).unwrap());
            let b = Traced::constant(Literal::f32(&[2], vec![3.0, 4.0]).unwrap());
            Ok((
                PyTree::Leaf(leaf(&carry)? + &a),
                PyTree::Leaf(leaf(&x)? + &b),
            ))
        });
        let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
        let xs = PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        ));
        run_test(&ctx, &step, &init, &xs, &default_partition(), is_fn_pure);
    }
}

#[test]
fn test_scan_no_transfers() {
    // tracing and running scan on device-resident inputs must not move
    // anything between host and device
    let ctx = ctx();
    let client = ctx.client().clone();
    let sin_step: Arc<StepFn> = Arc::new(|carry, x| {
        Ok((
            PyTree::Leaf(leaf(&carry)?.sin()),
            PyTree::Leaf(leaf(&x)?.sin()),
        ))
    });
    let aliasing_step: Arc<StepFn> = Arc::new(|carry, x| Ok((carry, x)));
    for step in [sin_step, aliasing_step] {
        let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
        let xs = PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        ));
        let to_device = client.transfers_to_device();
        let from_device = client.transfers_from_device();
        let out = ctx.scan(&step, &init, &xs, &default_partition(), false).unwrap();
        let seed_carry = out.final_carry.map(|t| Buffer::full(t.ty().clone(), 1.0));
        let seed_ys = out.ys.map(|t| Buffer::full(t.ty().clone(), 1.0));
        out.backward
            .unwrap()
            .run(Some(&seed_carry), Some(&seed_ys))
            .unwrap();
        assert_eq!(client.transfers_to_device(), to_device);
        assert_eq!(client.transfers_from_device(), from_device);
    }
}

#[test]
fn test_scan_internal_in_place_mutation() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let x = leaf(&x)?;
        let mut new_carry = leaf(&carry)?.clone_value();
        new_carry += x;
        let mut y = x.clone_value();
        y.add_assign_scalar(42.0);
        Ok((PyTree::Leaf(new_carry), PyTree::Leaf(y)))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        true,
    ));
    run_test(&ctx, &step, &init, &xs, &default_partition(), false);
}

#[test]
fn test_scan_input_in_place_mutation() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let carry = leaf(&carry)?;
        let mut x_leaf = leaf(&x)?.clone();
        x_leaf += carry;
        Ok((
            PyTree::Leaf(carry.clone_value()),
            PyTree::Leaf(x_leaf),
        ))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        true,
    ));
    let err = ctx
        .scan(&step, &init, &xs, &default_partition(), false)
        .unwrap_err();
    assert!(err.to_string().contains("in-place operation"));
}

#[test]
fn test_scan_external_mutation_of_captured_placeholder() {
    // state captured from outside the trace must fail loudly instead of
    // being silently baked into the computation
    let ctx = ctx();
    let client = ctx.client().clone();
    let other = TraceScope::new();
    let weird = other.placeholder(
        ArrayTy::new(ElementType::F32, [2].into_iter().collect()),
        "weird",
        false,
    );
    let step: Arc<StepFn> = Arc::new(move |carry, x| {
        let new_carry = leaf(&carry)? + leaf(&x)?;
        let y = &new_carry + &weird;
        Ok((PyTree::Leaf(new_carry), PyTree::Leaf(y)))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], false));
    let xs = PyTree::Leaf(t_f32(&client, &[3, 2], &[0.0; 6], false));
    let err = ctx
        .scan(&step, &init, &xs, &default_partition(), false)
        .unwrap_err();
    assert!(matches!(err, Error::StalePlaceholder(_)));
}

#[test]
fn test_scan_input_output_aliases_carry() {
    for is_fn_pure in [true, false] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let step: Arc<StepFn> = Arc::new(|carry, x| {
            let y = leaf(&x)?.add_scalar(1.0);
            Ok((carry, PyTree::Leaf(y)))
        });
        let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
        let xs = PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        ));
        run_test(&ctx, &step, &init, &xs, &default_partition(), is_fn_pure);
    }
}

#[test]
fn test_scan_input_output_aliases_x() {
    for is_fn_pure in [true, false] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let step: Arc<StepFn> = Arc::new(|carry, x| {
            let new_carry = leaf(&carry)?.add_scalar(1.0);
            Ok((PyTree::Leaf(new_carry), x))
        });
        let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
        let xs = PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        ));
        run_test(&ctx, &step, &init, &xs, &default_partition(), is_fn_pure);
    }
}

#[test]
fn test_scan_gradness() {
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = leaf(&carry)? * leaf(&x)?;
        let y = &new_carry + leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), PyTree::Leaf(y)))
    });
    for (init_rg, xs_rg) in [(true, true), (true, false), (false, true)] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let init = PyTree::Leaf(t_f32(&client, &[2], &[1.0, 1.0], init_rg));
        let xs = PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            xs_rg,
        ));
        run_test(&ctx, &step, &init, &xs, &default_partition(), false);
    }
}

#[test]
fn test_scan_output_absent() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = &leaf(&carry)?.cos() + leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), PyTree::Absent))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[1.0, 1.0], true));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
        true,
    ));
    let (_final_carry, ys) = run_test(&ctx, &step, &init, &xs, &default_partition(), false);
    // a single absent output, never a sequence of absents
    assert_eq!(ys, PyTree::Absent);
}

#[test]
fn test_scan_output_unit() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = &leaf(&carry)?.cos() + leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), PyTree::List(vec![])))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[1.0, 1.0], true));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
        true,
    ));
    let (_final_carry, ys) = run_test(&ctx, &step, &init, &xs, &default_partition(), false);
    assert_eq!(ys, PyTree::List(vec![]));
}

#[test]
fn test_scan_rand_in_fn() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = leaf(&carry)? + leaf(&x)?;
        let noise = Traced::rand(ArrayTy::new(ElementType::F32, [2].into_iter().collect()));
        let y = &new_carry + &noise;
        Ok((PyTree::Leaf(new_carry), PyTree::Leaf(y)))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], false));
    let xs = PyTree::Leaf(t_f32(&client, &[3, 2], &[0.0; 6], false));
    let out = ctx.scan(&step, &init, &xs, &default_partition(), false).unwrap();
    assert!(out.backward.is_none());
    let ys = out.ys.as_leaf().unwrap();
    assert_eq!(ys.ty().shape.as_slice(), &[3, 2]);
    // the random state advances between steps, so identical inputs still
    // draw different values
    let values = host(&client, &ys.buffer);
    assert_ne!(values[0], values[2]);
    assert_ne!(values[1], values[3]);
    assert_ne!(values[2], values[4]);
}

fn sin_chain_step() -> Arc<StepFn> {
    Arc::new(|carry, x| {
        let mut carry = leaf(&carry)?.clone_value();
        let mut x = leaf(&x)?.clone_value();
        for _ in 0..10 {
            carry = carry.sin();
        }
        for _ in 0..10 {
            x = x.sin();
        }
        Ok((PyTree::Leaf(carry), PyTree::Leaf(x)))
    })
}

fn pseudo_values(len: usize, scale: f64) -> Vec<f32> {
    (0..len).map(|i| ((i as f64) * scale).sin() as f32).collect()
}

#[test]
fn test_scan_with_rematerialization() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let init_vals = pseudo_values(16, 0.37);
    let xs_vals = pseudo_values(20 * 16, 0.11);

    let make_args = || {
        (
            PyTree::Leaf(t_f32(&client, &[4, 4], &init_vals, true)),
            PyTree::Leaf(t_f32(&client, &[20, 4, 4], &xs_vals, true)),
        )
    };
    let step = sin_chain_step();

    let (init, xs) = make_args();
    run_test(&ctx, &step, &init, &xs, &remat_partition(), false);
    let (init, xs) = make_args();
    let (carry_default, ys_default) =
        run_test(&ctx, &step, &init, &xs, &default_partition(), false);
    let (init, xs) = make_args();
    let out_remat = ctx.scan(&step, &init, &xs, &remat_partition(), false).unwrap();
    let default_vals: Vec<Vec<f64>> = carry_default
        .leaves()
        .iter()
        .chain(ys_default.leaves().iter())
        .map(|t| host(&client, &t.buffer))
        .collect();
    assert_tree_close(&client, &out_remat.final_carry, &default_vals[..1]);
    assert_tree_close(&client, &out_remat.ys, &default_vals[1..]);

    // the rematerializing policy re-executes forward ops in the backward
    // program; the default policy never does
    let init_meta = init.map(Tensor::meta);
    let x_meta = PyTree::Leaf(ArgMeta {
        ty: ArrayTy::new(ElementType::F32, [4, 4].into_iter().collect()),
        requires_grad: true,
    });
    let default_comp =
        trace_and_partition(&step, &init_meta, &x_meta, &default_partition()).unwrap();
    let remat_comp = trace_and_partition(&step, &init_meta, &x_meta, &remat_partition()).unwrap();
    assert_eq!(default_comp.backward.op_count("Sin"), 0);
    assert!(remat_comp.backward.op_count("Sin") > 10);
}

#[test]
fn test_scan_different_dtypes() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let inputs = x.as_list().ok_or(Error::TreeStructureMismatch)?;
        let y = PyTree::list(vec![
            PyTree::Leaf(leaf(&inputs[0])?.sin()),
            PyTree::Leaf(leaf(&inputs[1])?.sin()),
        ]);
        Ok((PyTree::Leaf(leaf(&carry)?.sin()), y))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], true));
    let xs = PyTree::list(vec![
        PyTree::Leaf(t_f32(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        )),
        PyTree::Leaf(t_f64(
            &client,
            &[3, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            true,
        )),
    ]);
    let (final_carry, ys) = run_test(&ctx, &step, &init, &xs, &default_partition(), false);
    assert_eq!(
        final_carry.as_leaf().unwrap().ty().element_type,
        ElementType::F32
    );
    let y_leaves = ys.leaves();
    assert_eq!(y_leaves[0].ty().element_type, ElementType::F32);
    assert_eq!(y_leaves[1].ty().element_type, ElementType::F64);
}

#[test]
fn test_scan_activation_aliases_input() {
    // when an activation is the step input itself, it is re-attached from
    // the concrete slice instead of being materialized by the forward pass
    for is_fn_pure in [true, false] {
        let ctx = ctx();
        let client = ctx.client().clone();
        let step: Arc<StepFn> = Arc::new(|carry, x| {
            Ok((carry, PyTree::Leaf(leaf(&x)?.sin())))
        });
        let init = PyTree::Leaf(t_f32(&client, &[4, 4], &pseudo_values(16, 0.29), true));
        let xs = PyTree::Leaf(t_f32(&client, &[20, 4, 4], &pseudo_values(320, 0.13), true));
        run_test(&ctx, &step, &init, &xs, &default_partition(), is_fn_pure);

        let comp = trace_and_partition(
            &step,
            &init.map(Tensor::meta),
            &PyTree::Leaf(ArgMeta {
                ty: ArrayTy::new(ElementType::F32, [4, 4].into_iter().collect()),
                requires_grad: true,
            }),
            &default_partition(),
        )
        .unwrap();
        assert!(comp.alias.slots().contains(&ActivationSlot::XLeaf(0)));
        // the aliased slot is not among the forward outputs
        let materialized = comp.forward.outputs().len() - comp.meta.n_carry - comp.meta.n_y;
        assert_eq!(materialized, comp.alias.len() - comp.alias.aliased_count());
    }
}

#[test]
fn test_scan_computation_cache() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let calls = Rc::new(Cell::new(0usize));
    let counted = calls.clone();
    let step: Arc<StepFn> = Arc::new(move |carry, x| {
        counted.set(counted.get() + 1);
        let new_carry = leaf(&carry)? + leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), x))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], false));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        true,
    ));
    for _ in 0..10 {
        ctx.scan(&step, &init, &xs, &default_partition(), true).unwrap();
    }
    assert!(ctx.cache_contains(&step));
    assert_eq!(ctx.cached_policy_count(&step), 1);
    // one structure trace plus one joint trace, regardless of call count
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_scan_computation_cache_by_fn_and_partition_fn() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step1: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = leaf(&carry)? + leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), x))
    });
    let step2: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = leaf(&carry)? * leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), x))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], false));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        true,
    ));
    ctx.scan(&step1, &init, &xs, &default_partition(), true).unwrap();
    ctx.scan(&step2, &init, &xs, &default_partition(), true).unwrap();
    assert!(ctx.cache_contains(&step1));
    assert!(ctx.cache_contains(&step2));
    assert_eq!(ctx.cached_fn_count(), 2);
    assert_eq!(ctx.cached_policy_count(&step1), 1);
    assert_eq!(ctx.cached_policy_count(&step2), 1);

    // a different policy gets its own second-level entry
    ctx.scan(&step1, &init, &xs, &remat_partition(), true).unwrap();
    assert_eq!(ctx.cached_policy_count(&step1), 2);

    ctx.clear_cache();
    assert_eq!(ctx.cached_fn_count(), 0);
}

#[test]
fn test_scan_computation_cache_disabled_when_fn_is_not_pure() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let calls = Rc::new(Cell::new(0usize));
    let counted = calls.clone();
    let step: Arc<StepFn> = Arc::new(move |carry, x| {
        counted.set(counted.get() + 1);
        let new_carry = leaf(&carry)? + leaf(&x)?;
        Ok((PyTree::Leaf(new_carry), x))
    });
    let init = PyTree::Leaf(t_f32(&client, &[2], &[0.0, 0.0], false));
    let xs = PyTree::Leaf(t_f32(
        &client,
        &[3, 2],
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        true,
    ));
    ctx.scan(&step, &init, &xs, &default_partition(), false).unwrap();
    ctx.scan(&step, &init, &xs, &default_partition(), false).unwrap();
    assert!(!ctx.cache_contains(&step));
    assert_eq!(ctx.cached_fn_count(), 0);
    // every call re-traces
    assert_eq!(calls.get(), 4);
}

fn matmul2(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for r in 0..m {
        for c in 0..n {
            for i in 0..k {
                out[r * n + c] += a[r * k + i] * b[i * n + c];
            }
        }
    }
    out
}

fn transpose2(a: &[f64], m: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for r in 0..m {
        for c in 0..n {
            out[c * m + r] = a[r * n + c];
        }
    }
    out
}

#[test]
fn test_transform_linear_layer() {
    let client = client();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let new_carry = leaf(&carry)?.matmul(leaf(&x)?);
        Ok((
            PyTree::Leaf(new_carry.clone()),
            PyTree::Leaf(new_carry),
        ))
    });
    let init_vals = vec![1.0, 2.0, 3.0, 4.0];
    let x0_vals = vec![1.0, 2.0, 3.0, 4.0];
    let meta = PyTree::Leaf(ArgMeta {
        ty: ArrayTy::new(ElementType::F64, [2, 2].into_iter().collect()),
        requires_grad: true,
    });
    let comp = trace_and_partition(&step, &meta, &meta, &default_partition()).unwrap();

    let init_buf = Buffer::from_parts(
        ArrayTy::new(ElementType::F64, [2, 2].into_iter().collect()),
        Data::F64(init_vals.clone()),
    );
    let x0_buf = Buffer::from_parts(
        ArrayTy::new(ElementType::F64, [2, 2].into_iter().collect()),
        Data::F64(x0_vals.clone()),
    );
    let outs = comp
        .forward
        .run(&client, &[init_buf.clone(), x0_buf.clone()])
        .unwrap();
    let expected_carry = matmul2(&init_vals, &x0_vals, 2, 2, 2);
    assert_close(&host(&client, &outs[0]), &expected_carry);
    assert_close(&host(&client, &outs[1]), &expected_carry);

    // the intermediate activations are exactly the two primal inputs, with
    // the x slice re-attached rather than stored
    let activations = comp
        .alias
        .resolve(&outs[comp.meta.n_carry + comp.meta.n_y..], &[x0_buf.clone()])
        .unwrap();
    assert_eq!(activations.len(), 2);
    let values: Vec<Vec<f64>> = activations.iter().map(|b| host(&client, b)).collect();
    assert!(values.contains(&init_vals));
    assert!(values.contains(&x0_vals));
    assert_eq!(comp.alias.aliased_count(), 1);

    // backward with ones seeds: grad_carry = (g_c + g_y) Xᵀ, grad_x = Cᵀ (g_c + g_y)
    let ones = Buffer::full(ArrayTy::new(ElementType::F64, [2, 2].into_iter().collect()), 1.0);
    let mut args = vec![ones.clone(), ones];
    args.extend(activations);
    let grads = comp.backward.run(&client, &args).unwrap();
    let twos = vec![2.0; 4];
    let expected_grad_carry = matmul2(&twos, &transpose2(&x0_vals, 2, 2), 2, 2, 2);
    let expected_grad_x = matmul2(&transpose2(&init_vals, 2, 2), &twos, 2, 2, 2);
    assert_close(&host(&client, &grads[0]), &expected_grad_carry);
    assert_close(&host(&client, &grads[1]), &expected_grad_x);
}

#[test]
fn test_scan_non_trivial_pytree() {
    let ctx = ctx();
    let client = ctx.client().clone();
    let step: Arc<StepFn> = Arc::new(|carry, x| {
        let a = leaf(carry.get("a").ok_or(Error::TreeStructureMismatch)?)?;
        let b = leaf(carry.get("b").ok_or(Error::TreeStructureMismatch)?)?;
        let weights = leaf(x.get("weights").ok_or(Error::TreeStructureMismatch)?)?;
        let biases = leaf(x.get("biases").ok_or(Error::TreeStructureMismatch)?)?;
        let new_a = (&a.matmul(weights) + biases).sin();
        let new_b = (&b.matmul(weights) + biases).cos();
        let y = (&new_a + &new_b).sigmoid();
        Ok((
            PyTree::dict([("a", PyTree::Leaf(new_a)), ("b", PyTree::Leaf(new_b))]),
            PyTree::Leaf(y),
        ))
    });
    let init = PyTree::dict([
        (
            "a",
            PyTree::Leaf(t_f64(
                &client,
                &[2, 3],
                &pseudo_values(6, 0.7).iter().map(|v| *v as f64).collect::<Vec<_>>(),
                true,
            )),
        ),
        (
            "b",
            PyTree::Leaf(t_f64(
                &client,
                &[2, 3],
                &pseudo_values(6, 1.3).iter().map(|v| *v as f64).collect::<Vec<_>>(),
                true,
            )),
        ),
    ]);
    let xs = PyTree::dict([
        (
            "weights",
            PyTree::Leaf(t_f64(
                &client,
                &[2, 3, 3],
                &pseudo_values(18, 0.9).iter().map(|v| *v as f64).collect::<Vec<_>>(),
                true,
            )),
        ),
        (
            "biases",
            PyTree::Leaf(t_f64(
                &client,
                &[2, 2, 3],
                &pseudo_values(12, 1.1).iter().map(|v| *v as f64).collect::<Vec<_>>(),
                true,
            )),
        ),
    ]);
    run_test(&ctx, &step, &init, &xs, &default_partition(), false);
}
