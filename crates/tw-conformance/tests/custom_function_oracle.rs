#![forbid(unsafe_code)]

//! Custom derivative and batching rule oracles: installed rules take
//! precedence over the engine, cleared rules hand control back, and the
//! argument restrictions of the rule paths hold.

use std::sync::{Arc, Mutex};

use tw_api::{
    ApiError, AxisSpec, CallArgs, CustomFunction, Gradients, Tree, VmapAxes, grad, jvp,
    value_and_grad, vjp, vmap,
};
use tw_backend_cpu::{DenseTensor, ops};
use tw_conformance::{
    FixtureFamily, GRAD_TOLERANCE, OracleFixture, all_leaf_values, arg_tensor, assert_close,
    engine, leaf_values, scalar_leaf, vec_leaf,
};
use tw_core::{ErrorKind, TreeError};
use tw_test_utils::{TestLogV1, TestMode, TestResult, fixture_id_from_json, test_id};

fn log_oracle(name: &str, fixture: &impl serde::Serialize) {
    let fid = fixture_id_from_json(fixture).expect("fixture digest");
    let log = TestLogV1::unit(
        test_id(module_path!(), name),
        fid,
        TestMode::Strict,
        TestResult::Pass,
    );
    assert_eq!(log.schema_version, tw_test_utils::TEST_LOG_SCHEMA_VERSION);
}

fn custom_square() -> CustomFunction<DenseTensor> {
    CustomFunction::new(|args: &CallArgs<DenseTensor>| {
        Ok(Tree::leaf(ops::square(arg_tensor(args, 0)?)))
    })
}

/// `x * y` over two positional tensors.
fn custom_product() -> CustomFunction<DenseTensor> {
    CustomFunction::new(|args: &CallArgs<DenseTensor>| {
        Ok(Tree::leaf(ops::mul(arg_tensor(args, 0)?, arg_tensor(args, 1)?)?))
    })
}

fn positional_values(grads: &Gradients<DenseTensor>) -> Vec<f64> {
    grads
        .positional()
        .and_then(leaf_values)
        .expect("bare positional gradient")
}

// ── Oracle: vjp precedence ─────────────────────────────────────────

#[test]
fn oracle_custom_vjp_overrides_and_clears() {
    let square = custom_square();
    // Deliberately not the true derivative, so the source of the result is visible.
    square.set_vjp(|_primals, cotangents, _outputs| {
        Ok(cotangents.iter().map(|c| ops::scale(c, 3.0)).collect())
    });
    let wrapped = grad(engine(), &square);
    let call = CallArgs::new(vec![scalar_leaf(5.0)]);

    let overridden = wrapped.call(&call).expect("custom grad");
    assert_close(&positional_values(&overridden), &[3.0], 0.0);

    square.clear_vjp();
    assert!(!square.has_custom_vjp());
    let native = wrapped.call(&call).expect("engine grad");
    assert_close(&positional_values(&native), &[10.0], GRAD_TOLERANCE);

    let fixture = OracleFixture::new(FixtureFamily::Custom, "vjp_precedence").with_input(&[5.0]);
    log_oracle("oracle_custom_vjp_overrides_and_clears", &fixture);
}

#[test]
fn oracle_custom_vjp_receives_outputs_and_ones() {
    let product = custom_product();
    let seen: Arc<Mutex<Vec<Vec<f64>>>> = Arc::default();
    let record = Arc::clone(&seen);
    product.set_vjp(move |primals, cotangents, outputs| {
        let mut seen = record.lock().expect("record lock");
        seen.extend(cotangents.iter().map(|c| c.data().to_vec()));
        seen.extend(outputs.iter().map(|o| o.data().to_vec()));
        let (x, y) = (&primals[0], &primals[1]);
        Ok(vec![ops::mul(y, &cotangents[0])?, ops::mul(x, &cotangents[0])?])
    });

    let call = CallArgs::new(vec![vec_leaf(&[2.0, 3.0]), vec_leaf(&[4.0, 5.0])]);
    let (value, grads) = value_and_grad(engine(), &product)
        .call(&call)
        .expect("custom value_and_grad");
    assert_close(&leaf_values(&value).expect("value"), &[8.0, 15.0], 0.0);

    let Some(Tree::Sequence(parts)) = grads.positional() else {
        panic!("two gradients form a sequence, got {grads:?}");
    };
    assert_close(&leaf_values(&parts[0]).expect("dx"), &[4.0, 5.0], 0.0);
    assert_close(&leaf_values(&parts[1]).expect("dy"), &[2.0, 3.0], 0.0);

    let seen = seen.lock().expect("record lock");
    assert_eq!(*seen, vec![vec![1.0, 1.0], vec![8.0, 15.0]]);
    log_oracle("oracle_custom_vjp_receives_outputs_and_ones", &"product");
}

// ── Oracle: jvp / vjp entry points ─────────────────────────────────

#[test]
fn oracle_custom_jvp_bypasses_engine() {
    let engine = engine();
    let square = custom_square();
    let primals = scalar_leaf(3.0);
    let tangents = scalar_leaf(1.0);

    let (outputs, native) = jvp(engine.as_ref(), &square, &primals, &tangents).expect("jvp");
    assert_close(outputs[0].data(), &[9.0], 0.0);
    assert_close(native[0].data(), &[6.0], GRAD_TOLERANCE);

    square.set_jvp(|_primals, tangents| {
        Ok(tangents.iter().map(|t| ops::scale(t, -1.0)).collect())
    });
    let (outputs, custom) = jvp(engine.as_ref(), &square, &primals, &tangents).expect("jvp");
    assert_close(outputs[0].data(), &[9.0], 0.0);
    assert_close(custom[0].data(), &[-1.0], 0.0);
    log_oracle("oracle_custom_jvp_bypasses_engine", &[3.0, 1.0]);
}

#[test]
fn oracle_custom_vjp_entry_point() {
    let engine = engine();
    let product = custom_product();
    let primals = Tree::sequence([scalar_leaf(2.0), scalar_leaf(7.0)]);
    let cotangents = scalar_leaf(1.0);

    let (outputs, native) = vjp(engine.as_ref(), &product, &primals, &cotangents).expect("vjp");
    assert_close(outputs[0].data(), &[14.0], 0.0);
    assert_eq!(native.len(), 2);
    assert_close(native[0].data(), &[7.0], GRAD_TOLERANCE);
    assert_close(native[1].data(), &[2.0], GRAD_TOLERANCE);

    product.set_vjp(|primals, _cotangents, _outputs| {
        Ok(primals.iter().map(DenseTensor::ones_like).collect())
    });
    let (_, custom) = vjp(engine.as_ref(), &product, &primals, &cotangents).expect("vjp");
    assert_close(custom[0].data(), &[1.0], 0.0);
    assert_close(custom[1].data(), &[1.0], 0.0);
    log_oracle("oracle_custom_vjp_entry_point", &[2.0, 7.0]);
}

// ── Oracle: vmap rule ──────────────────────────────────────────────

#[test]
fn oracle_custom_vmap_sees_expanded_axes() {
    let product = custom_product();
    let axes_seen: Arc<Mutex<Vec<Vec<AxisSpec>>>> = Arc::default();
    let record = Arc::clone(&axes_seen);
    product.set_vmap(move |inputs, axes| {
        record.lock().expect("axes lock").push(axes.to_vec());
        let out = ops::add_scalar(&ops::mul(&inputs[0], &inputs[1])?, 100.0);
        Ok((vec![out], vec![AxisSpec::Batched(0)]))
    });
    let call = CallArgs::new(vec![vec_leaf(&[1.0, 2.0]), vec_leaf(&[3.0, 4.0])]);

    let uniform = vmap(engine(), &product).call(&call).expect("uniform vmap");
    assert_close(&all_leaf_values(&uniform), &[103.0, 108.0], 0.0);

    let per_arg = vmap(engine(), &product)
        .with_in_axes(vec![AxisSpec::Batched(0), AxisSpec::NotBatched])
        .call(&call)
        .expect("per-arg vmap");
    assert!(per_arg.is_leaf());

    let seen = axes_seen.lock().expect("axes lock");
    assert_eq!(
        *seen,
        vec![
            vec![AxisSpec::Batched(0), AxisSpec::Batched(0)],
            vec![AxisSpec::Batched(0), AxisSpec::NotBatched],
        ]
    );
    drop(seen);

    product.clear_vmap();
    let native = vmap(engine(), &product)
        .with_in_axes(VmapAxes::Uniform(AxisSpec::Batched(0)))
        .call(&call)
        .expect("native vmap");
    assert_close(&all_leaf_values(&native), &[3.0, 8.0], 0.0);
    log_oracle("oracle_custom_vmap_sees_expanded_axes", &"product");
}

// ── Adversarial: rule paths accept positional tensors only ─────────

#[test]
fn adversarial_custom_rules_reject_keywords() {
    let square = custom_square();
    square.set_vjp(|_, cotangents, _| Ok(cotangents.to_vec()));
    square.set_vmap(|inputs, axes| Ok((inputs.to_vec(), axes.to_vec())));
    let call = CallArgs::new(vec![scalar_leaf(1.0)]).with_kwarg("scale", scalar_leaf(2.0));

    let err = grad(engine(), &square).call(&call).expect_err("grad keywords");
    assert!(matches!(err, ApiError::CustomKeywordArguments));
    assert_eq!(err.kind(), ErrorKind::Argument);

    let err = vmap(engine(), &square).call(&call).expect_err("vmap keywords");
    assert!(matches!(err, ApiError::CustomKeywordArguments));
    log_oracle("adversarial_custom_rules_reject_keywords", &"scale");
}

#[test]
fn adversarial_custom_vjp_requires_tensor_arguments() {
    let square = custom_square();
    square.set_vjp(|_, cotangents, _| Ok(cotangents.to_vec()));
    let call = CallArgs::new(vec![Tree::sequence([scalar_leaf(1.0)])]);

    let err = grad(engine(), &square).call(&call).expect_err("nested argument");
    assert!(
        matches!(
            &err,
            ApiError::Tree(TreeError::NonTensorLeaf { path, found: "sequence" }) if path == "args.0"
        ),
        "unexpected error: {err}"
    );
    assert_eq!(err.kind(), ErrorKind::Type);
    log_oracle("adversarial_custom_vjp_requires_tensor_arguments", &"args.0");
}

#[test]
fn adversarial_custom_jvp_output_must_be_tensors() {
    let engine = engine();
    let labelled = CustomFunction::new(|args: &CallArgs<DenseTensor>| {
        Ok(Tree::mapping([("y", Tree::leaf(arg_tensor(args, 0)?.clone()))]))
    });
    labelled.set_jvp(|_, tangents| Ok(tangents.to_vec()));
    let err = jvp(engine.as_ref(), &labelled, &scalar_leaf(1.0), &scalar_leaf(1.0))
        .expect_err("mapping output");
    assert!(matches!(err, ApiError::UnexpectedOutput { found: "mapping", .. }));
    assert_eq!(err.kind(), ErrorKind::Type);

    let err = jvp(engine.as_ref(), &labelled, &Tree::int(1), &scalar_leaf(1.0))
        .expect_err("constant primal");
    assert!(matches!(
        err,
        ApiError::UnexpectedOutput {
            context: "primals",
            found: "int"
        }
    ));
    log_oracle("adversarial_custom_jvp_output_must_be_tensors", &"mapping");
}
