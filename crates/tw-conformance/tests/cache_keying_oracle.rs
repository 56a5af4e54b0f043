#![forbid(unsafe_code)]

//! Compile and checkpoint caching oracles: entries are keyed by call
//! structure and leaf shapes (constants included), tensor values never split
//! entries, and rejected calls never reach the engine.

use std::sync::Arc;

use tw_api::{ApiError, CallArgs, Function, Tree, checkpoint, compile};
use tw_backend_cpu::{CpuEngine, DenseTensor, ops};
use tw_cache::{CacheKey, CallSignature};
use tw_conformance::{
    FixtureFamily, OracleFixture, all_leaf_values, arg_tensor, assert_close, leaf_values,
    scalar_leaf, vec_leaf,
};
use tw_core::{ErrorKind, LeafPolicy, TreeError, flatten_call};
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

fn doubled() -> Function<DenseTensor> {
    Function::new(|args: &CallArgs<DenseTensor>| {
        Ok(Tree::leaf(ops::scale(arg_tensor(args, 0)?, 2.0)))
    })
}

/// Returns `x` alone, or `[x, 2x]` when called with `mode="pair"`.
fn mode_switch() -> Function<DenseTensor> {
    Function::new(|args: &CallArgs<DenseTensor>| {
        let x = arg_tensor(args, 0)?;
        let pair = args
            .kwarg("mode")
            .and_then(Tree::as_constant)
            .and_then(|mode| mode.as_str())
            == Some("pair");
        if pair {
            Ok(Tree::sequence([
                Tree::leaf(x.clone()),
                Tree::leaf(ops::scale(x, 2.0)),
            ]))
        } else {
            Ok(Tree::leaf(x.clone()))
        }
    })
}

// ── Oracle: keying ─────────────────────────────────────────────────

#[test]
fn oracle_distinct_shapes_compile_twice() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(Arc::clone(&engine), doubled());

    let two = compiled
        .call(&CallArgs::new(vec![vec_leaf(&[1.0, 2.0])]))
        .expect("shape [2]");
    let three = compiled
        .call(&CallArgs::new(vec![vec_leaf(&[1.0, 2.0, 3.0])]))
        .expect("shape [3]");
    assert_close(&leaf_values(&two).expect("tensor"), &[2.0, 4.0], 0.0);
    assert_close(&leaf_values(&three).expect("tensor"), &[2.0, 4.0, 6.0], 0.0);

    let stats = compiled.cache_stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.misses, 2);
    assert_eq!(engine.compile_count(), 2);

    let fixture = OracleFixture::new(FixtureFamily::Cache, "distinct_shapes")
        .with_input(&[1.0, 2.0])
        .with_input(&[1.0, 2.0, 3.0]);
    log_oracle("oracle_distinct_shapes_compile_twice", &fixture);
}

#[test]
fn oracle_shapeless_compile_shares_one_entry_across_shapes() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(Arc::clone(&engine), doubled()).with_shapeless(true);

    let two = compiled
        .call(&CallArgs::new(vec![vec_leaf(&[1.0, 2.0])]))
        .expect("shape [2]");
    let three = compiled
        .call(&CallArgs::new(vec![vec_leaf(&[1.0, 2.0, 3.0])]))
        .expect("shape [3]");
    assert_close(&leaf_values(&two).expect("tensor"), &[2.0, 4.0], 0.0);
    assert_close(&leaf_values(&three).expect("tensor"), &[2.0, 4.0, 6.0], 0.0);

    let stats = compiled.cache_stats();
    assert_eq!((stats.entries, stats.misses, stats.hits), (1, 1, 1));
    assert_eq!(engine.compile_count(), 1);
    log_oracle("oracle_shapeless_compile_shares_one_entry_across_shapes", &[2, 3]);
}

#[test]
fn oracle_same_structure_reuses_staged_callable() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(Arc::clone(&engine), doubled());

    for value in [1.0, 5.0, -3.0] {
        let out = compiled
            .call(&CallArgs::new(vec![vec_leaf(&[value, value + 1.0])]))
            .expect("compiled call");
        assert_close(
            &leaf_values(&out).expect("tensor"),
            &[2.0 * value, 2.0 * value + 2.0],
            0.0,
        );
    }

    let stats = compiled.cache_stats();
    assert_eq!((stats.entries, stats.misses, stats.hits), (1, 1, 2));
    assert_eq!(engine.compile_count(), 1);
    // Every call, including the first, goes through the staged callable.
    assert_eq!(engine.staged_calls(), 3);
    log_oracle("oracle_same_structure_reuses_staged_callable", &[1.0, 5.0, -3.0]);
}

#[test]
fn oracle_constant_keywords_select_output_structure() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(Arc::clone(&engine), mode_switch());
    let x = vec_leaf(&[1.0, 2.0]);

    let single = CallArgs::new(vec![x.clone()]).with_kwarg("mode", Tree::string("single"));
    let pair = CallArgs::new(vec![x]).with_kwarg("mode", Tree::string("pair"));

    for _ in 0..2 {
        let out = compiled.call(&single).expect("single");
        assert!(out.is_leaf());
        let out = compiled.call(&pair).expect("pair");
        assert_eq!(out.as_sequence().map(<[_]>::len), Some(2));
        assert_close(&all_leaf_values(&out), &[1.0, 2.0, 2.0, 4.0], 0.0);
    }

    let stats = compiled.cache_stats();
    assert_eq!((stats.entries, stats.hits), (2, 2));
    assert_eq!(engine.compile_count(), 2);
    log_oracle("oracle_constant_keywords_select_output_structure", &["single", "pair"]);
}

#[test]
fn oracle_checkpoint_caches_like_compile() {
    let engine = Arc::new(CpuEngine::new());
    let wrapped = checkpoint(Arc::clone(&engine), doubled());
    for _ in 0..3 {
        let out = wrapped
            .call(&CallArgs::new(vec![scalar_leaf(4.0)]))
            .expect("checkpoint");
        assert_close(&leaf_values(&out).expect("tensor"), &[8.0], 0.0);
    }
    assert_eq!(engine.checkpoint_count(), 1);
    assert_eq!(engine.compile_count(), 0);
    assert_eq!(wrapped.cache_stats().hits, 2);

    wrapped.clear_cache();
    assert_eq!(wrapped.cache_stats().entries, 0);
    wrapped
        .call(&CallArgs::new(vec![scalar_leaf(1.0)]))
        .expect("after clear");
    assert_eq!(engine.checkpoint_count(), 2);
    log_oracle("oracle_checkpoint_caches_like_compile", &4.0);
}

#[test]
fn oracle_cache_key_digest_tracks_structure() {
    let base = CallArgs::new(vec![vec_leaf(&[1.0, 2.0])]).with_kwarg("scale", Tree::int(2));
    let same_structure =
        CallArgs::new(vec![vec_leaf(&[9.0, 9.0])]).with_kwarg("scale", Tree::int(2));
    let other_constant =
        CallArgs::new(vec![vec_leaf(&[1.0, 2.0])]).with_kwarg("scale", Tree::int(3));

    let key = |args: &CallArgs<DenseTensor>| {
        let (def, _) = flatten_call(args, LeafPolicy::AllowConstants).expect("flatten");
        CacheKey::from_treedef(&def)
    };
    let base_key = key(&base);
    assert_eq!(base_key, key(&same_structure));
    assert_ne!(base_key, key(&other_constant));
    assert!(base_key.as_string().starts_with("twx-"));
    assert_eq!(base_key.digest_hex.len(), 64);

    let shaped = |args: &CallArgs<DenseTensor>| {
        let (def, leaves) = flatten_call(args, LeafPolicy::AllowConstants).expect("flatten");
        let shapes = leaves.iter().map(|leaf| leaf.shape().to_vec()).collect();
        CacheKey::from_signature(&CallSignature::shaped(def, shapes))
    };
    let longer =
        CallArgs::new(vec![vec_leaf(&[1.0, 2.0, 3.0])]).with_kwarg("scale", Tree::int(2));
    assert_eq!(shaped(&base), shaped(&same_structure));
    assert_ne!(shaped(&base), shaped(&longer));
    assert_eq!(base_key, key(&longer));
    log_oracle("oracle_cache_key_digest_tracks_structure", &base_key.as_string());
}

// ── Adversarial ────────────────────────────────────────────────────

#[test]
fn adversarial_opaque_arguments_never_reach_the_engine() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(Arc::clone(&engine), doubled());
    let call = CallArgs::new(vec![vec_leaf(&[1.0])])
        .with_kwarg("handle", Tree::opaque(std::sync::Mutex::new(0_u8)));

    let err = compiled.call(&call).expect_err("opaque leaf");
    assert!(
        matches!(
            &err,
            ApiError::Tree(TreeError::UnsupportedLeaf { path, .. }) if path == "kwargs.handle"
        ),
        "unexpected error: {err}"
    );
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(engine.compile_count(), 0);
    assert_eq!(compiled.cache_stats().misses, 0);
    log_oracle("adversarial_opaque_arguments_never_reach_the_engine", &"kwargs.handle");
}

#[test]
fn adversarial_failed_first_call_commits_nothing() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(
        Arc::clone(&engine),
        Function::new(|_: &CallArgs<DenseTensor>| Err(ApiError::user("boom"))),
    );
    let call = CallArgs::new(vec![scalar_leaf(1.0)]);
    for _ in 0..2 {
        let err = compiled.call(&call).expect_err("user error");
        assert!(matches!(&err, ApiError::User { message } if message == "boom"));
    }
    assert_eq!(compiled.cache_stats().entries, 0);
    assert_eq!(engine.compile_count(), 2);
    log_oracle("adversarial_failed_first_call_commits_nothing", &"boom");
}

#[test]
fn adversarial_compile_hints_are_flattened_strictly() {
    let engine = Arc::new(CpuEngine::new());
    let call = CallArgs::new(vec![scalar_leaf(1.0)]);

    let hinted = compile(Arc::clone(&engine), doubled())
        .with_inputs(Tree::mapping([("state", vec_leaf(&[0.0, 0.0]))]))
        .with_outputs(Tree::sequence([scalar_leaf(0.0)]))
        .with_shapeless(true);
    let out = hinted.call(&call).expect("valid hints");
    assert_close(&leaf_values(&out).expect("tensor"), &[2.0], 0.0);

    let bad = compile(Arc::clone(&engine), doubled())
        .with_inputs(Tree::sequence([scalar_leaf(0.0), Tree::string("not a tensor")]));
    let err = bad.call(&call).expect_err("constant in hints");
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(bad.cache_stats().entries, 0);
    assert_eq!(engine.compile_count(), 1);
    log_oracle("adversarial_compile_hints_are_flattened_strictly", &"hints");
}

#[test]
fn adversarial_shared_wrapper_keeps_one_entry_per_structure() {
    let engine = Arc::new(CpuEngine::new());
    let compiled = compile(Arc::clone(&engine), doubled());

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let compiled = &compiled;
            scope.spawn(move || {
                let x = f64::from(worker);
                let out = compiled
                    .call(&CallArgs::new(vec![vec_leaf(&[x, x])]))
                    .expect("threaded call");
                assert_close(&leaf_values(&out).expect("tensor"), &[2.0 * x, 2.0 * x], 0.0);
            });
        }
    });

    let stats = compiled.cache_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits + stats.misses, 4);
    log_oracle("adversarial_shared_wrapper_keeps_one_entry_per_structure", &4);
}
