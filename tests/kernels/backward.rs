//! Backward pass integration tests.

use anyhow::Result;
use candle_core::{DType, Tensor};
use flashbench_rs::kernels::flash::{
    reference_gradients, BackwardConfig, FlashAttention, KernelConfig, KernelVariant, TileConfig,
};
use flashbench_rs::FlashbenchError;

use crate::helpers::{AttentionTestConfig, TestFixtures, ValidationUtils};

fn assert_close(name: &str, expected: &Tensor, actual: &Tensor, tol: f32) -> Result<()> {
    let metrics = ValidationUtils::calculate_accuracy_metrics(expected, actual)?;
    assert!(
        metrics.max_error < tol,
        "{name}: max error {} (mae {}, rmse {})",
        metrics.max_error,
        metrics.mae,
        metrics.rmse
    );
    Ok(())
}

#[test]
fn test_gradients_match_autodiff() -> Result<()> {
    let tile = KernelConfig::Baseline(TileConfig::default().with_blocks(64, 32).with_warps(4));
    let attention = FlashAttention::new(KernelVariant::Baseline)
        .with_backward_config(BackwardConfig::default().with_blocks(16, 64));

    for config in [AttentionTestConfig::small(), AttentionTestConfig::ragged()] {
        for causal in [false, true] {
            let config = config.with_causal(causal);
            let (q, k, v) = TestFixtures::attention_inputs(&config)?;
            let d_o = TestFixtures::output_gradient(&config)?;
            let sm_scale = config.sm_scale();

            let out = attention.forward_with_config(&q, &k, &v, sm_scale, causal, &tile)?;
            let grads = attention.backward(
                &q,
                &k,
                &v,
                &out.output,
                &d_o,
                &out.row_stats,
                sm_scale,
                causal,
            )?;
            let expected = reference_gradients(&q, &k, &v, &d_o, sm_scale, causal)?;

            assert_close("dq", &expected.dq, &grads.dq, 1e-4)?;
            assert_close("dk", &expected.dk, &grads.dk, 1e-4)?;
            assert_close("dv", &expected.dv, &grads.dv, 1e-4)?;
        }
    }
    Ok(())
}

#[test]
fn test_default_backward_tiling() -> Result<()> {
    let config = AttentionTestConfig::small().with_seq_len(256).with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let d_o = TestFixtures::output_gradient(&config)?;
    let attention = FlashAttention::new(KernelVariant::Baseline);
    let sm_scale = config.sm_scale();

    let out = attention.forward_with_config(
        &q,
        &k,
        &v,
        sm_scale,
        true,
        &KernelConfig::Baseline(TileConfig::default().with_blocks(64, 64).with_warps(4)),
    )?;
    let grads = attention.backward(&q, &k, &v, &out.output, &d_o, &out.row_stats, sm_scale, true)?;
    let expected = reference_gradients(&q, &k, &v, &d_o, sm_scale, true)?;

    assert_close("dq", &expected.dq, &grads.dq, 1e-4)?;
    assert_close("dk", &expected.dk, &grads.dk, 1e-4)?;
    assert_close("dv", &expected.dv, &grads.dv, 1e-4)?;
    Ok(())
}

#[test]
fn test_bf16_gradients() -> Result<()> {
    let config = AttentionTestConfig::small().with_dtype(DType::BF16).with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let d_o = TestFixtures::output_gradient(&config)?;
    let attention = FlashAttention::new(KernelVariant::Baseline);
    let sm_scale = config.sm_scale();

    let out = attention.forward_with_config(
        &q,
        &k,
        &v,
        sm_scale,
        true,
        &KernelConfig::Baseline(TileConfig::default().with_blocks(64, 64).with_warps(4)),
    )?;
    let grads = attention.backward(&q, &k, &v, &out.output, &d_o, &out.row_stats, sm_scale, true)?;
    assert_eq!(grads.dq.dtype(), DType::BF16);
    assert_eq!(grads.dk.dims(), q.dims());

    let expected = reference_gradients(&q, &k, &v, &d_o, sm_scale, true)?;
    assert_close("dq", &expected.dq, &grads.dq, 5e-2)?;
    assert_close("dk", &expected.dk, &grads.dk, 5e-2)?;
    assert_close("dv", &expected.dv, &grads.dv, 5e-2)?;
    Ok(())
}

#[test]
fn test_backward_validation() -> Result<()> {
    let config = AttentionTestConfig::small();
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let stats = Tensor::zeros((1, 2, 128), DType::F32, q.device())?;

    let attention = FlashAttention::new(KernelVariant::Baseline);
    let short = q.narrow(2, 0, 64)?;
    assert!(matches!(
        attention.backward(&q, &k, &v, &q, &short, &stats, 0.125, false),
        Err(FlashbenchError::ShapeMismatch { .. })
    ));

    let bad_tiling = attention.with_backward_config(BackwardConfig::default().with_blocks(64, 32));
    assert!(matches!(
        bad_tiling.backward(&q, &k, &v, &q, &q, &stats, 0.125, false),
        Err(FlashbenchError::Config(_))
    ));
    Ok(())
}
