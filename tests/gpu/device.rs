//! Device round trips through the host-staged kernels.

use anyhow::Result;
use candle_core::DType;
use flashbench_rs::kernels::flash::{
    reference_attention, FlashAttention, KernelConfig, KernelVariant, TileConfig,
};

use crate::helpers::{AttentionTestConfig, TestFixtures, ValidationUtils};

#[test]
fn test_forward_backward_stay_on_device() -> Result<()> {
    let device = require_gpu!();

    let config = AttentionTestConfig::small().with_dtype(DType::BF16).with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let d_o = TestFixtures::output_gradient(&config)?.to_device(&device)?;
    let (q, k, v) = (q.to_device(&device)?, k.to_device(&device)?, v.to_device(&device)?);

    let attention = FlashAttention::new(KernelVariant::Baseline);
    let tile = KernelConfig::Baseline(TileConfig::default().with_blocks(64, 64).with_warps(4));
    let out = attention.forward_with_config(&q, &k, &v, config.sm_scale(), true, &tile)?;
    assert!(out.output.device().same_device(&device));
    assert!(out.row_stats.device().same_device(&device));
    assert_eq!(out.output.dtype(), DType::BF16);

    let expected = reference_attention(&q, &k, &v, config.sm_scale(), true)?;
    let metrics = ValidationUtils::calculate_accuracy_metrics(&expected, &out.output)?;
    assert!(metrics.max_error < 1e-2, "max error {}", metrics.max_error);

    let grads = attention.backward(
        &q,
        &k,
        &v,
        &out.output,
        &d_o,
        &out.row_stats,
        config.sm_scale(),
        true,
    )?;
    assert!(grads.dq.device().same_device(&device));
    assert_eq!(grads.dv.dtype(), DType::BF16);
    Ok(())
}
