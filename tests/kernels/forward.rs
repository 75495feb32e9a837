//! Forward pass integration tests.

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Tensor};
use flashbench_rs::kernels::flash::{
    reference_attention, Autotuner, FlashAttention, KernelConfig, KernelVariant, LoopSchedule,
    TileConfig, TuneSettings, WarpSpecConfig,
};
use flashbench_rs::FlashbenchError;

use crate::helpers::{AttentionTestConfig, TestFixtures, ValidationUtils};

fn quick(variant: KernelVariant) -> FlashAttention {
    FlashAttention::new(variant).with_autotuner(Arc::new(Autotuner::new(TuneSettings::quick())))
}

/// Same tiling expressed for every variant.
fn every_variant(tile: TileConfig) -> [KernelConfig; 5] {
    let ws = WarpSpecConfig::from_tile(tile);
    [
        KernelConfig::Baseline(tile),
        KernelConfig::Pipelined(tile),
        KernelConfig::WarpSpecialized(ws),
        KernelConfig::HardwareDescriptor(tile),
        KernelConfig::HardwareDescriptorWarpSpecialized(ws),
    ]
}

#[test]
fn test_forward_matches_reference_f32() -> Result<()> {
    let tile = TileConfig::default().with_blocks(64, 32).with_warps(4);
    let attention = FlashAttention::new(KernelVariant::Baseline);

    for config in [AttentionTestConfig::small(), AttentionTestConfig::ragged()] {
        for causal in [false, true] {
            let config = config.with_causal(causal);
            let (q, k, v) = TestFixtures::attention_inputs(&config)?;
            let out = attention.forward_with_config(
                &q,
                &k,
                &v,
                config.sm_scale(),
                causal,
                &KernelConfig::Baseline(tile),
            )?;
            let expected = reference_attention(&q, &k, &v, config.sm_scale(), causal)?;

            let metrics = ValidationUtils::calculate_accuracy_metrics(&expected, &out.output)?;
            assert!(
                metrics.max_error < 1e-5,
                "{:?} causal={causal}: max error {}",
                config.dims(),
                metrics.max_error
            );
            assert!(metrics.cosine_similarity > 0.9999);
        }
    }
    Ok(())
}

#[test]
fn test_autotuned_forward_matches_reference() -> Result<()> {
    let config = AttentionTestConfig::small()
        .with_head_dim(128)
        .with_seq_len(256)
        .with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let expected = reference_attention(&q, &k, &v, config.sm_scale(), true)?;

    for variant in KernelVariant::ALL {
        let out = quick(variant).forward(&q, &k, &v, config.sm_scale(), true)?;
        assert_eq!(out.config.variant(), variant);
        let metrics = ValidationUtils::calculate_accuracy_metrics(&expected, &out.output)?;
        assert!(metrics.max_error < 1e-5, "{variant}: max error {}", metrics.max_error);
    }
    Ok(())
}

#[test]
fn test_causal_bf16_small_head_scenario() -> Result<()> {
    let config = AttentionTestConfig {
        batch_size: 1,
        num_heads: 1,
        seq_len: 128,
        head_dim: 64,
        causal: true,
        dtype: DType::BF16,
        seed: 20,
    };
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;

    let out = quick(KernelVariant::Baseline).forward(&q, &k, &v, config.sm_scale(), true)?;
    assert_eq!(out.output.dtype(), DType::BF16);
    assert_eq!(out.row_stats.dtype(), DType::F32);
    assert_eq!(out.row_stats.dims(), &[1, 1, 128]);

    let expected = reference_attention(&q, &k, &v, config.sm_scale(), true)?;
    let metrics = ValidationUtils::calculate_accuracy_metrics(&expected, &out.output)?;
    assert!(metrics.max_error < 1e-2, "max error {}", metrics.max_error);
    Ok(())
}

#[test]
fn test_f16_matches_reference() -> Result<()> {
    let config = AttentionTestConfig::small().with_dtype(DType::F16).with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let tile = TileConfig::default().with_blocks(64, 64).with_warps(4);
    let out = FlashAttention::new(KernelVariant::Pipelined).forward_with_config(
        &q,
        &k,
        &v,
        config.sm_scale(),
        true,
        &KernelConfig::Pipelined(tile),
    )?;
    assert_eq!(out.output.dtype(), DType::F16);

    let expected = reference_attention(&q, &k, &v, config.sm_scale(), true)?;
    let metrics = ValidationUtils::calculate_accuracy_metrics(&expected, &out.output)?;
    assert!(metrics.max_error < 1e-2, "max error {}", metrics.max_error);
    Ok(())
}

#[test]
fn test_one_query_tile_matches_two() -> Result<()> {
    let config = AttentionTestConfig::small().with_seq_len(256).with_causal(false);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let attention = FlashAttention::new(KernelVariant::Baseline);

    let tile = TileConfig::default().with_warps(4);
    let two_tiles = KernelConfig::Baseline(tile.with_blocks(128, 64));
    let one_tile = KernelConfig::Baseline(tile.with_blocks(256, 64));
    let a = attention.forward_with_config(&q, &k, &v, config.sm_scale(), false, &two_tiles)?;
    let b = attention.forward_with_config(&q, &k, &v, config.sm_scale(), false, &one_tile)?;

    let metrics = ValidationUtils::calculate_accuracy_metrics(&a.output, &b.output)?;
    assert!(metrics.max_error < 1e-6, "max error {}", metrics.max_error);
    Ok(())
}

#[test]
fn test_causal_rows_ignore_future_keys() -> Result<()> {
    let config = AttentionTestConfig::small().with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let noise = AttentionTestConfig { seed: 99, ..config };
    let (_, noise_k, noise_v) = TestFixtures::attention_inputs(&noise)?;

    // Replace every key and value from position 64 on.
    let splice = |a: &Tensor, b: &Tensor| -> Result<Tensor> {
        Ok(Tensor::cat(&[&a.narrow(2, 0, 64)?, &b.narrow(2, 64, 64)?], 2)?)
    };
    let k2 = splice(&k, &noise_k)?;
    let v2 = splice(&v, &noise_v)?;

    let tile = KernelConfig::Baseline(TileConfig::default().with_blocks(64, 32).with_warps(4));
    let attention = FlashAttention::new(KernelVariant::Baseline);
    let a = attention.forward_with_config(&q, &k, &v, config.sm_scale(), true, &tile)?;
    let b = attention.forward_with_config(&q, &k2, &v2, config.sm_scale(), true, &tile)?;

    let head_a = ValidationUtils::to_host(&a.output.narrow(2, 0, 64)?)?;
    let head_b = ValidationUtils::to_host(&b.output.narrow(2, 0, 64)?)?;
    assert_eq!(head_a, head_b);

    let tail_a = ValidationUtils::to_host(&a.output.narrow(2, 64, 64)?)?;
    let tail_b = ValidationUtils::to_host(&b.output.narrow(2, 64, 64)?)?;
    assert_ne!(tail_a, tail_b);
    Ok(())
}

#[test]
fn test_variants_agree_bit_for_bit() -> Result<()> {
    let config = AttentionTestConfig::ragged();
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let attention = FlashAttention::new(KernelVariant::Baseline);
    let tile = TileConfig::default().with_blocks(64, 32).with_warps(4);

    let baseline = KernelConfig::Baseline(tile);
    let baseline = attention.forward_with_config(&q, &k, &v, config.sm_scale(), true, &baseline)?;
    let expected = ValidationUtils::to_host(&baseline.output)?;
    let expected_stats = ValidationUtils::to_host(&baseline.row_stats)?;

    for schedule in [LoopSchedule::Default, LoopSchedule::FirstDot, LoopSchedule::SecondDot] {
        for peel_last in [false, true] {
            let tile = tile.with_schedule(schedule).with_peel_last(peel_last);
            for kernel in every_variant(tile) {
                if kernel.validate(config.head_dim, true).is_err() {
                    continue;
                }
                let out =
                    attention.forward_with_config(&q, &k, &v, config.sm_scale(), true, &kernel)?;
                assert_eq!(ValidationUtils::to_host(&out.output)?, expected, "{kernel}");
                assert_eq!(ValidationUtils::to_host(&out.row_stats)?, expected_stats, "{kernel}");
            }
        }
    }
    Ok(())
}

#[test]
fn test_repeated_forward_is_deterministic() -> Result<()> {
    let config = AttentionTestConfig::small().with_head_dim(128).with_causal(true);
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let attention = quick(KernelVariant::WarpSpecialized);

    let first = attention.forward(&q, &k, &v, config.sm_scale(), true)?;
    for _ in 0..3 {
        let again = attention.forward(&q, &k, &v, config.sm_scale(), true)?;
        assert_eq!(again.config, first.config);
        assert_eq!(
            ValidationUtils::to_host(&again.output)?,
            ValidationUtils::to_host(&first.output)?
        );
    }
    Ok(())
}

#[test]
fn test_invalid_inputs_rejected() -> Result<()> {
    let config = AttentionTestConfig::small();
    let (q, k, v) = TestFixtures::attention_inputs(&config)?;
    let attention = FlashAttention::new(KernelVariant::Baseline);

    let short_k = k.narrow(2, 0, 64)?;
    assert!(matches!(
        attention.forward(&q, &short_k, &v, 0.125, false),
        Err(FlashbenchError::ShapeMismatch { .. })
    ));

    let (q48, k48, v48) = TestFixtures::attention_inputs(&config.with_head_dim(48))?;
    assert!(matches!(
        attention.forward(&q48, &k48, &v48, 0.125, false),
        Err(FlashbenchError::UnsupportedHeadDim(48))
    ));

    let q64 = q.to_dtype(DType::F64)?;
    assert!(matches!(
        attention.forward(&q64, &q64, &q64, 0.125, false),
        Err(FlashbenchError::UnsupportedDType(DType::F64))
    ));

    // 128-wide key tiles do not fit a 64-wide head.
    let too_wide = KernelConfig::Baseline(TileConfig::default());
    assert!(matches!(
        attention.forward_with_config(&q, &k, &v, 0.125, false, &too_wide),
        Err(FlashbenchError::Config(_))
    ));
    Ok(())
}
