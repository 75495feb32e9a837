//! Attention kernels.

pub mod flash;
pub mod softmax;

pub use flash::{
    AttentionGrads, AttentionOutput, FlashAttention, KernelConfig, KernelOptions, KernelVariant,
};
pub use softmax::StreamingSoftmax;
