mod additive;
pub use additive::{
    AdditiveAttention, AdditiveAttentionConfig, AdditiveAttentionError, AdditiveAttentionOutput,
    AttentionInput, UnprojectedAdditiveAttention, UnprojectedAdditiveAttentionConfig,
};

mod entity;
pub use entity::{
    EntityAlphasAxis, EntityAttention, EntityAttentionConfig, EntityAttentionError,
    EntityAttentionOutput,
};

mod latent_type;
pub use latent_type::{
    LatentTypeAttention, LatentTypeAttentionConfig, LatentTypeAttentionError,
    LatentTypeAttentionOutput,
};

mod mask;
pub use mask::{
    AttentionMask, AttentionMaskError, CausalMask, CausalMaskError, QueryKeyAttentionMask,
};

mod multi_head;
pub use multi_head::{
    MultiHeadAttention, MultiHeadAttentionConfig, MultiHeadAttentionError,
    MultiHeadAttentionOutput,
};

mod relative;
pub use relative::{RelativePositions, RelativePositionsConfig, RelativePositionsError};

mod sdpa;
pub use sdpa::{SDPAConfig, SDPAError, SDPA};
