use candle_core::{ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionMask, AttentionMaskError, CausalMask, CausalMaskError, QueryKeyAttentionMask,
    RelativePositions, RelativePositionsConfig, RelativePositionsError,
};
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;

/// Configuration for scaled dot-product attention.
#[derive(Debug)]
pub struct SDPAConfig {
    dropout: Box<dyn BuildModule>,
    relative_positions: Option<RelativePositionsConfig>,
}

impl SDPAConfig {
    /// Build scaled dot-product attention.
    ///
    /// * `vb` - Variable builder for parameters of relative positions.
    /// * `head_width` - Width of an attention head.
    pub fn build(&self, vb: VarBuilder, head_width: usize) -> Result<SDPA, SDPAError> {
        Ok(SDPA {
            dropout: self.dropout.build(vb.clone()).context(BuildDropoutSnafu)?,
            relative_positions: self
                .relative_positions
                .as_ref()
                .map(|relative_positions| {
                    relative_positions.build(vb.push_prefix("relative_pos_embeddings"), head_width)
                })
                .transpose()
                .context(BuildRelativePositionsSnafu)?,
        })
    }

    /// Dropout to apply to the attention weights.
    ///
    /// Default: `DropoutConfig::default()`.
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Relative position representations for attention scores and values.
    ///
    /// Default: `None`.
    pub fn relative_positions(
        mut self,
        relative_positions: Option<RelativePositionsConfig>,
    ) -> Self {
        self.relative_positions = relative_positions;
        self
    }
}

impl Default for SDPAConfig {
    fn default() -> Self {
        Self {
            dropout: Box::<DropoutConfig>::default(),
            relative_positions: None,
        }
    }
}

/// Errors for scaled dot-product attention.
#[derive(Debug, Snafu)]
pub enum SDPAError {
    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: AttentionMaskError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention mask"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot build dropout module"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build relative position embeddings"))]
    BuildRelativePositions { source: RelativePositionsError },

    #[snafu(display("Cannot create causal mask"))]
    CausalMask { source: CausalMaskError },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot apply relative position embeddings"))]
    RelativePositions { source: RelativePositionsError },

    #[snafu(display("Cannot apply softmax temperature"))]
    Temperature { source: candle_core::Error },
}

/// Scaled dot-product attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762). With
/// relative positions, the scores and weighted values receive the biases
/// of [Shaw et al., 2018](https://arxiv.org/abs/1803.02155).
pub struct SDPA {
    dropout: Box<dyn ModuleT>,
    relative_positions: Option<RelativePositions>,
}

impl SDPA {
    /// Apply attention to the given query, key and value.
    ///
    /// Keys that are padding according to `key_mask` receive the padding
    /// logit before the softmax. The weights of queries that are padding
    /// according to `query_mask` are set to zero.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `value` - Value tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `key_mask` - Padding mask of the keys.
    ///   *Shape:* `(batch_size, key_len)`
    /// * `query_mask` - Padding mask of the queries.
    ///   *Shape:* `(batch_size, query_len)`
    /// * `use_causal_mask` - Whether to apply a causal mask. With a causal mask,
    ///   a sequence element can only attend to preceding elements and itself.
    /// * `train` - Whether to apply dropout.
    ///
    /// Returns: Attention values and the attention weights before dropout.
    /// *Shapes:* `(batch_size, heads, query_len, width)`,
    /// `(batch_size, heads, query_len, key_len)`
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_mask: &AttentionMask,
        query_mask: &AttentionMask,
        use_causal_mask: bool,
        train: bool,
    ) -> Result<(Tensor, Tensor), SDPAError> {
        // Calculate attention scores.
        let query = query.contiguous().context(AttentionScoresSnafu)?;
        let mut attn_scores = key
            .contiguous()
            .and_then(|key| key.transpose(3, 2))
            .and_then(|key| query.broadcast_matmul(&key))
            .context(AttentionScoresSnafu)?;

        if let Some(relative_positions) = &self.relative_positions {
            let key_len = key.dim(2).context(AttentionScoresSnafu)?;
            let biases = relative_positions
                .score_biases(&query, key_len)
                .context(RelativePositionsSnafu)?;
            attn_scores = (attn_scores + biases).context(AttentionScoresSnafu)?;
        }

        let head_width = key.dim(3).context(TemperatureSnafu)?;
        let temperature = (head_width as f64).sqrt();
        attn_scores = (attn_scores / temperature).context(TemperatureSnafu)?;

        let mut combined_mask = key_mask.key_mask().context(AttentionMaskSnafu)?;
        if use_causal_mask {
            let causal_mask =
                QueryKeyAttentionMask::causal_mask(&query, key).context(CausalMaskSnafu)?;
            combined_mask = combined_mask
                .intersect(&causal_mask)
                .context(AttentionMaskSnafu)?;
        }

        attn_scores = combined_mask
            .apply_logit_mask(&attn_scores)
            .context(AttentionMaskSnafu)?;

        let attn_weights = softmax(&attn_scores, D::Minus1).context(AttentionWeightSnafu)?;
        let attn_weights = query_mask
            .apply_query_mask(&attn_weights)
            .context(AttentionMaskSnafu)?;

        let dropped_weights = self
            .dropout
            .forward_t(&attn_weights, train)
            .context(DropoutSnafu)?;

        let mut attn_values = value
            .contiguous()
            .and_then(|value| dropped_weights.broadcast_matmul(&value))
            .context(AttentionWeightSnafu)?;

        if let Some(relative_positions) = &self.relative_positions {
            let biases = relative_positions
                .value_biases(&dropped_weights)
                .context(RelativePositionsSnafu)?;
            attn_values = (attn_values + biases).context(AttentionWeightSnafu)?;
        }

        Ok((attn_values, attn_weights))
    }
}
