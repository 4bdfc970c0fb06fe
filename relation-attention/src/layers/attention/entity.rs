use candle_core::{Module, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::dense::Dense;
use crate::layers::layer_norm::{LayerNorm, LayerNormConfig, LayerNormError};
use crate::util::tensor_ext::{GatherError, GatherTimesteps};

/// Axis over which entity attention scores are normalized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAlphasAxis {
    /// For each entity, normalize its scores over all timesteps.
    #[default]
    Time,

    /// For each timestep, normalize its scores over the two entities.
    Entity,
}

impl EntityAlphasAxis {
    fn dim(self) -> usize {
        match self {
            EntityAlphasAxis::Time => 1,
            EntityAlphasAxis::Entity => 2,
        }
    }
}

/// Entity-pair attention configuration.
#[derive(Clone, Debug)]
pub struct EntityAttentionConfig {
    alphas_axis: EntityAlphasAxis,
    attention_size: usize,
    input_width: usize,
    layer_norm_eps: f64,
}

impl EntityAttentionConfig {
    /// Build an entity-pair attention layer.
    pub fn build(&self, vb: VarBuilder) -> Result<EntityAttention, EntityAttentionError> {
        let projection = Dense::new(
            vb.push_prefix("attn"),
            self.input_width,
            self.attention_size,
            Some(Activation::Relu),
        )
        .context(BuildProjectionSnafu)?;
        let layer_norm = LayerNormConfig::default()
            .eps(self.layer_norm_eps)
            .size(self.attention_size)
            .build(vb.push_prefix("ln"))
            .context(BuildLayerNormSnafu)?;

        tracing::debug!(
            input_width = self.input_width,
            attention_size = self.attention_size,
            alphas_axis = ?self.alphas_axis,
            "built entity attention"
        );

        Ok(EntityAttention {
            alphas_axis: self.alphas_axis,
            input_width: self.input_width,
            layer_norm,
            projection,
        })
    }

    /// Axis over which the attention scores are normalized.
    ///
    /// Default: `EntityAlphasAxis::Time`
    pub fn alphas_axis(mut self, alphas_axis: EntityAlphasAxis) -> Self {
        self.alphas_axis = alphas_axis;
        self
    }

    /// Width of the entity projection.
    ///
    /// Default: `50`
    pub fn attention_size(mut self, attention_size: usize) -> Self {
        self.attention_size = attention_size;
        self
    }

    /// Width of the input sequence.
    ///
    /// Default: `300`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Layer norm epsilon.
    ///
    /// Default: `1e-8`
    pub fn layer_norm_eps(mut self, layer_norm_eps: f64) -> Self {
        self.layer_norm_eps = layer_norm_eps;
        self
    }
}

impl Default for EntityAttentionConfig {
    fn default() -> Self {
        Self {
            alphas_axis: EntityAlphasAxis::default(),
            attention_size: 50,
            input_width: 300,
            layer_norm_eps: 1e-8,
        }
    }
}

/// Errors for entity-pair attention.
#[derive(Debug, Snafu)]
pub enum EntityAttentionError {
    #[snafu(display("Cannot calculate entity attention"))]
    Attention { source: candle_core::Error },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: LayerNormError },

    #[snafu(display("Cannot build entity projection"))]
    BuildProjection { source: candle_core::Error },

    #[snafu(display("Cannot gather entity representations"))]
    Gather { source: GatherError },

    #[snafu(display("Entity attention input width must be {expected}, was {width}"))]
    InputWidth { expected: usize, width: usize },

    #[snafu(display("Cannot apply layer norm"))]
    LayerNorm { source: LayerNormError },
}

/// Output of entity-pair attention.
#[derive(Clone, Debug)]
pub struct EntityAttentionOutput {
    alphas: Tensor,
    e1_hidden: Tensor,
    e2_hidden: Tensor,
    output: Tensor,
}

impl EntityAttentionOutput {
    /// Attention weights of each timestep for both entities.
    ///
    /// *Shape:* `(batch_size, seq_len, 2)`
    pub fn alphas(&self) -> &Tensor {
        &self.alphas
    }

    /// Projected representation of the first entity.
    ///
    /// *Shape:* `(batch_size, attention_size)`
    pub fn e1_hidden(&self) -> &Tensor {
        &self.e1_hidden
    }

    /// Projected representation of the second entity.
    ///
    /// *Shape:* `(batch_size, attention_size)`
    pub fn e2_hidden(&self) -> &Tensor {
        &self.e2_hidden
    }

    /// Normalized entity-weighted sequence.
    ///
    /// *Shape:* `(batch_size, seq_len, attention_size)`
    pub fn output(&self) -> &Tensor {
        &self.output
    }
}

/// Entity-pair attention.
///
/// The sequence is projected with a ReLU dense layer. Every timestep is
/// scored against the projections at the two entity positions, and the
/// output of a timestep is the weighted combination of the two entity
/// projections.
#[derive(Clone, Debug)]
pub struct EntityAttention {
    alphas_axis: EntityAlphasAxis,
    input_width: usize,
    layer_norm: LayerNorm,
    projection: Dense,
}

impl EntityAttention {
    /// Apply entity-pair attention.
    ///
    /// * `input` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `e1` - Position of the first entity.
    ///   *Shape:* `(batch_size,)`
    /// * `e2` - Position of the second entity.
    ///   *Shape:* `(batch_size,)`
    pub fn forward(
        &self,
        input: &Tensor,
        e1: &Tensor,
        e2: &Tensor,
    ) -> Result<EntityAttentionOutput, EntityAttentionError> {
        let width = input.dim(D::Minus1).context(AttentionSnafu)?;
        ensure!(
            width == self.input_width,
            InputWidthSnafu {
                expected: self.input_width,
                width
            }
        );

        let attn = self.projection.forward(input).context(AttentionSnafu)?;
        let e1_hidden = attn.gather_timesteps(e1).context(GatherSnafu)?;
        let e2_hidden = attn.gather_timesteps(e2).context(GatherSnafu)?;

        // (batch_size, attention_size, 2)
        let entities = Tensor::stack(&[&e1_hidden, &e2_hidden], 2).context(AttentionSnafu)?;

        let alphas = attn
            .matmul(&entities)
            .and_then(|scores| softmax(&scores, self.alphas_axis.dim()))
            .context(AttentionSnafu)?;

        let output = entities
            .transpose(1, 2)
            .and_then(|entities| entities.contiguous())
            .and_then(|entities| alphas.matmul(&entities))
            .context(AttentionSnafu)?;

        Ok(EntityAttentionOutput {
            alphas,
            e1_hidden,
            e2_hidden,
            output: self.layer_norm.forward(&output).context(LayerNormSnafu)?,
        })
    }
}
