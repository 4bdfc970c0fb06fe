use candle_core::{Module, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::dense::{xavier_uniform, Dense};
use crate::util::tensor_ext::{GatherError, GatherTimesteps};

/// Latent-type attention configuration.
#[derive(Clone, Debug)]
pub struct LatentTypeAttentionConfig {
    input_width: usize,
    latent_size: usize,
    num_type: usize,
}

impl LatentTypeAttentionConfig {
    /// Build a latent-type attention layer.
    ///
    /// The prototype bank is stored as `latent_types` and is shared by
    /// both entities.
    pub fn build(&self, vb: VarBuilder) -> Result<LatentTypeAttention, LatentTypeAttentionError> {
        let projection = Dense::new(
            vb.push_prefix("attn"),
            self.input_width,
            self.latent_size,
            Some(Activation::Relu),
        )
        .context(BuildParametersSnafu)?;
        let latent_types = vb
            .get_with_hints(
                (self.num_type, self.latent_size),
                "latent_types",
                xavier_uniform(self.num_type, self.latent_size),
            )
            .context(BuildParametersSnafu)?;

        tracing::debug!(
            num_type = self.num_type,
            latent_size = self.latent_size,
            "built latent-type attention"
        );

        Ok(LatentTypeAttention {
            input_width: self.input_width,
            latent_types,
            projection,
        })
    }

    /// Width of the input sequence.
    ///
    /// Default: `300`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Width of the entity projection and the latent types.
    ///
    /// Default: `100`
    pub fn latent_size(mut self, latent_size: usize) -> Self {
        self.latent_size = latent_size;
        self
    }

    /// Number of latent entity types.
    ///
    /// Default: `3`
    pub fn num_type(mut self, num_type: usize) -> Self {
        self.num_type = num_type;
        self
    }
}

impl Default for LatentTypeAttentionConfig {
    fn default() -> Self {
        Self {
            input_width: 300,
            latent_size: 100,
            num_type: 3,
        }
    }
}

/// Errors for latent-type attention.
#[derive(Debug, Snafu)]
pub enum LatentTypeAttentionError {
    #[snafu(display("Cannot create latent-type parameters"))]
    BuildParameters { source: candle_core::Error },

    #[snafu(display("Cannot gather entity representations"))]
    Gather { source: GatherError },

    #[snafu(display("Latent-type input width must be {expected}, was {width}"))]
    InputWidth { expected: usize, width: usize },

    #[snafu(display("Cannot project entities"))]
    Projection { source: candle_core::Error },

    #[snafu(display("Cannot calculate entity types"))]
    Types { source: candle_core::Error },
}

/// Output of latent-type attention.
#[derive(Clone, Debug)]
pub struct LatentTypeAttentionOutput {
    e1_alphas: Tensor,
    e1_type: Tensor,
    e2_alphas: Tensor,
    e2_type: Tensor,
}

impl LatentTypeAttentionOutput {
    /// Type weights of the first entity.
    ///
    /// *Shape:* `(batch_size, num_type)`
    pub fn e1_alphas(&self) -> &Tensor {
        &self.e1_alphas
    }

    /// Latent type of the first entity.
    ///
    /// *Shape:* `(batch_size, latent_size)`
    pub fn e1_type(&self) -> &Tensor {
        &self.e1_type
    }

    /// Type weights of the second entity.
    ///
    /// *Shape:* `(batch_size, num_type)`
    pub fn e2_alphas(&self) -> &Tensor {
        &self.e2_alphas
    }

    /// Latent type of the second entity.
    ///
    /// *Shape:* `(batch_size, latent_size)`
    pub fn e2_type(&self) -> &Tensor {
        &self.e2_type
    }
}

/// Latent entity type attention.
///
/// Each entity is softly assigned to a bank of learned type prototypes.
/// The entity type is the weighted combination of the prototypes.
#[derive(Clone, Debug)]
pub struct LatentTypeAttention {
    input_width: usize,
    latent_types: Tensor,
    projection: Dense,
}

impl LatentTypeAttention {
    /// Assign latent types to the entity pair.
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
    ) -> Result<LatentTypeAttentionOutput, LatentTypeAttentionError> {
        let width = input.dim(D::Minus1).context(ProjectionSnafu)?;
        ensure!(
            width == self.input_width,
            InputWidthSnafu {
                expected: self.input_width,
                width
            }
        );

        let attn = self.projection.forward(input).context(ProjectionSnafu)?;
        let (e1_alphas, e1_type) = self.entity_type(&attn, e1)?;
        let (e2_alphas, e2_type) = self.entity_type(&attn, e2)?;

        Ok(LatentTypeAttentionOutput {
            e1_alphas,
            e1_type,
            e2_alphas,
            e2_type,
        })
    }

    fn entity_type(
        &self,
        attn: &Tensor,
        entity: &Tensor,
    ) -> Result<(Tensor, Tensor), LatentTypeAttentionError> {
        let hidden = attn.gather_timesteps(entity).context(GatherSnafu)?;
        let alphas = self
            .latent_types
            .t()
            .and_then(|types| hidden.matmul(&types))
            .and_then(|similarity| softmax(&similarity, D::Minus1))
            .context(TypesSnafu)?;
        let entity_type = alphas.matmul(&self.latent_types).context(TypesSnafu)?;
        Ok((alphas, entity_type))
    }
}
