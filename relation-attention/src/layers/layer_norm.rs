use candle_core::{Module, Tensor, D};
use candle_nn::{layer_norm, LayerNormConfig as CandleLayerNormConfig, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

/// Layer norm configuration.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    pub eps: f64,
    pub size: usize,
}

impl LayerNormConfig {
    /// Build a layer norm module.
    ///
    /// The scale (`weight`) is initialized to ones and the shift (`bias`)
    /// to zeros.
    pub fn build(&self, vb: VarBuilder) -> Result<LayerNorm, LayerNormError> {
        let inner = layer_norm(
            self.size,
            CandleLayerNormConfig {
                affine: true,
                eps: self.eps,
                remove_mean: true,
            },
            vb,
        )
        .context(BuildLayerNormSnafu)?;

        Ok(LayerNorm {
            inner,
            size: self.size,
        })
    }

    /// Epsilon value, added to the variance to avoid division by zero.
    ///
    /// Default: `1e-8`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Size of the last dimension of the input.
    ///
    /// Default: `300`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-8,
            size: 300,
        }
    }
}

/// Errors for layer normalization.
#[derive(Debug, Snafu)]
pub enum LayerNormError {
    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: candle_core::Error },

    #[snafu(display("Layer norm input must have at least 2 dimensions, had {rank}"))]
    InvalidRank { rank: usize },

    #[snafu(display("Cannot get input width"))]
    InputWidth { source: candle_core::Error },

    #[snafu(display("Layer norm input width must be {size}, was {width}"))]
    InputWidthMismatch { size: usize, width: usize },

    #[snafu(display("Cannot normalize input"))]
    Normalize { source: candle_core::Error },
}

/// Layer normalization (_Ba et al., 2016_).
///
/// Normalizes the last dimension of the input to zero mean and unit
/// variance, followed by a learned per-channel scale and shift:
///
/// `gamma * (x - mean) / sqrt(variance + eps) + beta`
///
/// * _Ba et al., 2016_: https://arxiv.org/abs/1607.06450
#[derive(Clone, Debug)]
pub struct LayerNorm {
    inner: candle_nn::LayerNorm,
    size: usize,
}

impl LayerNorm {
    /// Apply layer normalization.
    ///
    /// * `input` - Input tensor with at least two dimensions.
    ///   *Shape:* `(batch_size, ..., size)`
    ///
    /// Returns: Normalized tensor with the same shape as the input.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, LayerNormError> {
        let rank = input.rank();
        ensure!(rank >= 2, InvalidRankSnafu { rank });
        let width = input.dim(D::Minus1).context(InputWidthSnafu)?;
        ensure!(
            width == self.size,
            InputWidthMismatchSnafu {
                size: self.size,
                width
            }
        );

        self.inner.forward(input).context(NormalizeSnafu)
    }
}
