use candle_core::{Module, Tensor, D};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::dense::Dense;
use crate::layers::layer_norm::{LayerNorm, LayerNormConfig, LayerNormError};

/// Point-wise feed-forward configuration.
#[derive(Clone, Debug)]
pub struct PointwiseFeedForwardConfig {
    eps: f64,
    input_width: usize,
    num_units: [usize; 2],
}

impl PointwiseFeedForwardConfig {
    /// Build a point-wise feed-forward layer.
    ///
    /// The readout width (`num_units[1]`) must be equal to the input width
    /// for the residual connection.
    pub fn build(&self, vb: VarBuilder) -> Result<PointwiseFeedForward, PointwiseFeedForwardError> {
        let [intermediate_width, output_width] = self.num_units;
        ensure!(
            output_width == self.input_width,
            ResidualWidthSnafu {
                input_width: self.input_width,
                output_width
            }
        );

        let intermediate = Dense::new(
            vb.push_prefix("intermediate"),
            self.input_width,
            intermediate_width,
            Some(Activation::Relu),
        )
        .context(BuildDenseSnafu)?;
        let output = Dense::new(
            vb.push_prefix("output"),
            intermediate_width,
            output_width,
            None,
        )
        .context(BuildDenseSnafu)?;
        let layer_norm = LayerNormConfig::default()
            .eps(self.eps)
            .size(output_width)
            .build(vb.push_prefix("ln"))
            .context(BuildLayerNormSnafu)?;

        Ok(PointwiseFeedForward {
            input_width: self.input_width,
            intermediate,
            layer_norm,
            output,
        })
    }

    /// Layer norm epsilon.
    ///
    /// Default: `1e-8`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Width of the input.
    ///
    /// Default: `300`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Widths of the intermediate and the readout layer.
    ///
    /// Default: `[150, 300]`
    pub fn num_units(mut self, num_units: [usize; 2]) -> Self {
        self.num_units = num_units;
        self
    }
}

impl Default for PointwiseFeedForwardConfig {
    fn default() -> Self {
        Self {
            eps: 1e-8,
            input_width: 300,
            num_units: [150, 300],
        }
    }
}

/// Errors for point-wise feed-forward layers.
#[derive(Debug, Snafu)]
pub enum PointwiseFeedForwardError {
    #[snafu(display("Cannot build dense layer"))]
    BuildDense { source: candle_core::Error },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: LayerNormError },

    #[snafu(display("Cannot apply feed-forward transformation"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Feed-forward input width must be {expected}, was {width}"))]
    InputWidth { expected: usize, width: usize },

    #[snafu(display("Cannot apply layer norm"))]
    LayerNorm { source: LayerNormError },

    #[snafu(display(
        "Readout width {output_width} must match input width {input_width} for the residual connection"
    ))]
    ResidualWidth {
        input_width: usize,
        output_width: usize,
    },
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// The same transformation is applied to each sequence element. This is
/// equivalent to two convolutions with a kernel size of 1:
///
/// `LayerNorm(x + relu(xW_1 + b_1)W_2 + b_2)`
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
#[derive(Clone, Debug)]
pub struct PointwiseFeedForward {
    input_width: usize,
    intermediate: Dense,
    layer_norm: LayerNorm,
    output: Dense,
}

impl PointwiseFeedForward {
    /// Apply the feed-forward transformation.
    ///
    /// * `input` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len, width)`
    ///
    /// Returns: Transformed sequence.
    /// *Shape:* `(batch_size, seq_len, width)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, PointwiseFeedForwardError> {
        let width = input.dim(D::Minus1).context(FeedForwardSnafu)?;
        ensure!(
            width == self.input_width,
            InputWidthSnafu {
                expected: self.input_width,
                width
            }
        );

        let output = self
            .intermediate
            .forward(input)
            .and_then(|xs| self.output.forward(&xs))
            .and_then(|xs| xs + input)
            .context(FeedForwardSnafu)?;

        self.layer_norm.forward(&output).context(LayerNormSnafu)
    }
}
