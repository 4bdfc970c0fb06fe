use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{Init, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

const OMEGA_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.1,
};

/// Input of additive attention.
#[derive(Clone, Copy, Debug)]
pub enum AttentionInput<'a> {
    /// Outputs of a unidirectional encoder.
    ///
    /// *Shape:* `(batch_size, seq_len, width)`, or
    /// `(seq_len, batch_size, width)` when time-major.
    Single(&'a Tensor),

    /// Forward and backward outputs of a bidirectional encoder.
    ///
    /// The outputs are concatenated along the last dimension, their widths
    /// must sum to the configured input width.
    Bidirectional(&'a Tensor, &'a Tensor),
}

impl<'a> AttentionInput<'a> {
    /// Get the input as a batch-major tensor.
    ///
    /// *Shape:* `(batch_size, seq_len, width)`
    fn batch_major(&self, time_major: bool) -> Result<Tensor, AdditiveAttentionError> {
        let input = match self {
            AttentionInput::Single(input) => (*input).clone(),
            AttentionInput::Bidirectional(forward, backward) => {
                Tensor::cat(&[*forward, *backward], 2).context(ConcatSnafu)?
            }
        };

        if time_major {
            input
                .transpose(0, 1)
                .and_then(|input| input.contiguous())
                .context(TransposeSnafu)
        } else {
            Ok(input)
        }
    }
}

impl<'a> From<&'a Tensor> for AttentionInput<'a> {
    fn from(input: &'a Tensor) -> Self {
        AttentionInput::Single(input)
    }
}

impl<'a> From<(&'a Tensor, &'a Tensor)> for AttentionInput<'a> {
    fn from((forward, backward): (&'a Tensor, &'a Tensor)) -> Self {
        AttentionInput::Bidirectional(forward, backward)
    }
}

/// Errors for additive attention.
#[derive(Debug, Snafu)]
pub enum AdditiveAttentionError {
    #[snafu(display("Cannot create attention parameters"))]
    BuildParameters { source: candle_core::Error },

    #[snafu(display("Cannot concatenate forward and backward inputs"))]
    Concat { source: candle_core::Error },

    #[snafu(display("Attention input width must be {expected}, was {width}"))]
    InputWidth { expected: usize, width: usize },

    #[snafu(display("Cannot pool sequence using attention weights"))]
    Pool { source: candle_core::Error },

    #[snafu(display("Cannot calculate attention scores"))]
    Scores { source: candle_core::Error },

    #[snafu(display("Cannot convert time-major input"))]
    Transpose { source: candle_core::Error },
}

/// Output of additive attention.
#[derive(Clone, Debug)]
pub struct AdditiveAttentionOutput {
    alphas: Option<Tensor>,
    output: Tensor,
}

impl AdditiveAttentionOutput {
    /// Attention weights over time, when requested.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub fn alphas(&self) -> Option<&Tensor> {
        self.alphas.as_ref()
    }

    /// Attention-pooled sequence.
    ///
    /// *Shape:* `(batch_size, width)`
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Take the pooled sequence and the attention weights.
    pub fn into_parts(self) -> (Tensor, Option<Tensor>) {
        (self.output, self.alphas)
    }
}

/// Additive attention configuration.
#[derive(Clone, Debug)]
pub struct AdditiveAttentionConfig {
    attention_size: usize,
    input_width: usize,
    return_alphas: bool,
    time_major: bool,
}

impl AdditiveAttentionConfig {
    /// Build an additive attention layer.
    pub fn build(&self, vb: VarBuilder) -> Result<AdditiveAttention, AdditiveAttentionError> {
        let w_omega = vb
            .get_with_hints((self.input_width, self.attention_size), "w_omega", OMEGA_INIT)
            .context(BuildParametersSnafu)?;
        let b_omega = vb
            .get_with_hints(self.attention_size, "b_omega", OMEGA_INIT)
            .context(BuildParametersSnafu)?;
        let u_omega = vb
            .get_with_hints(self.attention_size, "u_omega", OMEGA_INIT)
            .and_then(|u_omega| u_omega.reshape((self.attention_size, 1)))
            .context(BuildParametersSnafu)?;

        tracing::debug!(
            input_width = self.input_width,
            attention_size = self.attention_size,
            "built additive attention"
        );

        Ok(AdditiveAttention {
            b_omega,
            input_width: self.input_width,
            return_alphas: self.return_alphas,
            time_major: self.time_major,
            u_omega,
            w_omega,
        })
    }

    /// Width of the hidden attention projection.
    ///
    /// Default: `50`
    pub fn attention_size(mut self, attention_size: usize) -> Self {
        self.attention_size = attention_size;
        self
    }

    /// Width of the (concatenated) input.
    ///
    /// Default: `1024`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Return the attention weights along with the pooled output.
    ///
    /// Default: `false`
    pub fn return_alphas(mut self, return_alphas: bool) -> Self {
        self.return_alphas = return_alphas;
        self
    }

    /// Inputs are laid out as `(seq_len, batch_size, width)`.
    ///
    /// Default: `false`
    pub fn time_major(mut self, time_major: bool) -> Self {
        self.time_major = time_major;
        self
    }
}

impl Default for AdditiveAttentionConfig {
    fn default() -> Self {
        Self {
            attention_size: 50,
            input_width: 1024,
            return_alphas: false,
            time_major: false,
        }
    }
}

/// Additive attention pooling (_Yang et al., 2016_).
///
/// Every timestep is scored with `tanh(xW + b)u`, the scores are
/// normalized over time and used to compute a weighted sum of the
/// timesteps. Padding timesteps are not masked and receive weight.
///
/// * _Yang et al., 2016_: https://aclanthology.org/N16-1174
#[derive(Clone, Debug)]
pub struct AdditiveAttention {
    b_omega: Tensor,
    input_width: usize,
    return_alphas: bool,
    time_major: bool,
    u_omega: Tensor,
    w_omega: Tensor,
}

impl AdditiveAttention {
    /// Pool the input sequence.
    pub fn forward<'a>(
        &self,
        input: impl Into<AttentionInput<'a>>,
    ) -> Result<AdditiveAttentionOutput, AdditiveAttentionError> {
        let input = input.into().batch_major(self.time_major)?;
        check_width(&input, self.input_width)?;

        let scores = input
            .broadcast_matmul(&self.w_omega)
            .and_then(|v| v.broadcast_add(&self.b_omega))
            .and_then(|v| v.tanh())
            .and_then(|v| v.broadcast_matmul(&self.u_omega))
            .and_then(|scores| scores.squeeze(2))
            .context(ScoresSnafu)?;

        pool(&input, &scores, self.return_alphas)
    }
}

/// Configuration of additive attention without a hidden projection.
#[derive(Clone, Debug)]
pub struct UnprojectedAdditiveAttentionConfig {
    input_width: usize,
    return_alphas: bool,
    time_major: bool,
}

impl UnprojectedAdditiveAttentionConfig {
    /// Build an additive attention layer without a hidden projection.
    pub fn build(
        &self,
        vb: VarBuilder,
    ) -> Result<UnprojectedAdditiveAttention, AdditiveAttentionError> {
        let u_omega = vb
            .get_with_hints(self.input_width, "u_omega", OMEGA_INIT)
            .and_then(|u_omega| u_omega.reshape((self.input_width, 1)))
            .context(BuildParametersSnafu)?;

        Ok(UnprojectedAdditiveAttention {
            input_width: self.input_width,
            return_alphas: self.return_alphas,
            time_major: self.time_major,
            u_omega,
        })
    }

    /// Width of the (concatenated) input.
    ///
    /// Default: `1024`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Return the attention weights along with the pooled output.
    ///
    /// Default: `false`
    pub fn return_alphas(mut self, return_alphas: bool) -> Self {
        self.return_alphas = return_alphas;
        self
    }

    /// Inputs are laid out as `(seq_len, batch_size, width)`.
    ///
    /// Default: `false`
    pub fn time_major(mut self, time_major: bool) -> Self {
        self.time_major = time_major;
        self
    }
}

impl Default for UnprojectedAdditiveAttentionConfig {
    fn default() -> Self {
        Self {
            input_width: 1024,
            return_alphas: false,
            time_major: false,
        }
    }
}

/// Additive attention pooling without a hidden projection.
///
/// Timesteps are scored with `tanh(x)u`. Otherwise the same as
/// [`AdditiveAttention`].
#[derive(Clone, Debug)]
pub struct UnprojectedAdditiveAttention {
    input_width: usize,
    return_alphas: bool,
    time_major: bool,
    u_omega: Tensor,
}

impl UnprojectedAdditiveAttention {
    /// Pool the input sequence.
    pub fn forward<'a>(
        &self,
        input: impl Into<AttentionInput<'a>>,
    ) -> Result<AdditiveAttentionOutput, AdditiveAttentionError> {
        let input = input.into().batch_major(self.time_major)?;
        check_width(&input, self.input_width)?;

        let scores = input
            .tanh()
            .and_then(|v| v.broadcast_matmul(&self.u_omega))
            .and_then(|scores| scores.squeeze(2))
            .context(ScoresSnafu)?;

        pool(&input, &scores, self.return_alphas)
    }
}

fn check_width(input: &Tensor, expected: usize) -> Result<(), AdditiveAttentionError> {
    let (_, _, width) = input.dims3().context(ScoresSnafu)?;
    ensure!(width == expected, InputWidthSnafu { expected, width });
    Ok(())
}

/// Normalize scores over time and compute the weighted sum of the input.
fn pool(
    input: &Tensor,
    scores: &Tensor,
    return_alphas: bool,
) -> Result<AdditiveAttentionOutput, AdditiveAttentionError> {
    let alphas = softmax(scores, D::Minus1).context(PoolSnafu)?;
    let output = alphas
        .unsqueeze(2)
        .and_then(|alphas| input.broadcast_mul(&alphas))
        .and_then(|weighted| weighted.sum(1))
        .context(PoolSnafu)?;

    Ok(AdditiveAttentionOutput {
        alphas: return_alphas.then_some(alphas),
        output,
    })
}
