use candle_core::{Module, Tensor, D};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::attention::{AttentionMask, AttentionMaskError, SDPAConfig, SDPAError, SDPA};
use crate::layers::dense::Dense;
use crate::layers::layer_norm::{LayerNorm, LayerNormConfig, LayerNormError};

/// Multi-head attention configuration.
#[derive(Debug)]
pub struct MultiHeadAttentionConfig {
    causal: bool,
    key_width: usize,
    layer_norm_eps: f64,
    num_heads: usize,
    num_units: usize,
    query_width: usize,
    sdpa: SDPAConfig,
}

impl MultiHeadAttentionConfig {
    /// Build a multi-head attention layer.
    pub fn build(&self, vb: VarBuilder) -> Result<MultiHeadAttention, MultiHeadAttentionError> {
        ensure!(
            self.num_heads > 0 && self.num_units % self.num_heads == 0,
            IndivisibleHeadsSnafu {
                num_heads: self.num_heads,
                num_units: self.num_units
            }
        );
        ensure!(
            self.num_units == self.query_width,
            ResidualWidthSnafu {
                num_units: self.num_units,
                query_width: self.query_width
            }
        );

        let projection = |prefix: &str, input_width: usize| {
            Dense::new(
                vb.push_prefix(prefix),
                input_width,
                self.num_units,
                Some(Activation::Relu),
            )
            .context(BuildProjectionSnafu)
        };
        let query = projection("query", self.query_width)?;
        let key = projection("key", self.key_width)?;
        let value = projection("value", self.key_width)?;

        let head_width = self.num_units / self.num_heads;
        let sdpa = self
            .sdpa
            .build(vb.clone(), head_width)
            .context(BuildSDPASnafu)?;

        let layer_norm = LayerNormConfig::default()
            .eps(self.layer_norm_eps)
            .size(self.num_units)
            .build(vb.push_prefix("ln"))
            .context(BuildLayerNormSnafu)?;

        tracing::debug!(
            num_heads = self.num_heads,
            num_units = self.num_units,
            causal = self.causal,
            "built multi-head attention"
        );

        Ok(MultiHeadAttention {
            causal: self.causal,
            key,
            key_width: self.key_width,
            layer_norm,
            num_heads: self.num_heads,
            query,
            query_width: self.query_width,
            sdpa,
            value,
        })
    }

    /// Mask out keys that follow the query position.
    ///
    /// Default: `false`
    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Width of the key (and value) inputs.
    ///
    /// Default: `300`
    pub fn key_width(mut self, key_width: usize) -> Self {
        self.key_width = key_width;
        self
    }

    /// Layer norm epsilon.
    ///
    /// Default: `1e-8`
    pub fn layer_norm_eps(mut self, layer_norm_eps: f64) -> Self {
        self.layer_norm_eps = layer_norm_eps;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `4`
    pub fn num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    /// Width of the projected queries, keys and values.
    ///
    /// Must be divisible by the number of heads and equal to the query
    /// width for the residual connection.
    ///
    /// Default: `300`
    pub fn num_units(mut self, num_units: usize) -> Self {
        self.num_units = num_units;
        self
    }

    /// Width of the query inputs.
    ///
    /// Default: `300`
    pub fn query_width(mut self, query_width: usize) -> Self {
        self.query_width = query_width;
        self
    }

    /// Attention scorer configuration.
    ///
    /// Default: `SDPAConfig::default()`
    pub fn sdpa(mut self, sdpa: SDPAConfig) -> Self {
        self.sdpa = sdpa;
        self
    }
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        Self {
            causal: false,
            key_width: 300,
            layer_norm_eps: 1e-8,
            num_heads: 4,
            num_units: 300,
            query_width: 300,
            sdpa: SDPAConfig::default(),
        }
    }
}

/// Errors for multi-head attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadAttentionError {
    #[snafu(display("Cannot apply scaled dot-product attention"))]
    Attention { source: SDPAError },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: LayerNormError },

    #[snafu(display("Cannot build projection"))]
    BuildProjection { source: candle_core::Error },

    #[snafu(display("Cannot build scaled dot-product attention"))]
    BuildSDPA { source: SDPAError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Number of units {num_units} is not divisible by number of heads {num_heads}"))]
    IndivisibleHeads { num_heads: usize, num_units: usize },

    #[snafu(display("{input} width must be {expected}, was {width}"))]
    InputWidth {
        input: &'static str,
        expected: usize,
        width: usize,
    },

    #[snafu(display("Cannot apply layer norm"))]
    LayerNorm { source: LayerNormError },

    #[snafu(display("Cannot compute padding mask"))]
    PaddingMask { source: AttentionMaskError },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot add residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display(
        "Number of units {num_units} must match query width {query_width} for the residual connection"
    ))]
    ResidualWidth { num_units: usize, query_width: usize },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Output of multi-head attention.
pub struct MultiHeadAttentionOutput {
    attention_weights: Tensor,
    output: Tensor,
}

impl MultiHeadAttentionOutput {
    /// Attention weights after the softmax and query masking.
    ///
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn attention_weights(&self) -> &Tensor {
        &self.attention_weights
    }

    /// Normalized output representations.
    ///
    /// *Shape:* `(batch_size, query_len, num_units)`
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Take the output representations.
    pub fn into_output(self) -> Tensor {
        self.output
    }
}

/// Multi-head attention layer (_Vaswani et al., 2017_).
///
/// Queries, keys and values are projected with ReLU dense layers, split
/// into heads, and combined with scaled dot-product attention. Timesteps
/// whose input sums to zero are treated as padding. The attention output
/// is added to the queries and layer-normalized.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub struct MultiHeadAttention {
    causal: bool,
    key: Dense,
    key_width: usize,
    layer_norm: LayerNorm,
    num_heads: usize,
    query: Dense,
    query_width: usize,
    sdpa: SDPA,
    value: Dense,
}

impl MultiHeadAttention {
    /// Apply multi-head attention.
    ///
    /// * `queries` - Query sequence.
    ///   *Shape:* `(batch_size, query_len, query_width)`
    /// * `keys` - Key sequence, also used for the values.
    ///   *Shape:* `(batch_size, key_len, key_width)`
    /// * `train` - Whether to apply dropout to the attention weights.
    pub fn forward_t(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        train: bool,
    ) -> Result<MultiHeadAttentionOutput, MultiHeadAttentionError> {
        self.check_width("Query", queries, self.query_width)?;
        self.check_width("Key", keys, self.key_width)?;

        let query_mask = AttentionMask::from_padding(queries).context(PaddingMaskSnafu)?;
        let key_mask = AttentionMask::from_padding(keys).context(PaddingMaskSnafu)?;

        let query = self
            .query
            .forward(queries)
            .context(QkvSnafu)?
            .split_heads(self.num_heads)?;
        let key = self
            .key
            .forward(keys)
            .context(QkvSnafu)?
            .split_heads(self.num_heads)?;
        let value = self
            .value
            .forward(keys)
            .context(QkvSnafu)?
            .split_heads(self.num_heads)?;

        let (attn, attention_weights) = self
            .sdpa
            .forward(
                &query,
                &key,
                &value,
                &key_mask,
                &query_mask,
                self.causal,
                train,
            )
            .context(AttentionSnafu)?;

        let output = attn
            .combine_heads()?
            .add(queries)
            .context(ResidualSnafu)?;

        Ok(MultiHeadAttentionOutput {
            attention_weights,
            output: self.layer_norm.forward(&output).context(LayerNormSnafu)?,
        })
    }

    fn check_width(
        &self,
        input: &'static str,
        xs: &Tensor,
        expected: usize,
    ) -> Result<(), MultiHeadAttentionError> {
        let width = xs.dim(D::Minus1).context(QkvSnafu)?;
        ensure!(
            width == expected,
            InputWidthSnafu {
                input,
                expected,
                width
            }
        );
        Ok(())
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, seq_len, model_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = model_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, IndexOp, Tensor, D};
    use ndarray::ArrayD;
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::{MultiHeadAttentionConfig, MultiHeadAttentionError};
    use crate::layers::attention::{RelativePositionsConfig, SDPAConfig};
    use crate::layers::dropout::DropoutConfig;
    use crate::params::{ParamStore, Reuse};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::{assert_tensor_eq, last_dim_sums, pseudo_random_input, IntoArrayD};

    fn attention_config(relative: bool) -> MultiHeadAttentionConfig {
        let sdpa = if relative {
            SDPAConfig::default()
                .relative_positions(Some(RelativePositionsConfig::default().clip_k(2).seq_len(8)))
        } else {
            SDPAConfig::default()
        };
        MultiHeadAttentionConfig::default()
            .query_width(8)
            .key_width(8)
            .num_units(8)
            .num_heads(2)
            .sdpa(sdpa)
    }

    /// Random input where the last two timesteps of the second sequence
    /// are padding.
    fn padded_input(device: &Device) -> Tensor {
        let input = pseudo_random_input(&[2, 6, 8], device);
        let padding = Tensor::zeros((1, 2, 8), DType::F32, device).unwrap();
        let second = Tensor::cat(&[input.i((1..2, ..4)).unwrap(), padding], 1).unwrap();
        Tensor::cat(&[input.i(..1).unwrap(), second], 0).unwrap()
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    #[report]
    fn multi_head_attention_preserves_query_shape(#[case] relative: bool) -> Result<(), Whatever> {
        for device in test_devices() {
            let store = ParamStore::new(DType::F32, &device);
            let attention = attention_config(relative)
                .build(
                    store
                        .scope("multihead_attention", Reuse::New)
                        .whatever_context("Cannot create scope")?,
                )
                .whatever_context("Cannot build attention")?;

            let queries = pseudo_random_input(&[2, 5, 8], &device);
            let output = attention
                .forward_t(&queries, &queries, false)
                .whatever_context("Cannot apply attention")?;
            assert_eq!(output.output().dims(), queries.dims());
            assert_eq!(output.attention_weights().dims(), &[2, 2, 5, 5]);
        }

        Ok(())
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn padding_keys_get_no_weight(#[case] relative: bool) {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let attention = attention_config(relative)
            .build(store.scope("multihead_attention", Reuse::New).unwrap())
            .unwrap();

        let input = padded_input(&Device::Cpu);
        let output = attention.forward_t(&input, &input, false).unwrap();
        let weights: ArrayD<f32> = output.attention_weights().into_arrayd().unwrap();
        for head in 0..2 {
            for query in 0..6 {
                for key in 4..6 {
                    assert!(weights[[1, head, query, key]] <= 1e-6);
                }
            }
        }

        // Rows of non-padding queries are distributions.
        let sums = last_dim_sums(output.attention_weights());
        for head in 0..2 {
            for query in 0..4 {
                assert!((sums[[1, head, query]] - 1.).abs() < 1e-5);
            }
            // Padding queries have zero weights.
            for query in 4..6 {
                assert_eq!(sums[[1, head, query]], 0.);
            }
        }
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn causal_attention_does_not_attend_to_future(#[case] relative: bool) {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let attention = attention_config(relative)
            .causal(true)
            .build(store.scope("multihead_attention", Reuse::New).unwrap())
            .unwrap();

        let input = pseudo_random_input(&[2, 6, 8], &Device::Cpu);
        let output = attention.forward_t(&input, &input, false).unwrap();
        let weights: ArrayD<f32> = output.attention_weights().into_arrayd().unwrap();
        for batch in 0..2 {
            for head in 0..2 {
                for query in 0..6 {
                    for key in query + 1..6 {
                        assert!(weights[[batch, head, query, key]] <= 1e-6);
                    }
                }
            }
        }

        // The first query can only attend to itself.
        let first = output
            .attention_weights()
            .i((.., .., 0, 0))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(first.iter().all(|weight| (weight - 1.).abs() < 1e-5));
    }

    #[test]
    fn cross_attention_uses_key_width() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let attention = MultiHeadAttentionConfig::default()
            .query_width(8)
            .key_width(6)
            .num_units(8)
            .num_heads(4)
            .build(store.scope("cross_attention", Reuse::New).unwrap())
            .unwrap();

        let queries = pseudo_random_input(&[2, 3, 8], &Device::Cpu);
        let keys = pseudo_random_input(&[2, 5, 6], &Device::Cpu);
        let output = attention.forward_t(&queries, &keys, false).unwrap();
        assert_eq!(output.output().dims(), &[2, 3, 8]);
        assert_eq!(output.attention_weights().dims(), &[2, 4, 3, 5]);

        assert!(matches!(
            attention.forward_t(&keys, &keys, false),
            Err(MultiHeadAttentionError::InputWidth {
                input: "Query",
                expected: 8,
                width: 6
            })
        ));
    }

    #[test]
    fn invalid_head_configuration_is_rejected() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let result = MultiHeadAttentionConfig::default()
            .query_width(10)
            .key_width(10)
            .num_units(10)
            .num_heads(3)
            .build(store.scope("indivisible", Reuse::New).unwrap());
        assert!(matches!(
            result,
            Err(MultiHeadAttentionError::IndivisibleHeads {
                num_heads: 3,
                num_units: 10
            })
        ));

        let result = MultiHeadAttentionConfig::default()
            .query_width(10)
            .key_width(10)
            .num_units(8)
            .num_heads(2)
            .build(store.scope("residual", Reuse::New).unwrap());
        assert!(matches!(
            result,
            Err(MultiHeadAttentionError::ResidualWidth {
                num_units: 8,
                query_width: 10
            })
        ));
    }

    #[test]
    fn dropout_only_applies_during_training() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let attention = attention_config(false)
            .sdpa(SDPAConfig::default().dropout(Box::new(DropoutConfig::default().p(0.5))))
            .build(store.scope("multihead_attention", Reuse::New).unwrap())
            .unwrap();

        let input = pseudo_random_input(&[2, 6, 8], &Device::Cpu);
        let first = attention.forward_t(&input, &input, false).unwrap();
        let second = attention.forward_t(&input, &input, false).unwrap();
        assert_eq!(
            first.output().to_vec3::<f32>().unwrap(),
            second.output().to_vec3::<f32>().unwrap()
        );

        let trained = attention.forward_t(&input, &input, true).unwrap();
        assert_eq!(trained.output().dims(), input.dims());
        let difference = (trained.output() - first.output())
            .and_then(|diff| diff.abs())
            .and_then(|diff| diff.max_keepdim(2))
            .and_then(|diff| diff.flatten_all())
            .and_then(|diff| diff.max(0))
            .and_then(|diff| diff.to_scalar::<f32>())
            .unwrap();
        assert!(difference > 1e-4);

        // Returned weights are taken before dropout.
        assert_tensor_eq!(
            trained.attention_weights(),
            IntoArrayD::<f32>::into_arrayd(first.attention_weights()).unwrap(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn output_is_layer_normalized() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let attention = attention_config(true)
            .build(store.scope("multihead_attention", Reuse::New).unwrap())
            .unwrap();
        let input = pseudo_random_input(&[2, 6, 8], &Device::Cpu);
        let output = attention.forward_t(&input, &input, false).unwrap();
        let means = output
            .output()
            .mean(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(means.iter().all(|mean| mean.abs() < 1e-5));
    }
}
