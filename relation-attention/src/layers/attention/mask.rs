use candle_core::{DType, IndexOp, Tensor};
use snafu::{ensure, ResultExt, Snafu};

use crate::util::tensor_ext::{NonzeroSums, PaddingLike};

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot apply query mask"))]
    ApplyQueryMask { source: candle_core::Error },

    #[snafu(display("Cannot derive mask from padding"))]
    FromPadding { source: candle_core::Error },

    #[snafu(display("Cannot intersect masks"))]
    IntersectMasks { source: candle_core::Error },

    #[snafu(display("Attention mask must be 2D, was {}D", n_dims))]
    InvalidDims { n_dims: usize },

    #[snafu(display("Cannot reshape mask"))]
    Reshape { source: candle_core::Error },
}

/// Attention mask.
///
/// Sequence elements for which the corresponding mask element is set to
/// `0` are padding. Guaranteed to be a 2D array.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    bool_mask: Tensor,
}

impl AttentionMask {
    /// Create an input attention mask.
    ///
    /// * `bool_mask` - Boolean mask tensor.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn new(bool_mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = bool_mask.dims().len();
        ensure!(n_dims == 2, InvalidDimsSnafu { n_dims });
        Ok(AttentionMask { bool_mask })
    }

    /// Derive the mask from sequence representations.
    ///
    /// Timesteps whose representation sums to exactly zero are padding.
    ///
    /// * `input` - Sequence representations.
    ///   *Shape:* `(batch_size, seq_len, width)`
    pub fn from_padding(input: &Tensor) -> Result<Self, AttentionMaskError> {
        input
            .nonzero_sums()
            .context(FromPaddingSnafu)
            .and_then(Self::new)
    }

    /// Boolean mask tensor.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Use this mask as a key mask.
    ///
    /// Returns: Mask with shape `(batch_size, 1, 1, key_len)`.
    pub fn key_mask(&self) -> Result<QueryKeyAttentionMask, AttentionMaskError> {
        let (batch_len, key_len) = self.bool_mask.dims2().context(ReshapeSnafu)?;
        Ok(QueryKeyAttentionMask {
            bool_mask: self
                .bool_mask
                .reshape((batch_len, 1, 1, key_len))
                .context(ReshapeSnafu)?,
        })
    }

    /// Use this mask as a query mask, zeroing the rows of padding queries.
    ///
    /// * weights - Attention weights.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Weights with rows of padding queries set to zero.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_query_mask(&self, weights: &Tensor) -> Result<Tensor, AttentionMaskError> {
        let (batch_len, query_len) = self.bool_mask.dims2().context(ApplyQueryMaskSnafu)?;
        self.bool_mask
            .reshape((batch_len, 1, query_len, 1))
            .and_then(|mask| mask.to_dtype(weights.dtype()))
            .and_then(|mask| weights.broadcast_mul(&mask))
            .context(ApplyQueryMaskSnafu)
    }
}

/// Attention mask.
///
/// A 4D attention mask that broadcasts to
/// *(batch_size, heads, query_len, key_len)*. Elements for which the
/// corresponding mask element is set to `0` are ignored during attention
/// calculation.
#[derive(Clone, Debug)]
pub struct QueryKeyAttentionMask {
    bool_mask: Tensor,
}

impl QueryKeyAttentionMask {
    /// Use the attention mask to mask logits.
    ///
    /// Masked logits are replaced by the padding logit.
    ///
    /// * input - Tensor to which the mask is applied.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Logits with the attention mask applied.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_logit_mask(&self, input: &Tensor) -> Result<Tensor, AttentionMaskError> {
        let blocked_value = input.padding_like().context(ApplyLogitsMaskSnafu)?;
        self.bool_mask
            .broadcast_as(input.shape())
            .and_then(|xs| xs.where_cond(input, &blocked_value))
            .context(ApplyLogitsMaskSnafu)
    }

    /// Merge this attention mask with another attention mask.
    pub fn intersect(
        &self,
        other: &QueryKeyAttentionMask,
    ) -> Result<QueryKeyAttentionMask, AttentionMaskError> {
        Ok(QueryKeyAttentionMask {
            bool_mask: self
                .bool_mask
                .broadcast_mul(&other.bool_mask)
                .context(IntersectMasksSnafu)?,
        })
    }

    /// Boolean mask tensor.
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }
}

#[derive(Debug, Snafu)]
pub enum CausalMaskError {
    #[snafu(display("Cannot create causal mask"))]
    CreateMask { source: candle_core::Error },

    #[snafu(display("Key has invalid number of dimensions"))]
    KeyDim { source: candle_core::Error },

    #[snafu(display("Query has invalid number of dimensions"))]
    QueryDim { source: candle_core::Error },

    #[snafu(display("Cannot slice causal mask to key/query size"))]
    SliceMask { source: candle_core::Error },
}

/// Trait for creating causal masks.
pub trait CausalMask: Sized {
    type Error;

    /// Create a causal mask for the given query and key.
    ///
    /// A causal mask ensures that the query at position `i` cannot attend
    /// to keys at positions `j > i`.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    fn causal_mask(query: &Tensor, key: &Tensor) -> Result<Self, Self::Error>;
}

impl CausalMask for QueryKeyAttentionMask {
    type Error = CausalMaskError;

    fn causal_mask(query: &Tensor, key: &Tensor) -> Result<Self, Self::Error> {
        let (_, _, query_len, _) = query.shape().dims4().context(QueryDimSnafu)?;
        let (_, _, key_len, _) = key.shape().dims4().context(KeyDimSnafu)?;

        let len = query_len.max(key_len);
        let causal_mask = Tensor::tril2(len, DType::U8, key.device()).context(CreateMaskSnafu)?;
        Ok(Self {
            bool_mask: causal_mask
                .i((..query_len, ..key_len))
                .and_then(|mask| mask.reshape((1, 1, query_len, key_len)))
                .context(SliceMaskSnafu)?,
        })
    }
}
