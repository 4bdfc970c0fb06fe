//! Tensor extension traits.

use candle_core::{DType, Tensor, D};
use half::{bf16, f16};
use snafu::{ensure, ResultExt, Snafu};

/// Logit that is used for masked-out attention scores.
///
/// After the softmax, positions with this logit have a weight of
/// (practically) zero, unless all positions in a row are masked.
pub const PADDING_LOGIT: f64 = -4_294_967_295.0;

/// Get a tensor filled with the padding logit.
pub trait PaddingLike: Sized {
    /// Get a new tensor filled with [`PADDING_LOGIT`] in the data type of `self`.
    ///
    /// The tensor has the same shape as `self`.
    fn padding_like(&self) -> Result<Self, candle_core::Error>;
}

impl PaddingLike for Tensor {
    fn padding_like(&self) -> Result<Self, candle_core::Error> {
        match self.dtype() {
            DType::BF16 => Tensor::try_from(bf16::from_f64(PADDING_LOGIT)),
            // The padding logit is not representable in f16, this would
            // become -inf and result in NaN for fully masked rows.
            DType::F16 => Tensor::try_from(f16::MIN),
            DType::F32 => Tensor::try_from(PADDING_LOGIT as f32),
            DType::F64 => Tensor::try_from(PADDING_LOGIT),
            dtype => candle_core::bail!("padding logits require a float tensor, got {dtype:?}"),
        }
        .and_then(|scalar| scalar.broadcast_as(self.shape()))
        .and_then(|tensor| tensor.to_device(self.device()))
    }
}

/// Errors for gathering timesteps.
#[derive(Debug, Snafu)]
pub enum GatherError {
    #[snafu(display("Cannot gather timesteps"))]
    Gather { source: candle_core::Error },

    #[snafu(display("Expected {batch_size} indices, got {n_indices}"))]
    IndexCount { batch_size: usize, n_indices: usize },

    #[snafu(display("Timestep index {index} is out of range for sequence length {seq_len}"))]
    IndexOutOfRange { index: i64, seq_len: usize },

    #[snafu(display("Cannot read timestep indices"))]
    ReadIndices { source: candle_core::Error },
}

/// Gather a single timestep per batch item.
pub trait GatherTimesteps {
    /// Select the representation of one timestep for every batch item.
    ///
    /// This is an exact index lookup, indices are validated against the
    /// sequence length before gathering.
    ///
    /// * `indices` - Timestep index per batch item.
    ///   *Shape:* `(batch_size,)`
    ///
    /// Returns: Timestep representations.
    /// *Shape:* `(batch_size, width)`
    fn gather_timesteps(&self, indices: &Tensor) -> Result<Tensor, GatherError>;
}

impl GatherTimesteps for Tensor {
    fn gather_timesteps(&self, indices: &Tensor) -> Result<Tensor, GatherError> {
        let (batch_size, seq_len, width) = self.dims3().context(GatherSnafu)?;

        let host_indices = indices
            .flatten_all()
            .and_then(|indices| indices.to_dtype(DType::I64))
            .and_then(|indices| indices.to_vec1::<i64>())
            .context(ReadIndicesSnafu)?;
        ensure!(
            indices.rank() == 1 && host_indices.len() == batch_size,
            IndexCountSnafu {
                batch_size,
                n_indices: host_indices.len()
            }
        );
        if let Some(&index) = host_indices
            .iter()
            .find(|&&index| index < 0 || index as usize >= seq_len)
        {
            return IndexOutOfRangeSnafu { index, seq_len }.fail();
        }

        indices
            .to_dtype(DType::U32)
            .and_then(|indices| indices.reshape((batch_size, 1, 1)))
            .and_then(|indices| indices.broadcast_as((batch_size, 1, width)))
            .and_then(|indices| indices.contiguous())
            .and_then(|indices| self.contiguous()?.gather(&indices, 1))
            .and_then(|gathered| gathered.squeeze(1))
            .context(GatherSnafu)
    }
}

/// Sum the last dimension and mark non-zero sums.
pub trait NonzeroSums {
    /// Returns a `U8` tensor that is `1` where the sum over the last
    /// dimension is non-zero and `0` otherwise.
    ///
    /// *Shape:* the shape of `self` without the last dimension.
    fn nonzero_sums(&self) -> Result<Tensor, candle_core::Error>;
}

impl NonzeroSums for Tensor {
    fn nonzero_sums(&self) -> Result<Tensor, candle_core::Error> {
        let sums = self.sum(D::Minus1)?;
        sums.ne(&sums.zeros_like()?)
    }
}
