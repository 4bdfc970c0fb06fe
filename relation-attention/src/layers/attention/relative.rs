use candle_core::{Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

/// Relative position configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelativePositionsConfig {
    clip_k: usize,
    seq_len: usize,
}

impl RelativePositionsConfig {
    /// Build relative position embeddings.
    ///
    /// * `vb` - Variable builder, the key and value bias tables are stored
    ///   as `wk` and `wv`.
    /// * `head_width` - Width of an attention head.
    pub fn build(
        &self,
        vb: VarBuilder,
        head_width: usize,
    ) -> Result<RelativePositions, RelativePositionsError> {
        let n_buckets = 2 * self.clip_k + 2;
        let init = Init::Uniform {
            lo: -0.25,
            up: 0.25,
        };
        let key_biases = vb
            .get_with_hints((n_buckets, head_width), "wk", init)
            .context(BuildEmbeddingsSnafu)?;
        let value_biases = vb
            .get_with_hints((n_buckets, head_width), "wv", init)
            .context(BuildEmbeddingsSnafu)?;

        let distances = RelativePositions::calculate_distances(self.clip_k, self.seq_len)?
            .to_device(vb.device())
            .context(CalculateDistancesSnafu)?;

        tracing::debug!(
            clip_k = self.clip_k,
            seq_len = self.seq_len,
            head_width,
            "built relative position embeddings"
        );

        Ok(RelativePositions {
            clip_k: self.clip_k,
            distances,
            key_biases: Embedding::new(key_biases, head_width),
            seq_len: self.seq_len,
            value_biases: Embedding::new(value_biases, head_width),
        })
    }

    /// Maximum relative distance, larger distances are clipped.
    ///
    /// Default: `10`.
    pub fn clip_k(mut self, clip_k: usize) -> Self {
        self.clip_k = clip_k;
        self
    }

    /// Maximum sequence length.
    ///
    /// Default: `102`.
    pub fn seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }
}

impl Default for RelativePositionsConfig {
    fn default() -> Self {
        Self {
            clip_k: 10,
            seq_len: 102,
        }
    }
}

/// Errors for relative position embeddings.
#[derive(Debug, Snafu)]
pub enum RelativePositionsError {
    #[snafu(display("Cannot build relative position embeddings"))]
    BuildEmbeddings { source: candle_core::Error },

    #[snafu(display("Cannot calculate relative distances"))]
    CalculateDistances { source: candle_core::Error },

    #[snafu(display("Cannot calculate relative key biases"))]
    KeyBiases { source: candle_core::Error },

    #[snafu(display(
        "Sequence length {len} exceeds the maximum relative position length {seq_len}"
    ))]
    SequenceTooLong { len: usize, seq_len: usize },

    #[snafu(display("Cannot calculate relative value biases"))]
    ValueBiases { source: candle_core::Error },
}

/// Relative position representations (_Shaw et al., 2018_).
///
/// The distance between a query and a key position is clipped to
/// `[-clip_k, clip_k]` and used to look up learned biases that are added
/// to the attention scores and to the weighted values.
///
/// * _Shaw et al., 2018_: https://arxiv.org/abs/1803.02155
#[derive(Clone, Debug)]
pub struct RelativePositions {
    clip_k: usize,
    distances: Tensor,
    key_biases: Embedding,
    seq_len: usize,
    value_biases: Embedding,
}

impl RelativePositions {
    /// Calculate the relative distance table.
    ///
    /// The bucket of query position `i` and key position `j` is
    /// `clamp(j - i + clip_k + 1, 1, 2 * clip_k + 1)`. Positions at the
    /// same index share the bucket `clip_k + 1`.
    ///
    /// Returns: Distance buckets.
    /// *Shape:* `(seq_len, seq_len)`
    fn calculate_distances(
        clip_k: usize,
        seq_len: usize,
    ) -> Result<Tensor, RelativePositionsError> {
        let clip_k = clip_k as i64;
        let buckets = (0..seq_len as i64)
            .flat_map(|query| {
                (0..seq_len as i64)
                    .map(move |key| (key - query + clip_k + 1).clamp(1, 2 * clip_k + 1) as u32)
            })
            .collect::<Vec<_>>();
        Tensor::from_vec(buckets, (seq_len, seq_len), &Device::Cpu).context(CalculateDistancesSnafu)
    }

    /// Maximum relative distance.
    pub fn clip_k(&self) -> usize {
        self.clip_k
    }

    /// Get the distance buckets for the given query and key lengths.
    ///
    /// Returns: Distance buckets.
    /// *Shape:* `(query_len, key_len)`
    pub fn distances(
        &self,
        query_len: usize,
        key_len: usize,
    ) -> Result<Tensor, RelativePositionsError> {
        for len in [query_len, key_len] {
            ensure!(
                len <= self.seq_len,
                SequenceTooLongSnafu {
                    len,
                    seq_len: self.seq_len
                }
            );
        }

        self.distances
            .i((..query_len, ..key_len))
            .and_then(|distances| distances.contiguous())
            .context(CalculateDistancesSnafu)
    }

    /// Calculate the relative position biases of the attention scores.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, head_width)`
    /// * `key_len` - Key sequence length.
    ///
    /// Returns: Score biases.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn score_biases(
        &self,
        query: &Tensor,
        key_len: usize,
    ) -> Result<Tensor, RelativePositionsError> {
        let (batch_size, n_heads, query_len, head_width) = query.dims4().context(KeyBiasesSnafu)?;
        let distances = self.distances(query_len, key_len)?;

        // (query_len, key_len, head_width)
        let key_biases = self.key_biases.forward(&distances).context(KeyBiasesSnafu)?;

        // Per query position: (query_len, batch_size * heads, head_width) x
        // (query_len, head_width, key_len).
        query
            .reshape((batch_size * n_heads, query_len, head_width))
            .and_then(|query| query.transpose(0, 1)?.contiguous())
            .and_then(|query| query.matmul(&key_biases.transpose(1, 2)?.contiguous()?))
            .and_then(|biases| biases.transpose(0, 1))
            .and_then(|biases| biases.reshape((batch_size, n_heads, query_len, key_len)))
            .context(KeyBiasesSnafu)
    }

    /// Calculate the relative position biases of the weighted values.
    ///
    /// * `weights` - Attention weights.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Value biases.
    /// *Shape:* `(batch_size, heads, query_len, head_width)`
    pub fn value_biases(&self, weights: &Tensor) -> Result<Tensor, RelativePositionsError> {
        let (batch_size, n_heads, query_len, key_len) = weights.dims4().context(ValueBiasesSnafu)?;
        let distances = self.distances(query_len, key_len)?;

        // (query_len, key_len, head_width)
        let value_biases = self.value_biases.forward(&distances).context(ValueBiasesSnafu)?;
        let head_width = value_biases.dim(2).context(ValueBiasesSnafu)?;

        weights
            .reshape((batch_size * n_heads, query_len, key_len))
            .and_then(|weights| weights.transpose(0, 1)?.contiguous())
            .and_then(|weights| weights.matmul(&value_biases))
            .and_then(|biases| biases.transpose(0, 1))
            .and_then(|biases| biases.reshape((batch_size, n_heads, query_len, head_width)))
            .context(ValueBiasesSnafu)
    }
}
