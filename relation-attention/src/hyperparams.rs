use std::io::Read;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::attention::{
    AdditiveAttentionConfig, EntityAttentionConfig, LatentTypeAttentionConfig,
    MultiHeadAttentionConfig, RelativePositionsConfig, SDPAConfig,
};
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;

/// Errors for model hyperparameters.
#[derive(Debug, Snafu)]
pub enum HyperParamsError {
    #[snafu(display("Cannot deserialize hyperparameters"))]
    Deserialize { source: serde_json::Error },

    #[snafu(display(
        "Embedding size {embedding_size} is not divisible by number of heads {num_heads}"
    ))]
    IndivisibleHeads {
        embedding_size: usize,
        num_heads: usize,
    },

    #[snafu(display("{name} must be in (0, 1], was {keep_prob}"))]
    InvalidKeepProb { name: &'static str, keep_prob: f32 },

    #[snafu(display("Attention dropout rate must be in [0, 1), was {rate}"))]
    InvalidDropoutRate { rate: f32 },
}

/// Hyperparameters of the relation classification model.
///
/// Missing fields take their default values when deserializing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelHyperParams {
    /// Dropout rate of the attention weights.
    pub attention_dropout_rate: f32,

    /// Width of the additive and entity attention projections.
    pub attention_size: usize,

    /// Maximum relative distance of relative position attention.
    pub clip_k: usize,

    /// Keep probability of the output dropout.
    pub dropout_keep_prob: f32,

    /// Width of the word embeddings.
    pub embedding_size: usize,

    /// Hidden size of each encoder direction.
    pub hidden_size: usize,

    /// Width of the latent entity types.
    pub latent_size: usize,

    /// Maximum number of tokens in a sentence.
    pub max_sentence_length: usize,

    /// Number of self-attention heads.
    pub num_heads: usize,

    /// Number of latent entity types.
    pub num_type: usize,

    /// Keep probability of the encoder dropout.
    pub rnn_dropout_keep_prob: f32,
}

impl Default for ModelHyperParams {
    fn default() -> Self {
        Self {
            attention_dropout_rate: 0.0,
            attention_size: 50,
            clip_k: 10,
            dropout_keep_prob: 0.5,
            embedding_size: 300,
            hidden_size: 512,
            latent_size: 100,
            max_sentence_length: 102,
            num_heads: 4,
            num_type: 3,
            rnn_dropout_keep_prob: 0.8,
        }
    }
}

impl ModelHyperParams {
    /// Deserialize and validate hyperparameters from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, HyperParamsError> {
        let hyperparams: Self = serde_json::from_str(json).context(DeserializeSnafu)?;
        hyperparams.validate()?;
        Ok(hyperparams)
    }

    /// Deserialize and validate hyperparameters from a JSON reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, HyperParamsError> {
        let hyperparams: Self = serde_json::from_reader(reader).context(DeserializeSnafu)?;
        hyperparams.validate()?;
        Ok(hyperparams)
    }

    /// Check the probabilities and the head configuration.
    pub fn validate(&self) -> Result<(), HyperParamsError> {
        for (name, keep_prob) in [
            ("Dropout keep probability", self.dropout_keep_prob),
            ("RNN dropout keep probability", self.rnn_dropout_keep_prob),
        ] {
            ensure!(
                keep_prob > 0. && keep_prob <= 1.,
                InvalidKeepProbSnafu { name, keep_prob }
            );
        }

        ensure!(
            (0f32..1f32).contains(&self.attention_dropout_rate),
            InvalidDropoutRateSnafu {
                rate: self.attention_dropout_rate
            }
        );

        ensure!(
            self.num_heads > 0 && self.embedding_size % self.num_heads == 0,
            IndivisibleHeadsSnafu {
                embedding_size: self.embedding_size,
                num_heads: self.num_heads
            }
        );

        Ok(())
    }

    /// Width of the bidirectional encoder output.
    pub fn encoder_width(&self) -> usize {
        2 * self.hidden_size
    }

    /// Self-attention over the word embeddings.
    pub fn self_attention_config(&self) -> MultiHeadAttentionConfig {
        MultiHeadAttentionConfig::default()
            .query_width(self.embedding_size)
            .key_width(self.embedding_size)
            .num_units(self.embedding_size)
            .num_heads(self.num_heads)
            .sdpa(self.sdpa_config(None))
    }

    /// Self-attention over the word embeddings with relative positions.
    pub fn relative_self_attention_config(&self) -> MultiHeadAttentionConfig {
        let relative_positions = RelativePositionsConfig::default()
            .clip_k(self.clip_k)
            .seq_len(self.max_sentence_length);
        self.self_attention_config()
            .sdpa(self.sdpa_config(Some(relative_positions)))
    }

    /// Point-wise feed-forward layer after self-attention.
    pub fn feed_forward_config(&self) -> PointwiseFeedForwardConfig {
        PointwiseFeedForwardConfig::default()
            .input_width(self.embedding_size)
            .num_units([self.embedding_size / 2, self.embedding_size])
    }

    /// Entity-pair attention over the encoder output.
    pub fn entity_attention_config(&self) -> EntityAttentionConfig {
        EntityAttentionConfig::default()
            .input_width(self.encoder_width())
            .attention_size(self.attention_size)
    }

    /// Latent-type attention over the encoder output.
    pub fn latent_type_attention_config(&self) -> LatentTypeAttentionConfig {
        LatentTypeAttentionConfig::default()
            .input_width(self.encoder_width())
            .latent_size(self.latent_size)
            .num_type(self.num_type)
    }

    /// Additive attention pooling of the encoder output.
    pub fn additive_attention_config(&self) -> AdditiveAttentionConfig {
        AdditiveAttentionConfig::default()
            .input_width(self.encoder_width())
            .attention_size(self.attention_size)
            .return_alphas(true)
    }

    /// Dropout of the encoder output.
    pub fn rnn_dropout(&self) -> DropoutConfig {
        DropoutConfig::from_keep_prob(self.rnn_dropout_keep_prob)
    }

    /// Dropout before the classifier.
    pub fn output_dropout(&self) -> DropoutConfig {
        DropoutConfig::from_keep_prob(self.dropout_keep_prob)
    }

    fn sdpa_config(&self, relative_positions: Option<RelativePositionsConfig>) -> SDPAConfig {
        SDPAConfig::default()
            .dropout(Box::new(DropoutConfig::default().p(self.attention_dropout_rate)))
            .relative_positions(relative_positions)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::{HyperParamsError, ModelHyperParams};
    use crate::params::{ParamStore, Reuse};
    use crate::util::tests::pseudo_random_input;

    #[test]
    fn missing_fields_use_defaults() {
        let hyperparams = ModelHyperParams::from_json(r#"{"hidden_size": 128, "num_heads": 5}"#)
            .unwrap();
        assert_eq!(
            hyperparams,
            ModelHyperParams {
                hidden_size: 128,
                num_heads: 5,
                ..ModelHyperParams::default()
            }
        );
        assert_eq!(hyperparams.encoder_width(), 256);
    }

    #[test]
    fn from_reader_reads_json() {
        let json = br#"{"embedding_size": 8, "num_heads": 2, "clip_k": 3}"#;
        let hyperparams = ModelHyperParams::from_reader(&json[..]).unwrap();
        assert_eq!(hyperparams.embedding_size, 8);
        assert_eq!(hyperparams.clip_k, 3);
        assert_eq!(hyperparams.max_sentence_length, 102);
    }

    #[test]
    fn invalid_hyperparams_are_rejected() {
        assert!(matches!(
            ModelHyperParams::from_json(r#"{"dropout_keep_prob": 0.0}"#),
            Err(HyperParamsError::InvalidKeepProb { .. })
        ));
        assert!(matches!(
            ModelHyperParams::from_json(r#"{"rnn_dropout_keep_prob": 1.5}"#),
            Err(HyperParamsError::InvalidKeepProb { .. })
        ));
        assert!(matches!(
            ModelHyperParams::from_json(r#"{"attention_dropout_rate": 1.0}"#),
            Err(HyperParamsError::InvalidDropoutRate { .. })
        ));
        assert!(matches!(
            ModelHyperParams::from_json(r#"{"num_heads": 7}"#),
            Err(HyperParamsError::IndivisibleHeads {
                embedding_size: 300,
                num_heads: 7
            })
        ));
        assert!(matches!(
            ModelHyperParams::from_json(r#"{"hidden_size": "large"}"#),
            Err(HyperParamsError::Deserialize { .. })
        ));
    }

    #[test]
    fn dropout_configs_use_keep_probabilities() {
        let hyperparams = ModelHyperParams::default();
        assert!((hyperparams.output_dropout().probability() - 0.5).abs() < 1e-6);
        assert!((hyperparams.rnn_dropout().probability() - 0.2).abs() < 1e-6);
    }

    #[test]
    #[report]
    fn hyperparams_build_attention_layers() -> Result<(), Whatever> {
        let hyperparams = ModelHyperParams::from_json(
            r#"{
                "embedding_size": 8,
                "hidden_size": 3,
                "attention_size": 4,
                "max_sentence_length": 6,
                "num_heads": 2,
                "clip_k": 2,
                "latent_size": 5
            }"#,
        )
        .whatever_context("Cannot read hyperparameters")?;
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let device = Device::Cpu;

        let embeddings = pseudo_random_input(&[2, 6, 8], &device);
        let self_attention = hyperparams
            .relative_self_attention_config()
            .build(
                store
                    .scope("self_attention", Reuse::New)
                    .whatever_context("Cannot create scope")?,
            )
            .whatever_context("Cannot build self-attention")?;
        let attended = self_attention
            .forward_t(&embeddings, &embeddings, false)
            .whatever_context("Cannot apply self-attention")?;
        let feed_forward = hyperparams
            .feed_forward_config()
            .build(store.scope("feed_forward", Reuse::New).whatever_context("Cannot create scope")?)
            .whatever_context("Cannot build feed-forward layer")?;
        let transformed = feed_forward
            .forward(attended.output())
            .whatever_context("Cannot apply feed-forward layer")?;
        assert_eq!(transformed.dims(), &[2, 6, 8]);

        let encoded = pseudo_random_input(&[2, 6, hyperparams.encoder_width()], &device);
        let e1 = Tensor::new(&[0u32, 1], &device).whatever_context("Cannot create index")?;
        let e2 = Tensor::new(&[5u32, 3], &device).whatever_context("Cannot create index")?;

        let entity = hyperparams
            .entity_attention_config()
            .build(
                store
                    .scope("entity_attention", Reuse::New)
                    .whatever_context("Cannot create scope")?,
            )
            .whatever_context("Cannot build entity attention")?
            .forward(&encoded, &e1, &e2)
            .whatever_context("Cannot apply entity attention")?;
        assert_eq!(entity.output().dims(), &[2, 6, 4]);

        let latent = hyperparams
            .latent_type_attention_config()
            .build(store.scope("latent_type", Reuse::New).whatever_context("Cannot create scope")?)
            .whatever_context("Cannot build latent-type attention")?
            .forward(&encoded, &e1, &e2)
            .whatever_context("Cannot apply latent-type attention")?;
        assert_eq!(latent.e1_type().dims(), &[2, 5]);

        let pooled = hyperparams
            .additive_attention_config()
            .build(store.scope("attention", Reuse::New).whatever_context("Cannot create scope")?)
            .whatever_context("Cannot build additive attention")?
            .forward(&encoded)
            .whatever_context("Cannot apply additive attention")?;
        assert_eq!(pooled.output().dims(), &[2, 6]);
        assert!(pooled.alphas().is_some());

        Ok(())
    }
}
