use candle_core::ModuleT;
use candle_nn::{Dropout, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Errors for dropout configuration.
#[derive(Debug, Snafu)]
pub enum DropoutError {
    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidProbability { p: f32 },
}

/// Dropout configuration.
///
/// Dropout is only applied when a module is called with `train` set to
/// `true`, during inference the input is passed through as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropoutConfig {
    p: f32,
}

impl DropoutConfig {
    /// Dropout probability.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }

    /// Create the configuration from a keep probability.
    pub fn from_keep_prob(keep_prob: f32) -> Self {
        Self::default().p(1. - keep_prob)
    }

    /// Get the dropout probability.
    pub fn probability(&self) -> f32 {
        self.p
    }

    /// Check that the dropout probability is valid.
    pub fn validate(&self) -> Result<(), DropoutError> {
        ensure!(
            (0f32..1f32).contains(&self.p),
            InvalidProbabilitySnafu { p: self.p }
        );
        Ok(())
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

impl BuildModule for DropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        self.validate()?;
        Ok(Box::new(Dropout::new(self.p)))
    }
}
