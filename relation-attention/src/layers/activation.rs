use candle_core::{Module, Tensor};
use serde::{Deserialize, Serialize};

/// Activation functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    Relu,

    /// Hyperbolic tangent.
    Tanh,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        use Activation::*;
        match self {
            Relu => xs.relu(),
            Tanh => xs.tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Module, Tensor};
    use ndarray::array;

    use super::Activation;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn activations_have_correct_output() {
        let xs = Tensor::new(&[-2f32, 0., 0.5], &Device::Cpu).unwrap();
        assert_tensor_eq!(
            Activation::Relu.forward(&xs).unwrap(),
            array![0f32, 0., 0.5],
            epsilon = 1e-6
        );
        assert_tensor_eq!(
            Activation::Tanh.forward(&xs).unwrap(),
            array![-0.9640276f32, 0., 0.46211716],
            epsilon = 1e-6
        );
    }

    #[test]
    fn activation_deserializes_from_snake_case() {
        let activation: Activation = serde_json::from_str("\"relu\"").unwrap();
        assert_eq!(activation, Activation::Relu);
    }
}
