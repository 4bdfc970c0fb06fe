use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use crate::layers::activation::Activation;

/// Dense projection applied to every sequence element.
///
/// Computes `g(xW + b)`, where `g` is an optional activation. The kernel
/// is initialized with Xavier/Glorot uniform initialization and the bias
/// with zeros (_Glorot and Bengio, 2010_).
///
/// * _Glorot and Bengio, 2010_: https://proceedings.mlr.press/v9/glorot10a.html
#[derive(Clone, Debug)]
pub struct Dense {
    activation: Option<Activation>,
    linear: Linear,
}

impl Dense {
    /// Construct a dense layer.
    ///
    /// * `vb` - Variable store, the layer uses the `weight` and `bias`
    ///   parameters in its prefix.
    /// * `input_width` - Width of the input representations.
    /// * `output_width` - Width of the output representations.
    /// * `activation` - Non-linearity applied after the affine transformation.
    pub fn new(
        vb: VarBuilder,
        input_width: usize,
        output_width: usize,
        activation: Option<Activation>,
    ) -> Result<Self, candle_core::Error> {
        let weight = vb.get_with_hints(
            (output_width, input_width),
            "weight",
            xavier_uniform(input_width, output_width),
        )?;
        let bias = vb.get_with_hints(output_width, "bias", Init::Const(0.))?;

        Ok(Dense {
            activation,
            linear: Linear::new(weight, Some(bias)),
        })
    }

    /// Width of the input representations.
    pub fn input_width(&self) -> usize {
        self.linear.weight().dims()[1]
    }

    /// Width of the output representations.
    pub fn output_width(&self) -> usize {
        self.linear.weight().dims()[0]
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let xs = self.linear.forward(xs)?;
        match &self.activation {
            Some(activation) => activation.forward(&xs),
            None => Ok(xs),
        }
    }
}

/// Xavier/Glorot uniform initialization for a `fan_in x fan_out` kernel.
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6. / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}
