pub mod activation;

pub mod attention;

pub mod build_module;

pub mod dense;

pub mod dropout;

pub mod feedforward;

pub mod layer_norm;
