pub mod error;
pub mod hyperparams;
pub mod layers;
pub mod params;
pub mod util;
