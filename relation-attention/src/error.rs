//! Errors shared across layers.
//!
//! Every layer has its own error enum. Modules that are built through
//! trait objects report their errors as a [`BoxedError`].
use std::error::Error;

/// Boxed error of a module built through
/// [`BuildModule`](crate::layers::build_module::BuildModule).
pub type BoxedError = Box<dyn Error + Send + Sync + 'static>;
